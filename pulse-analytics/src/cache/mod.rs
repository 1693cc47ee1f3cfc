//! Keyed result cache with per-key TTL and single-flight request coalescing.
//!
//! The central correctness guarantee of this module is **at most one concurrent computation
//! per key**: the first caller to observe an absent or stale entry atomically claims the
//! right to compute, installs a shared completion channel, and every concurrent caller for
//! the same key awaits that channel instead of starting duplicate work.
//!
//! The key space is sharded over independent locks so unrelated keys never serialise on each
//! other, and no lock is ever held across a computation or an await point.

use crate::{
    config::EngineConfig,
    error::EngineError,
    metric::{MetricKey, Timeframe},
};
use fnv::{FnvHashMap, FnvHasher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::debug;
use vecmap::VecMap;

/// Best-effort background prefetching of likely-to-be-requested keys.
pub mod prefetch;

/// Counters describing cache effectiveness, exposed through
/// [`AnalysisEngine::stats`](crate::engine::AnalysisEngine::stats).
///
/// `hits`/`misses` count [`CoalescingCache::get`] lookups only; the compute path does not
/// touch them, so a caller pattern of read-then-compute counts each request exactly once.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct CacheStats {
    /// Live `READY` entries, including stale ones not yet swept.
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Computations currently in flight across all keys.
    pub in_flight: usize,
}

impl CacheStats {
    /// Fraction of lookups served from a fresh entry, `0.0` when nothing was looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Completion channel shared by every caller coalesced onto one in-flight computation.
type ResultChannel<T> = watch::Receiver<Option<Result<Arc<T>, EngineError>>>;

/// A stored `READY` result. Staleness is observed lazily on read and by the periodic sweep.
struct Entry<T> {
    value: Arc<T>,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> Entry<T> {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// Per-key state: `READY` holds a result, `COMPUTING` holds the shared completion channel.
/// `ABSENT` is represented by no map entry, and `STALE` by a `READY` entry past its TTL.
enum Slot<T> {
    Ready(Entry<T>),
    Computing { rx: ResultChannel<T> },
}

struct Inner<T> {
    shards: Vec<Mutex<FnvHashMap<MetricKey, Slot<T>>>>,
    ttl_by_timeframe: VecMap<Timeframe, Duration>,
    request_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    in_flight: AtomicUsize,
}

/// Sharded, TTL-expiring, request-coalescing cache keyed by [`MetricKey`].
///
/// Cheap to clone (all clones share state). Constructed per engine instance with explicit
/// configuration; there are no ambient singletons, so independent instances never interfere.
pub struct CoalescingCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CoalescingCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CoalescingCache<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(config: &EngineConfig) -> Self {
        let shard_count = config.cache_shards.max(1);
        Self {
            inner: Arc::new(Inner {
                shards: (0..shard_count)
                    .map(|_| Mutex::new(FnvHashMap::default()))
                    .collect(),
                ttl_by_timeframe: config.ttl_by_timeframe.clone(),
                request_timeout: config.request_timeout,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Fresh cached result for `key`, if any. Expired entries are evicted on observation.
    pub fn get(&self, key: &MetricKey) -> Option<Arc<T>> {
        let mut shard = self.inner.shard(key).lock();
        match shard.get(key) {
            Some(Slot::Ready(entry)) if entry.is_fresh() => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.value))
            }
            Some(Slot::Ready(_)) => {
                // Lazy expiry of a stale entry.
                shard.remove(key);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(Slot::Computing { .. }) | None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a fresh entry exists for `key`, without touching hit/miss counters.
    pub fn contains_fresh(&self, key: &MetricKey) -> bool {
        let shard = self.inner.shard(key).lock();
        matches!(shard.get(key), Some(Slot::Ready(entry)) if entry.is_fresh())
    }

    /// Fresh cached result for `key` without touching hit/miss counters or evicting stale
    /// entries. Background readers use this so warming never skews the user-facing hit rate.
    pub fn peek(&self, key: &MetricKey) -> Option<Arc<T>> {
        let shard = self.inner.shard(key).lock();
        match shard.get(key) {
            Some(Slot::Ready(entry)) if entry.is_fresh() => Some(Arc::clone(&entry.value)),
            _ => None,
        }
    }

    /// Return the fresh cached result for `key`, or coalesce onto / initiate a computation.
    ///
    /// `compute` runs on a detached task, so a caller that cancels or times out while waiting
    /// never aborts the shared computation: its result is still stored for other waiters and
    /// subsequent callers. A waiter exceeding the request timeout fails with
    /// [`EngineError::CoalescingTimeout`] alone; a failed computation clears the key back to
    /// `ABSENT` and propagates the failure to every waiter.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &MetricKey,
        compute: F,
    ) -> Result<Arc<T>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        self.get_or_compute_inner(key, false, compute).await
    }

    /// [`CoalescingCache::get_or_compute`] that treats a fresh `READY` entry as needing
    /// recomputation, while still coalescing with any computation already in flight.
    pub async fn refresh<F, Fut>(&self, key: &MetricKey, compute: F) -> Result<Arc<T>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        self.get_or_compute_inner(key, true, compute).await
    }

    async fn get_or_compute_inner<F, Fut>(
        &self,
        key: &MetricKey,
        force: bool,
        compute: F,
    ) -> Result<Arc<T>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        enum Action<T> {
            Hit(Arc<T>),
            Wait(ResultChannel<T>),
            Compute(watch::Sender<Option<Result<Arc<T>, EngineError>>>),
        }

        // The ABSENT/STALE -> COMPUTING transition happens under the shard lock, so exactly
        // one caller wins the right to compute. The lock is released before any await.
        let action = {
            let mut shard = self.inner.shard(key).lock();
            match shard.get(key) {
                Some(Slot::Ready(entry)) if !force && entry.is_fresh() => {
                    Action::Hit(Arc::clone(&entry.value))
                }
                Some(Slot::Computing { rx }) => Action::Wait(rx.clone()),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    shard.insert(key.clone(), Slot::Computing { rx });
                    self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
                    Action::Compute(tx)
                }
            }
        };

        match action {
            Action::Hit(value) => Ok(value),
            Action::Wait(rx) => self.await_result(key, rx).await,
            Action::Compute(tx) => {
                let rx = tx.subscribe();
                let inner = Arc::clone(&self.inner);
                let task_key = key.clone();
                let future = compute();
                tokio::spawn(async move {
                    // If the computation panics, the guard clears the COMPUTING slot and the
                    // in-flight counter before `tx` drops, so the key recovers to ABSENT
                    // instead of wedging every later caller on a dead channel.
                    let mut guard = CompletionGuard {
                        inner: Arc::clone(&inner),
                        key: task_key.clone(),
                        armed: true,
                    };
                    let result = future.await;
                    guard.armed = false;
                    inner.complete(&task_key, result, tx);
                });
                self.await_result(key, rx).await
            }
        }
    }

    async fn await_result(
        &self,
        key: &MetricKey,
        mut rx: ResultChannel<T>,
    ) -> Result<Arc<T>, EngineError> {
        let budget = self.inner.request_timeout;
        let outcome = tokio::time::timeout(budget, async {
            loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    // Sender dropped without publishing: the computation task panicked.
                    return Err(EngineError::ComputationAborted(key.to_string()));
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            // Only this waiter fails; the shared computation continues unaffected.
            Err(_elapsed) => Err(EngineError::CoalescingTimeout {
                key: key.to_string(),
                waited_ms: budget.as_millis() as u64,
            }),
        }
    }

    /// Remove every `READY` entry whose key matches `pattern` and return the removed count.
    ///
    /// Patterns are `:`-separated `asset:metric:timeframe` segments where `*` (or a missing
    /// trailing segment) matches anything, e.g. `"sol"` or `"sol:*"` drops every cached
    /// analysis for asset `sol`, and `"*:price_usd:24h"` drops one metric across assets.
    /// In-flight computations are left to complete; their freshly computed result is stored
    /// as normal.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let pattern = KeyPattern::parse(pattern);
        let mut removed = 0;
        for shard in &self.inner.shards {
            shard.lock().retain(|key, slot| {
                let matched = matches!(slot, Slot::Ready(_)) && pattern.matches(key);
                if matched {
                    removed += 1;
                }
                !matched
            });
        }
        debug!(removed, "invalidated analysis cache entries");
        removed
    }

    /// Evict every expired `READY` entry now, returning the evicted count.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Spawn the periodic sweep task. The task holds only a weak reference and exits when the
    /// last cache handle is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let evicted = inner.sweep();
                if evicted > 0 {
                    debug!(evicted, "swept expired analysis cache entries");
                }
            }
        });
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self
                .inner
                .shards
                .iter()
                .map(|shard| {
                    shard
                        .lock()
                        .values()
                        .filter(|slot| matches!(slot, Slot::Ready(_)))
                        .count()
                })
                .sum(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl<T> Inner<T> {
    fn shard(&self, key: &MetricKey) -> &Mutex<FnvHashMap<MetricKey, Slot<T>>> {
        let mut hasher = FnvHasher::default();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn ttl_for(&self, timeframe: Timeframe) -> Duration {
        self.ttl_by_timeframe
            .get(&timeframe)
            .copied()
            .unwrap_or_else(|| timeframe.default_ttl())
    }

    /// Publish the outcome of an in-flight computation: store `READY` on success, clear the
    /// key back to `ABSENT` on failure, then wake every waiter.
    ///
    /// Single-flight guarantees no second computation for this key overlapped ours, so the
    /// stored entry always carries a `stored_at` at least as new as anything previously
    /// observed for the key.
    fn complete(
        &self,
        key: &MetricKey,
        result: Result<T, EngineError>,
        tx: watch::Sender<Option<Result<Arc<T>, EngineError>>>,
    ) {
        let shared = match result {
            Ok(value) => {
                let value = Arc::new(value);
                let entry = Entry {
                    value: Arc::clone(&value),
                    stored_at: Instant::now(),
                    ttl: self.ttl_for(key.timeframe),
                };
                self.shard(key).lock().insert(key.clone(), Slot::Ready(entry));
                Ok(value)
            }
            Err(error) => {
                let mut shard = self.shard(key).lock();
                if matches!(shard.get(key), Some(Slot::Computing { .. })) {
                    shard.remove(key);
                }
                Err(error)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        // send_replace never fails, even if every waiter already gave up.
        tx.send_replace(Some(shared));
    }

    /// Clear a `COMPUTING` slot whose computation task died without publishing a result.
    fn abort(&self, key: &MetricKey) {
        {
            let mut shard = self.shard(key).lock();
            if matches!(shard.get(key), Some(Slot::Computing { .. })) {
                shard.remove(key);
            }
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn sweep(&self) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            shard.lock().retain(|_, slot| {
                let expired = matches!(slot, Slot::Ready(entry) if !entry.is_fresh());
                if expired {
                    evicted += 1;
                }
                !expired
            });
        }
        evicted
    }
}

/// Armed for the lifetime of a computation task: when the task unwinds before publishing,
/// the drop handler restores the key to `ABSENT`. Locals drop before the captured `tx`, so
/// the slot is already cleared by the time waiters observe the closed channel.
struct CompletionGuard<T> {
    inner: Arc<Inner<T>>,
    key: MetricKey,
    armed: bool,
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.abort(&self.key);
        }
    }
}

/// Parsed `asset:metric:timeframe` invalidation pattern. `None` segments are wildcards.
struct KeyPattern {
    segments: [Option<String>; 3],
}

impl KeyPattern {
    fn parse(pattern: &str) -> Self {
        let mut segments = [None, None, None];
        for (index, segment) in pattern.splitn(3, ':').enumerate() {
            if segment != "*" && !segment.is_empty() {
                segments[index] = Some(segment.to_string());
            }
        }
        Self { segments }
    }

    fn matches(&self, key: &MetricKey) -> bool {
        let fields = [key.asset.as_str(), key.metric.as_str(), key.timeframe.as_str()];
        self.segments
            .iter()
            .zip(fields)
            .all(|(segment, field)| segment.as_deref().is_none_or(|segment| segment == field))
    }
}
