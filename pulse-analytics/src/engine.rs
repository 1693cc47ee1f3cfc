//! Engine facade orchestrating sample fetch, analytics, caching, and prefetch.

use crate::{
    baseline::{Baseline, compute_baselines},
    cache::{
        CacheStats, CoalescingCache,
        prefetch::{PrefetchQueue, PrefetchReceiver},
    },
    config::EngineConfig,
    error::EngineError,
    metric::{BaselineWindow, MetricKey, dedup_samples},
    source::SampleSource,
    spike::{SpikeResult, SpikeSeverity, detect_spike},
    trend::{TrendAnalysis, analyze_trend},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};
use vecmap::VecMap;

/// Degraded results never report confidence above this, so consumers can always distinguish
/// them from genuine analysis.
pub const LOW_CONFIDENCE_CEILING: f64 = 0.3;

/// Provenance of an [`AnalysisResult`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize,
)]
pub enum ResultSource {
    /// Computed on demand from freshly fetched samples.
    Computed,
    /// Served from a fresh cache entry.
    Cache,
    /// Degraded low-confidence result returned because the sample source was unavailable.
    Fallback,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Computed => "computed",
            ResultSource::Cache => "cache",
            ResultSource::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for ResultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provenance and cost metadata attached to every [`AnalysisResult`].
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct AnalysisMetadata {
    pub source: ResultSource,
    pub cache_hit: bool,
    /// Wall-clock time spent fetching samples from the source.
    pub load_time_ms: u64,
    /// Wall-clock time spent in the baseline/spike/trend calculators.
    pub compute_time_ms: u64,
    /// Overall confidence in `[0, 1]`; `<= 0.3` marks a degraded result.
    pub confidence: f64,
}

/// Complete analysis for one [`MetricKey`]: one [`Baseline`] per configured window, one
/// [`SpikeResult`], and one [`TrendAnalysis`], all derived from the same sample sequence.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct AnalysisResult {
    pub key: MetricKey,
    pub baselines: VecMap<BaselineWindow, Baseline>,
    pub spike: SpikeResult,
    pub trend: TrendAnalysis,
    pub metadata: AnalysisMetadata,
}

/// Operational counters exposed to the out-of-scope HTTP layer.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub prefetch_queue_depth: usize,
    pub prefetch_dropped: u64,
}

struct EngineInner<Src> {
    source: Src,
    config: EngineConfig,
    cache: CoalescingCache<AnalysisResult>,
    prefetch: PrefetchQueue,
}

/// Time-series analysis engine over a [`SampleSource`].
///
/// Cheap to clone (all clones share the cache and prefetch workers). Constructed explicitly
/// with its configuration; independent instances share nothing, so tests can run engines in
/// parallel without interference.
pub struct AnalysisEngine<Src> {
    inner: Arc<EngineInner<Src>>,
}

impl<Src> Clone for AnalysisEngine<Src> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Src> AnalysisEngine<Src>
where
    Src: SampleSource,
{
    /// Construct an engine and spawn its cache sweeper and prefetch worker pool.
    ///
    /// Background tasks hold only weak references (or a channel closed on drop), so dropping
    /// the last engine handle shuts them down.
    pub fn new(source: Src, config: EngineConfig) -> Self {
        let cache = CoalescingCache::new(&config);
        cache.spawn_sweeper(config.sweep_interval);

        let (prefetch, receiver) = PrefetchQueue::new(config.prefetch_queue_capacity);
        let engine = Self {
            inner: Arc::new(EngineInner {
                source,
                config,
                cache,
                prefetch,
            }),
        };
        engine.spawn_prefetch_workers(receiver);
        engine
    }

    /// Analyse `key`, serving from cache when a fresh result exists.
    ///
    /// With `force_refresh` the cache read is bypassed, but the computation still participates
    /// in single-flight coalescing, so a thundering herd of forced refreshes performs one
    /// upstream fetch.
    ///
    /// Source failures degrade to a cached-nothing, low-confidence fallback result unless
    /// `force_refresh` explicitly demanded fresh data; only [`EngineError::InvalidKey`] and
    /// [`EngineError::CoalescingTimeout`] otherwise surface as hard errors.
    pub async fn get_analysis(
        &self,
        key: &MetricKey,
        force_refresh: bool,
    ) -> Result<Arc<AnalysisResult>, EngineError> {
        self.inner.analysis(key, force_refresh, false).await
    }

    /// Enqueue a batch of keys for best-effort background computation, returning how many
    /// were accepted.
    ///
    /// Keys already cached fresh, malformed keys, and keys beyond the queue bound are
    /// skipped; warming failures are logged by the workers and never surface.
    pub fn warm(&self, keys: impl IntoIterator<Item = MetricKey>) -> usize {
        if self.inner.config.prefetch_queue_capacity == 0 {
            return 0;
        }
        keys.into_iter()
            .filter(|key| key.validate().is_ok())
            .filter(|key| !self.inner.cache.contains_fresh(key))
            .filter(|key| self.inner.prefetch.enqueue(key.clone()))
            .count()
    }

    /// Remove cached results matching an `asset:metric:timeframe` pattern (`*` wildcards),
    /// used when upstream samples are known to have changed out-of-band. Returns the removed
    /// entry count.
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.inner.cache.invalidate(pattern)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.inner.cache.stats(),
            prefetch_queue_depth: self.inner.prefetch.depth(),
            prefetch_dropped: self.inner.prefetch.dropped(),
        }
    }

    fn spawn_prefetch_workers(&self, receiver: PrefetchReceiver) {
        for worker in 0..self.inner.config.max_concurrent_prefetch.max(1) {
            let weak = Arc::downgrade(&self.inner);
            let receiver = receiver.clone();
            tokio::spawn(async move {
                while let Some(key) = receiver.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    // Prefetch failures are logged and swallowed; they must never surface to
                    // a user-facing caller.
                    match inner.analysis(&key, false, true).await {
                        Ok(_) => debug!(%key, worker, "prefetched analysis"),
                        Err(error) => warn!(%key, worker, %error, "prefetch failed"),
                    }
                }
            });
        }
    }
}

impl<Src> EngineInner<Src>
where
    Src: SampleSource,
{
    /// `background` requests come from the prefetch workers: they read the cache without
    /// touching the hit/miss counters (those track user-facing lookups only) and do not
    /// fan out further prefetches.
    async fn analysis(
        self: &Arc<Self>,
        key: &MetricKey,
        force_refresh: bool,
        background: bool,
    ) -> Result<Arc<AnalysisResult>, EngineError> {
        key.validate()?;

        if !force_refresh {
            let cached = if background {
                self.cache.peek(key)
            } else {
                self.cache.get(key)
            };
            if let Some(cached) = cached {
                debug!(%key, "analysis cache hit");
                return Ok(mark_cache_hit(&cached));
            }
        }

        let task = Arc::clone(self);
        let task_key = key.clone();
        let compute = move || async move { task.compute_analysis(task_key).await };

        let outcome = if force_refresh {
            self.cache.refresh(key, compute).await
        } else {
            self.cache.get_or_compute(key, compute).await
        };

        match outcome {
            Ok(result) => {
                if !background {
                    self.enqueue_adjacent(key);
                }
                Ok(result)
            }
            Err(error) if error.is_hard() || force_refresh => Err(error),
            Err(error) => {
                warn!(%key, %error, "analysis degraded to low-confidence fallback");
                Ok(Arc::new(self.fallback_result(key, &error)))
            }
        }
    }

    /// Fetch, dedup, and analyse samples for `key`. Runs inside the cache's single-flight
    /// slot on a detached task.
    async fn compute_analysis(
        self: Arc<Self>,
        key: MetricKey,
    ) -> Result<AnalysisResult, EngineError> {
        let now = Utc::now();
        // One fetch covers the widest baseline window and the requested timeframe.
        let span = self
            .config
            .max_baseline_window()
            .duration()
            .max(key.timeframe.duration());

        let load_started = Instant::now();
        let samples = tokio::time::timeout(
            self.config.request_timeout,
            self.source
                .fetch_samples(&key.asset, &key.metric, now - span, now),
        )
        .await
        .map_err(|_| {
            EngineError::SourceUnavailable(format!(
                "fetch for {key} timed out after {}ms",
                self.config.request_timeout.as_millis()
            ))
        })??;
        let load_time_ms = load_started.elapsed().as_millis() as u64;

        let compute_started = Instant::now();
        let samples = dedup_samples(samples);

        let baselines = compute_baselines(
            &samples,
            &self.config.baseline_windows,
            now,
            self.config.moving_average_len,
        );

        let window = key.timeframe.baseline_window();
        let spike_baseline = baselines
            .get(&window)
            .copied()
            .unwrap_or_else(|| Baseline::empty(window, now));
        let current = samples.last().map(|sample| sample.value).unwrap_or(0.0);
        let spike = detect_spike(
            &key.metric,
            current,
            &spike_baseline,
            &self.config.spike_thresholds,
        );

        let trend_cutoff = now - key.timeframe.duration();
        let trend_start = samples.partition_point(|sample| sample.time < trend_cutoff);
        let trend = analyze_trend(&samples[trend_start..], &self.config.trend);
        let compute_time_ms = compute_started.elapsed().as_millis() as u64;

        let confidence = if spike_baseline.low_confidence {
            trend.confidence.min(LOW_CONFIDENCE_CEILING)
        } else {
            trend.confidence
        };

        info!(
            %key,
            samples = samples.len(),
            severity = %spike.severity,
            direction = %trend.direction,
            load_time_ms,
            compute_time_ms,
            "computed analysis"
        );

        Ok(AnalysisResult {
            key,
            baselines,
            spike,
            trend,
            metadata: AnalysisMetadata {
                source: ResultSource::Computed,
                cache_hit: false,
                load_time_ms,
                compute_time_ms,
                confidence,
            },
        })
    }

    /// Degraded-but-renderable result for a source failure. Never cached, so the next call
    /// retries cleanly against an `ABSENT` entry.
    fn fallback_result(&self, key: &MetricKey, error: &EngineError) -> AnalysisResult {
        let now = Utc::now();
        let baselines = self
            .config
            .baseline_windows
            .iter()
            .map(|&window| (window, Baseline::empty(window, now)))
            .collect();

        AnalysisResult {
            key: key.clone(),
            baselines,
            spike: SpikeResult {
                is_spike: false,
                severity: SpikeSeverity::None,
                current_value: 0.0,
                baseline_value: 0.0,
                deviation_percent: 0.0,
                reason: format!("analysis degraded, sample source unavailable: {error}"),
            },
            trend: analyze_trend(&[], &self.config.trend),
            metadata: AnalysisMetadata {
                source: ResultSource::Fallback,
                cache_hit: false,
                load_time_ms: 0,
                compute_time_ms: 0,
                confidence: 0.0,
            },
        }
    }

    /// Queue the key's neighbouring timeframes for best-effort background warming, skipping
    /// any already cached fresh.
    fn enqueue_adjacent(&self, key: &MetricKey) {
        if self.config.prefetch_queue_capacity == 0 {
            return;
        }
        for adjacent in key.adjacent() {
            if !self.cache.contains_fresh(&adjacent) {
                self.prefetch.enqueue(adjacent);
            }
        }
    }
}

/// Re-stamp a cached result's provenance for the caller that hit it.
fn mark_cache_hit(cached: &Arc<AnalysisResult>) -> Arc<AnalysisResult> {
    let mut result = (**cached).clone();
    result.metadata.source = ResultSource::Cache;
    result.metadata.cache_hit = true;
    Arc::new(result)
}
