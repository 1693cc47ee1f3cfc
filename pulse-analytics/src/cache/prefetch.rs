//! Bounded producer/consumer queue feeding the background prefetch workers.
//!
//! Prefetching is strictly best-effort: when the queue is full, new candidates are dropped
//! (never blocked on) and the drop is counted. Workers run the normal coalescing
//! `get_or_compute` path, so a prefetch naturally merges with any concurrent foreground
//! request for the same key.

use crate::metric::MetricKey;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tracing::debug;

/// Producer half of the prefetch queue, held by the engine.
pub struct PrefetchQueue {
    tx: mpsc::Sender<MetricKey>,
    depth: Arc<AtomicUsize>,
    dropped: AtomicU64,
}

/// Consumer half, shared by the fixed pool of prefetch workers.
pub struct PrefetchReceiver {
    rx: Arc<Mutex<mpsc::Receiver<MetricKey>>>,
    depth: Arc<AtomicUsize>,
}

impl Clone for PrefetchReceiver {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl PrefetchQueue {
    pub fn new(capacity: usize) -> (Self, PrefetchReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: Arc::clone(&depth),
                dropped: AtomicU64::new(0),
            },
            PrefetchReceiver {
                rx: Arc::new(Mutex::new(rx)),
                depth,
            },
        )
    }

    /// Enqueue a prefetch candidate, dropping it if the queue is full. Returns whether the
    /// key was accepted.
    pub fn enqueue(&self, key: MetricKey) -> bool {
        match self.tx.try_send(key) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(key)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "prefetch queue full, dropping candidate");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PrefetchReceiver {
    /// Next queued key, or `None` once every producer handle has been dropped and the queue
    /// is drained (the worker pool's shutdown signal).
    pub async fn recv(&self) -> Option<MetricKey> {
        let key = self.rx.lock().await.recv().await;
        if key.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        key
    }
}
