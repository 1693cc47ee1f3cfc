//! Sample source seam between the engine and whatever holds raw metric history.
//!
//! Production deployments back [`SampleSource`] with a time-series database query or a
//! third-party market-data API. Both can be slow, rate-limited, or down, so implementations
//! report failures through [`SourceError`] and the engine degrades gracefully rather than
//! propagating them to user-facing callers.

use crate::metric::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated by a [`SampleSource`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("source request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

/// Read interface over a time-ordered store of raw metric samples.
///
/// Implementations may return fewer samples than the requested range covers (partial history
/// is expected for recently listed assets) but must return them ordered ascending by
/// timestamp. Deduplication is the engine's responsibility.
#[async_trait]
pub trait SampleSource: Send + Sync + 'static {
    async fn fetch_samples(
        &self,
        asset: &str,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SourceError>;
}

/// In-process [`SampleSource`] backed by a hash map of sample vectors.
///
/// Used by the runnable examples and integration tests; real deployments swap in a database
/// or HTTP backed implementation.
#[derive(Debug, Default)]
pub struct MemorySampleSource {
    series: RwLock<FnvHashMap<(SmolStr, SmolStr), Vec<Sample>>>,
}

impl MemorySampleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples to the series for `(asset, metric)`, keeping the series time-ordered.
    pub fn extend<A, M>(&self, asset: A, metric: M, samples: impl IntoIterator<Item = Sample>)
    where
        A: Into<SmolStr>,
        M: Into<SmolStr>,
    {
        let mut series = self.series.write();
        let entry = series.entry((asset.into(), metric.into())).or_default();
        entry.extend(samples);
        entry.sort_by_key(|sample| sample.time);
    }
}

#[async_trait]
impl SampleSource for MemorySampleSource {
    async fn fetch_samples(
        &self,
        asset: &str,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SourceError> {
        let series = self.series.read();
        let samples = series
            .get(&(SmolStr::new(asset), SmolStr::new(metric)))
            .map(|samples| {
                samples
                    .iter()
                    .filter(|sample| sample.time >= from && sample.time <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        Ok(samples)
    }
}
