//! Engine configuration.
//!
//! All tunables live here so deployments can load them from JSON alongside the rest of their
//! service configuration. Every field has a serde default, so a partial document is valid.

use crate::{
    baseline::DEFAULT_MOVING_AVERAGE_LEN,
    metric::{BaselineWindow, Timeframe},
    spike::SpikeThresholds,
    trend::TrendTuning,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vecmap::VecMap;

/// Configuration for an [`AnalysisEngine`](crate::engine::AnalysisEngine) instance.
///
/// Constructed explicitly and injected; there are no ambient singletons, so tests can run
/// independently configured engines in parallel.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache TTL per timeframe. Timeframes absent from the map fall back to
    /// [`Timeframe::default_ttl`].
    pub ttl_by_timeframe: VecMap<Timeframe, Duration>,

    /// Baseline windows computed for every analysis.
    pub baseline_windows: Vec<BaselineWindow>,

    /// Trailing sub-window length for the baseline moving average.
    pub moving_average_len: usize,

    /// Spike severity tier lower bounds.
    pub spike_thresholds: SpikeThresholds,

    /// Trend fit tunables.
    pub trend: TrendTuning,

    /// Budget for one caller's request, covering both the sample source fetch and waiting on
    /// another caller's in-flight computation.
    pub request_timeout: Duration,

    /// Background prefetch worker count (the concurrency cap for best-effort warming).
    pub max_concurrent_prefetch: usize,

    /// Bound on the prefetch queue; enqueues beyond it are dropped, never blocked on.
    /// `0` disables prefetching entirely.
    pub prefetch_queue_capacity: usize,

    /// Interval of the periodic sweep that evicts expired cache entries.
    pub sweep_interval: Duration,

    /// Shard count for the cache map. Must be non-zero.
    pub cache_shards: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ttl_by_timeframe: Timeframe::ALL
                .iter()
                .map(|&timeframe| (timeframe, timeframe.default_ttl()))
                .collect(),
            baseline_windows: BaselineWindow::ALL.to_vec(),
            moving_average_len: DEFAULT_MOVING_AVERAGE_LEN,
            spike_thresholds: SpikeThresholds::default(),
            trend: TrendTuning::default(),
            request_timeout: Duration::from_secs(30),
            max_concurrent_prefetch: 2,
            prefetch_queue_capacity: 64,
            sweep_interval: Duration::from_secs(60),
            cache_shards: 16,
        }
    }
}

impl EngineConfig {
    /// TTL applied to results computed for `timeframe`.
    pub fn ttl_for(&self, timeframe: Timeframe) -> Duration {
        self.ttl_by_timeframe
            .get(&timeframe)
            .copied()
            .unwrap_or_else(|| timeframe.default_ttl())
    }

    /// Widest configured baseline window, which bounds the sample fetch range.
    pub fn max_baseline_window(&self) -> BaselineWindow {
        self.baseline_windows
            .iter()
            .copied()
            .max()
            .unwrap_or(BaselineWindow::D90)
    }
}
