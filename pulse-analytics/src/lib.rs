//! # Pulse-Analytics
//! Time-series baseline, spike-detection & trend-analysis engine with a single-flight
//! coalescing cache, for periodically-sampled numeric metrics (price, on-chain flow,
//! liquidity-lock value, sentiment indices) of many tracked assets.
//!
//! ## Overview
//! For a given ([`MetricKey`]) the engine answers two questions in near-real time:
//! - is the current value of this metric anomalous relative to its own history
//!   ([`SpikeResult`]), and
//! - what direction and strength of trend is the metric exhibiting ([`TrendAnalysis`]).
//!
//! Both are derived from one sample sequence fetched through a [`SampleSource`] and served
//! through a [`CoalescingCache`] that guarantees **at most one in-flight computation per
//! key**, with every concurrent caller for the same key sharing that computation's result.
//! Successful on-demand computations opportunistically warm neighbouring timeframes through
//! a bounded, best-effort prefetch queue.
//!
//! ## Example
//! ```rust,no_run
//! use pulse_analytics::{
//!     AnalysisEngine, EngineConfig, MetricKey, Timeframe, source::MemorySampleSource,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = MemorySampleSource::new();
//!     let engine = AnalysisEngine::new(source, EngineConfig::default());
//!
//!     let key = MetricKey::new("sol", "price_usd", Timeframe::H24);
//!     let analysis = engine.get_analysis(&key, false).await.unwrap();
//!
//!     println!(
//!         "{key}: severity={} direction={} confidence={:.2}",
//!         analysis.spike.severity, analysis.trend.direction, analysis.metadata.confidence,
//!     );
//! }
//! ```

/// Rolling baseline statistics ([`Baseline`]) derived from a metric's own history.
pub mod baseline;

/// [`CoalescingCache`]: keyed result store with per-key TTL, single-flight request
/// coalescing, and the background prefetch queue.
pub mod cache;

/// [`EngineConfig`] and its tunables.
pub mod config;

/// [`AnalysisEngine`] facade orchestrating fetch, analytics, caching, and prefetch.
pub mod engine;

/// All errors generated in `pulse-analytics`.
pub mod error;

/// Core identifiers and sample types: [`MetricKey`], [`Timeframe`], [`Sample`].
pub mod metric;

/// [`SampleSource`] seam over raw metric history, plus an in-memory implementation.
pub mod source;

/// Spike classification ([`SpikeResult`]) of a current value against its baseline.
pub mod spike;

/// Least-squares trend fitting ([`TrendAnalysis`]) over a sample sequence.
pub mod trend;

pub use baseline::Baseline;
pub use cache::{CacheStats, CoalescingCache};
pub use config::EngineConfig;
pub use engine::{AnalysisEngine, AnalysisMetadata, AnalysisResult, EngineStats, ResultSource};
pub use error::EngineError;
pub use metric::{BaselineWindow, MetricKey, Sample, Timeframe};
pub use source::{SampleSource, SourceError};
pub use spike::{SpikeResult, SpikeSeverity, SpikeThresholds};
pub use trend::{Momentum, TrendAnalysis, TrendDirection, TrendTuning};
