use crate::error::EngineError;
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{str::FromStr, time::Duration};
use thiserror::Error;

/// Timeframe over which an analysis request is evaluated.
///
/// Shorter timeframes change faster and are cheaper to recompute, so they carry a shorter
/// cache TTL (see [`Timeframe::default_ttl`]).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize,
)]
pub enum Timeframe {
    #[serde(rename = "24h")]
    H24,
    #[serde(rename = "7d")]
    D7,
    #[serde(rename = "30d")]
    D30,
    #[serde(rename = "90d")]
    D90,
}

impl Timeframe {
    /// All supported timeframes, ordered shortest to longest.
    pub const ALL: [Timeframe; 4] = [
        Timeframe::H24,
        Timeframe::D7,
        Timeframe::D30,
        Timeframe::D90,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::H24 => "24h",
            Timeframe::D7 => "7d",
            Timeframe::D30 => "30d",
            Timeframe::D90 => "90d",
        }
    }

    /// Wall-clock span covered by this timeframe.
    pub fn duration(&self) -> TimeDelta {
        match self {
            Timeframe::H24 => TimeDelta::hours(24),
            Timeframe::D7 => TimeDelta::days(7),
            Timeframe::D30 => TimeDelta::days(30),
            Timeframe::D90 => TimeDelta::days(90),
        }
    }

    /// Default cache TTL for analysis results computed over this timeframe.
    pub fn default_ttl(&self) -> Duration {
        match self {
            Timeframe::H24 => Duration::from_secs(5 * 60),
            Timeframe::D7 => Duration::from_secs(15 * 60),
            Timeframe::D30 | Timeframe::D90 => Duration::from_secs(30 * 60),
        }
    }

    /// Neighbouring timeframes in [`Timeframe::ALL`] order, used as prefetch candidates after an
    /// on-demand computation (a caller inspecting 24h data frequently pivots to 7d next).
    pub fn adjacent(self) -> impl Iterator<Item = Timeframe> {
        let index = Timeframe::ALL
            .iter()
            .position(|&timeframe| timeframe == self)
            .unwrap_or(0);

        let prev = index.checked_sub(1).map(|prev| Timeframe::ALL[prev]);
        let next = Timeframe::ALL.get(index + 1).copied();

        prev.into_iter().chain(next)
    }

    /// Baseline window a spike for this timeframe is judged against.
    ///
    /// There is no 24h baseline window (too few samples to be meaningful), so 24h requests are
    /// judged against the 7d window.
    pub fn baseline_window(&self) -> BaselineWindow {
        match self {
            Timeframe::H24 | Timeframe::D7 => BaselineWindow::D7,
            Timeframe::D30 => BaselineWindow::D30,
            Timeframe::D90 => BaselineWindow::D90,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unrecognised [`Timeframe`] or [`BaselineWindow`] string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised timeframe: {0}")]
pub struct ParseTimeframeError(pub String);

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "24h" => Ok(Timeframe::H24),
            "7d" => Ok(Timeframe::D7),
            "30d" => Ok(Timeframe::D30),
            "90d" => Ok(Timeframe::D90),
            other => Err(ParseTimeframeError(other.to_string())),
        }
    }
}

/// Rolling historical window a [`Baseline`](crate::baseline::Baseline) is derived over.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize,
)]
pub enum BaselineWindow {
    #[serde(rename = "7d")]
    D7,
    #[serde(rename = "30d")]
    D30,
    #[serde(rename = "90d")]
    D90,
}

impl BaselineWindow {
    /// All supported baseline windows, ordered shortest to longest.
    pub const ALL: [BaselineWindow; 3] = [
        BaselineWindow::D7,
        BaselineWindow::D30,
        BaselineWindow::D90,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineWindow::D7 => "7d",
            BaselineWindow::D30 => "30d",
            BaselineWindow::D90 => "90d",
        }
    }

    /// Wall-clock span covered by this window.
    pub fn duration(&self) -> TimeDelta {
        match self {
            BaselineWindow::D7 => TimeDelta::days(7),
            BaselineWindow::D30 => TimeDelta::days(30),
            BaselineWindow::D90 => TimeDelta::days(90),
        }
    }
}

impl std::fmt::Display for BaselineWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unique identifier for a cached analysis: one tracked asset, one of its metrics, and the
/// [`Timeframe`] the analysis covers.
///
/// Used as the cache and request-coalescing key, so equality and hashing are case-sensitive
/// over all three fields.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct MetricKey {
    pub asset: SmolStr,
    pub metric: SmolStr,
    pub timeframe: Timeframe,
}

impl MetricKey {
    pub fn new<A, M>(asset: A, metric: M, timeframe: Timeframe) -> Self
    where
        A: Into<SmolStr>,
        M: Into<SmolStr>,
    {
        Self {
            asset: asset.into(),
            metric: metric.into(),
            timeframe,
        }
    }

    /// Fail fast on malformed keys before they reach the cache or the sample source.
    ///
    /// The `:` separator is reserved for the [`std::fmt::Display`] form consumed by
    /// [`CoalescingCache::invalidate`](crate::cache::CoalescingCache::invalidate) patterns.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (field, value) in [("asset", &self.asset), ("metric", &self.metric)] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidKey(format!("empty {field} field")));
            }
            if value.contains(':') {
                return Err(EngineError::InvalidKey(format!(
                    "{field} field contains reserved separator ':': {value}"
                )));
            }
        }
        Ok(())
    }

    /// Keys for the same asset and metric over neighbouring timeframes, in prefetch priority
    /// order.
    pub fn adjacent(&self) -> impl Iterator<Item = MetricKey> {
        let asset = self.asset.clone();
        let metric = self.metric.clone();
        self.timeframe
            .adjacent()
            .map(move |timeframe| MetricKey::new(asset.clone(), metric.clone(), timeframe))
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.asset, self.metric, self.timeframe)
    }
}

/// Single observation of a tracked metric at a point in time.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize, Constructor)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Sort `samples` ascending by timestamp and collapse duplicate timestamps, keeping the latest
/// write for each.
///
/// Calculators require strictly increasing timestamps; sources backed by upserting stores can
/// legitimately return the same timestamp twice.
pub fn dedup_samples(mut samples: Vec<Sample>) -> Vec<Sample> {
    // Stable sort preserves write order within equal timestamps, so the last write survives
    // the reverse-dedup below.
    samples.sort_by_key(|sample| sample.time);
    samples.reverse();
    samples.dedup_by_key(|sample| sample.time);
    samples.reverse();
    samples
}
