//! Spike classification of a current metric value against its rolling baseline.

use crate::baseline::Baseline;
use serde::{Deserialize, Serialize};

/// Percentage deviation lower bounds for each spike severity tier.
///
/// Boundaries are inclusive on the lower bound of each tier: a deviation of exactly
/// `low` is classified [`SpikeSeverity::Low`]. The defaults are reasonable starting points,
/// not load-bearing business logic; tune per deployment.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct SpikeThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for SpikeThresholds {
    fn default() -> Self {
        Self {
            low: 50.0,
            medium: 100.0,
            high: 200.0,
        }
    }
}

impl SpikeThresholds {
    fn classify(&self, deviation_percent: f64) -> SpikeSeverity {
        let magnitude = deviation_percent.abs();
        if magnitude >= self.high {
            SpikeSeverity::High
        } else if magnitude >= self.medium {
            SpikeSeverity::Medium
        } else if magnitude >= self.low {
            SpikeSeverity::Low
        } else {
            SpikeSeverity::None
        }
    }
}

/// Severity tier of a detected spike.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
pub enum SpikeSeverity {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl SpikeSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpikeSeverity::None => "none",
            SpikeSeverity::Low => "low",
            SpikeSeverity::Medium => "medium",
            SpikeSeverity::High => "high",
        }
    }
}

impl std::fmt::Display for SpikeSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of judging a current value against a [`Baseline`].
///
/// Invariant: `severity != None` implies `is_spike == true`.
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct SpikeResult {
    pub is_spike: bool,
    pub severity: SpikeSeverity,
    pub current_value: f64,
    pub baseline_value: f64,
    pub deviation_percent: f64,
    pub reason: String,
}

/// Classify `current` against `baseline`. Pure; performs no I/O.
///
/// `deviation_percent = (current - baseline.mean) / baseline.mean * 100`, reported as `0`
/// when the baseline mean is zero (no division by zero, no NaN leak).
///
/// A `low_confidence` baseline caps severity at [`SpikeSeverity::Low`]: insufficient history
/// cannot justify a high-severity alert, and the reason states the data limitation.
pub fn detect_spike(
    metric: &str,
    current: f64,
    baseline: &Baseline,
    thresholds: &SpikeThresholds,
) -> SpikeResult {
    let deviation_percent = if baseline.mean == 0.0 {
        0.0
    } else {
        (current - baseline.mean) / baseline.mean * 100.0
    };

    let mut severity = thresholds.classify(deviation_percent);

    let reason = if baseline.low_confidence {
        severity = severity.min(SpikeSeverity::Low);
        format!(
            "{metric} deviates {deviation_percent:+.1}% from its {} baseline, but only {} \
             sample(s) of history are available so severity is capped at low",
            baseline.window, baseline.sample_count,
        )
    } else if severity == SpikeSeverity::None {
        format!(
            "{metric} is within the normal range of its {} baseline ({deviation_percent:+.1}%)",
            baseline.window,
        )
    } else {
        format!(
            "{metric} deviates {deviation_percent:+.1}% from its {} baseline mean of {:.4}",
            baseline.window, baseline.mean,
        )
    };

    SpikeResult {
        is_spike: severity != SpikeSeverity::None,
        severity,
        current_value: current,
        baseline_value: baseline.mean,
        deviation_percent,
        reason,
    }
}
