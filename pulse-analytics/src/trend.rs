//! Least-squares trend fitting over a metric's sample history.

use crate::metric::Sample;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Number of trailing samples inspected when bucketing [`Momentum`].
const MOMENTUM_WINDOW: usize = 5;

/// Acceleration buckets, as mean absolute second difference relative to the series mean (%).
const MOMENTUM_MODERATE_PCT: f64 = 0.5;
const MOMENTUM_STRONG_PCT: f64 = 2.0;

/// Tunables for [`analyze_trend`]. Defaults are starting points, not business logic.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct TrendTuning {
    /// Predicted total change over the window (as % of the series mean) below which the trend
    /// is classified [`TrendDirection::Stable`].
    pub stable_threshold_pct: f64,
    /// Fractional change over the window that saturates `strength` at `1.0`.
    pub strength_scale_factor: f64,
    /// Sample count at which `confidence` is no longer scaled down for thin history.
    pub min_samples_for_full_confidence: usize,
}

impl Default for TrendTuning {
    fn default() -> Self {
        Self {
            stable_threshold_pct: 1.0,
            strength_scale_factor: 0.5,
            min_samples_for_full_confidence: 14,
        }
    }
}

/// Direction a metric is trending over the analysed window.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
pub enum TrendDirection {
    Up,
    Down,
    #[default]
    Stable,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Up => "up",
            TrendDirection::Down => "down",
            TrendDirection::Stable => "stable",
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Acceleration of recent values, bucketed from the second difference of a short trailing
/// window.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
pub enum Momentum {
    #[default]
    Weak,
    Moderate,
    Strong,
}

impl Momentum {
    pub fn as_str(&self) -> &'static str {
        match self {
            Momentum::Weak => "weak",
            Momentum::Moderate => "moderate",
            Momentum::Strong => "strong",
        }
    }
}

impl std::fmt::Display for Momentum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordinary least-squares fit of a sample sequence plus derived classifications.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct TrendAnalysis {
    pub direction: TrendDirection,
    /// Trend strength in `[0, 1]`.
    pub strength: f64,
    pub momentum: Momentum,
    /// Coefficient of variation of the fit residuals, `>= 0`.
    pub volatility: f64,
    /// `r_squared` scaled down when the sample count is thin, in `[0, 1]`.
    pub confidence: f64,
    /// Fitted value change per sample index.
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl TrendAnalysis {
    /// Degenerate analysis for 0 or 1 samples: stable, zero confidence, never an error.
    fn degenerate(intercept: f64) -> Self {
        Self {
            direction: TrendDirection::Stable,
            strength: 0.0,
            momentum: Momentum::Weak,
            volatility: 0.0,
            confidence: 0.0,
            slope: 0.0,
            intercept,
            r_squared: 0.0,
        }
    }
}

/// Fit a least-squares line through `samples` (value against sample index) and derive
/// direction, strength, momentum, volatility, and a confidence score.
///
/// `samples` must be ordered ascending by timestamp. Degenerate input (0 or 1 samples)
/// yields [`TrendDirection::Stable`] with `confidence = 0` rather than an error.
pub fn analyze_trend(samples: &[Sample], tuning: &TrendTuning) -> TrendAnalysis {
    let count = samples.len();
    if count < 2 {
        let intercept = samples.first().map(|sample| sample.value).unwrap_or(0.0);
        return TrendAnalysis::degenerate(intercept);
    }

    let n = count as f64;
    let mean = samples.iter().map(|sample| sample.value).sum::<f64>() / n;

    // OLS of value against the sample index. Index regression keeps the fit invariant to
    // irregular sampling gaps, which the upstream stores routinely produce.
    let sum_x = (0..count).map(|index| index as f64).sum::<f64>();
    let sum_xx = (0..count).map(|index| (index as f64).powi(2)).sum::<f64>();
    let sum_y = mean * n;
    let sum_xy = samples
        .iter()
        .enumerate()
        .map(|(index, sample)| index as f64 * sample.value)
        .sum::<f64>();

    let denominator = n * sum_xx - sum_x * sum_x;
    let slope = if denominator == 0.0 {
        0.0
    } else {
        (n * sum_xy - sum_x * sum_y) / denominator
    };
    let intercept = (sum_y - slope * sum_x) / n;

    let ss_res = samples
        .iter()
        .enumerate()
        .map(|(index, sample)| {
            let predicted = slope * index as f64 + intercept;
            let residual = sample.value - predicted;
            residual * residual
        })
        .sum::<f64>();
    let ss_tot = samples
        .iter()
        .map(|sample| {
            let delta = sample.value - mean;
            delta * delta
        })
        .sum::<f64>();

    let r_squared = if ss_tot == 0.0 {
        // Flat series: a zero-slope fit is exact, any residual noise means no explanatory power.
        if ss_res.abs() < f64::EPSILON { 1.0 } else { 0.0 }
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };

    // Predicted total change over the window, as a fraction of the series mean.
    let relative_change = if mean == 0.0 {
        0.0
    } else {
        slope * (n - 1.0) / mean.abs()
    };

    let direction = if relative_change.abs() * 100.0 < tuning.stable_threshold_pct {
        TrendDirection::Stable
    } else if slope > 0.0 {
        TrendDirection::Up
    } else {
        TrendDirection::Down
    };

    let strength = (relative_change.abs() / tuning.strength_scale_factor).min(1.0);

    let residual_stddev = (ss_res / n).sqrt();
    let volatility = if mean == 0.0 {
        0.0
    } else {
        residual_stddev / mean.abs()
    };

    let confidence =
        r_squared * (n / tuning.min_samples_for_full_confidence.max(1) as f64).min(1.0);

    TrendAnalysis {
        direction,
        strength,
        momentum: bucket_momentum(samples, mean),
        volatility,
        confidence,
        slope,
        intercept,
        r_squared,
    }
}

/// Mean absolute second difference of the trailing [`MOMENTUM_WINDOW`] values, relative to the
/// series mean, bucketed into weak/moderate/strong.
fn bucket_momentum(samples: &[Sample], mean: f64) -> Momentum {
    if samples.len() < 3 || mean == 0.0 {
        return Momentum::Weak;
    }

    let trailing = &samples[samples.len().saturating_sub(MOMENTUM_WINDOW)..];
    let second_diffs = trailing
        .iter()
        .map(|sample| sample.value)
        .tuple_windows()
        .map(|(previous, middle, next)| (next - 2.0 * middle + previous).abs())
        .collect::<Vec<_>>();

    if second_diffs.is_empty() {
        return Momentum::Weak;
    }

    let acceleration_pct =
        second_diffs.iter().sum::<f64>() / second_diffs.len() as f64 / mean.abs() * 100.0;

    if acceleration_pct >= MOMENTUM_STRONG_PCT {
        Momentum::Strong
    } else if acceleration_pct >= MOMENTUM_MODERATE_PCT {
        Momentum::Moderate
    } else {
        Momentum::Weak
    }
}
