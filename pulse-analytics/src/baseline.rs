//! Rolling baseline statistics derived from a metric's own history.

use crate::metric::{BaselineWindow, Sample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vecmap::VecMap;

/// Default trailing sub-window length used for the [`Baseline`] moving average.
pub const DEFAULT_MOVING_AVERAGE_LEN: usize = 5;

/// Rolling summary statistics of a metric over one [`BaselineWindow`].
///
/// A `Baseline` with `sample_count < 2` cannot produce a meaningful standard deviation, so it
/// reports `stddev = 0` and is flagged `low_confidence`. This is a valid state, not a failure:
/// downstream spike detection caps severity instead of erroring.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct Baseline {
    pub window: BaselineWindow,
    pub mean: f64,
    pub stddev: f64,
    pub moving_average: f64,
    pub sample_count: usize,
    pub low_confidence: bool,
    pub computed_at: DateTime<Utc>,
}

impl Baseline {
    /// Degenerate baseline for an empty sample subsequence.
    pub fn empty(window: BaselineWindow, computed_at: DateTime<Utc>) -> Self {
        Self {
            window,
            mean: 0.0,
            stddev: 0.0,
            moving_average: 0.0,
            sample_count: 0,
            low_confidence: true,
            computed_at,
        }
    }
}

/// Compute one [`Baseline`] per requested window from a time-ordered sample sequence.
///
/// For each window the subsequence within `[now - window, now]` is selected, then:
/// - `mean` and population `stddev` over the subsequence,
/// - `moving_average` over the trailing `moving_average_len` samples (all samples if fewer).
///
/// Empty subsequences yield [`Baseline::empty`] rather than an error.
pub fn compute_baselines(
    samples: &[Sample],
    windows: &[BaselineWindow],
    now: DateTime<Utc>,
    moving_average_len: usize,
) -> VecMap<BaselineWindow, Baseline> {
    windows
        .iter()
        .map(|&window| {
            let cutoff = now - window.duration();
            let start = samples.partition_point(|sample| sample.time < cutoff);
            let in_window = &samples[start..];
            (window, compute_window(window, in_window, now, moving_average_len))
        })
        .collect()
}

fn compute_window(
    window: BaselineWindow,
    samples: &[Sample],
    now: DateTime<Utc>,
    moving_average_len: usize,
) -> Baseline {
    let count = samples.len();
    if count == 0 {
        return Baseline::empty(window, now);
    }

    let mean = samples.iter().map(|sample| sample.value).sum::<f64>() / count as f64;

    // Population standard deviation; a single sample degenerates to 0.
    let stddev = if count >= 2 {
        let variance = samples
            .iter()
            .map(|sample| {
                let delta = sample.value - mean;
                delta * delta
            })
            .sum::<f64>()
            / count as f64;
        variance.sqrt()
    } else {
        0.0
    };

    let trailing = &samples[count.saturating_sub(moving_average_len.max(1))..];
    let moving_average =
        trailing.iter().map(|sample| sample.value).sum::<f64>() / trailing.len() as f64;

    Baseline {
        window,
        mean,
        stddev,
        moving_average,
        sample_count: count,
        low_confidence: count < 2,
        computed_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Sample;
    use chrono::TimeDelta;

    fn series(now: DateTime<Utc>, hourly_values: &[f64]) -> Vec<Sample> {
        let count = hourly_values.len() as i64;
        hourly_values
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                Sample::new(now - TimeDelta::hours(count - index as i64), value)
            })
            .collect()
    }

    #[test]
    fn test_compute_baselines_empty_input_is_degenerate_not_error() {
        let now = Utc::now();
        let baselines = compute_baselines(&[], &BaselineWindow::ALL, now, 5);

        assert_eq!(baselines.len(), BaselineWindow::ALL.len());
        for (_, baseline) in baselines.iter() {
            assert_eq!(baseline.sample_count, 0);
            assert_eq!(baseline.mean, 0.0);
            assert_eq!(baseline.stddev, 0.0);
            assert!(baseline.low_confidence);
        }
    }

    #[test]
    fn test_compute_baselines_single_sample_is_low_confidence() {
        let now = Utc::now();
        let samples = series(now, &[42.0]);
        let baselines = compute_baselines(&samples, &[BaselineWindow::D7], now, 5);

        let baseline = baselines.get(&BaselineWindow::D7).unwrap();
        assert_eq!(baseline.sample_count, 1);
        assert_eq!(baseline.mean, 42.0);
        assert_eq!(baseline.stddev, 0.0);
        assert!(baseline.low_confidence);
    }

    #[test]
    fn test_compute_baselines_known_statistics() {
        let now = Utc::now();
        let samples = series(now, &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let baselines = compute_baselines(&samples, &[BaselineWindow::D7], now, 5);

        let baseline = baselines.get(&BaselineWindow::D7).unwrap();
        assert_eq!(baseline.sample_count, 8);
        assert!((baseline.mean - 5.0).abs() < 1e-12);
        // Population stddev of the classic series is exactly 2.
        assert!((baseline.stddev - 2.0).abs() < 1e-12);
        assert!(!baseline.low_confidence);
        assert!(baseline.stddev >= 0.0);
    }

    #[test]
    fn test_moving_average_uses_trailing_sub_window() {
        let now = Utc::now();
        let samples = series(now, &[1.0, 1.0, 1.0, 10.0, 10.0, 10.0, 10.0, 10.0]);
        let baselines = compute_baselines(&samples, &[BaselineWindow::D7], now, 5);

        let baseline = baselines.get(&BaselineWindow::D7).unwrap();
        assert!((baseline.moving_average - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_moving_average_with_fewer_samples_than_sub_window() {
        let now = Utc::now();
        let samples = series(now, &[2.0, 4.0]);
        let baselines = compute_baselines(&samples, &[BaselineWindow::D7], now, 5);

        let baseline = baselines.get(&BaselineWindow::D7).unwrap();
        assert!((baseline.moving_average - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_window_selection_excludes_samples_before_cutoff() {
        let now = Utc::now();
        let mut samples = vec![
            // Outside every window.
            Sample::new(now - TimeDelta::days(200), 1_000_000.0),
            // Inside 30d and 90d, outside 7d.
            Sample::new(now - TimeDelta::days(20), 50.0),
        ];
        samples.extend(series(now, &[10.0, 10.0, 10.0]));

        let baselines = compute_baselines(&samples, &BaselineWindow::ALL, now, 5);

        let week = baselines.get(&BaselineWindow::D7).unwrap();
        assert_eq!(week.sample_count, 3);
        assert!((week.mean - 10.0).abs() < 1e-12);

        let month = baselines.get(&BaselineWindow::D30).unwrap();
        assert_eq!(month.sample_count, 4);

        let quarter = baselines.get(&BaselineWindow::D90).unwrap();
        assert_eq!(quarter.sample_count, 4);
        assert!(quarter.mean < 1_000.0);
    }
}
