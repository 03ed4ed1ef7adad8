//! Linear trend fitting over metric history

use super::{MetricThreshold, Trend};
use crate::shared::utils::linear_slope;

/// Slope per sample, relative to the window mean when the mean is non-zero
fn relative_slope(window: &[f64]) -> Option<f64> {
    let slope = linear_slope(window)?;
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    if mean.abs() > f64::EPSILON {
        Some(slope / mean.abs())
    } else {
        Some(slope)
    }
}

/// Classify the most recent `window` samples. A slope exactly at `epsilon`
/// counts as stable.
pub fn classify_trend(samples: &[f64], window: usize, epsilon: f64, higher_is_worse: bool) -> Trend {
    let window = window.max(2);
    if samples.len() < window {
        return Trend::InsufficientData;
    }

    let recent = &samples[samples.len() - window..];
    let slope = match relative_slope(recent) {
        Some(slope) if higher_is_worse => slope,
        Some(slope) => -slope,
        None => return Trend::InsufficientData,
    };

    if slope > epsilon {
        Trend::Degrading
    } else if slope < -epsilon {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

/// Seconds until the fitted line over `samples` reaches the critical level,
/// given one sample every `sample_interval_secs`. Zero when already there,
/// `None` when the line never gets there.
pub fn seconds_to_threshold(samples: &[f64], threshold: &MetricThreshold, sample_interval_secs: u64) -> Option<f64> {
    let slope = linear_slope(samples)?;
    let last = *samples.last()?;
    let gap = threshold.critical - last;

    let reached = if threshold.higher_is_worse { gap <= 0.0 } else { gap >= 0.0 };
    if reached {
        return Some(0.0);
    }
    if slope == 0.0 || gap.signum() != slope.signum() {
        return None;
    }

    Some(gap / slope * sample_interval_secs as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising(n: usize, start: f64, step: f64) -> Vec<f64> {
        (0..n).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn test_insufficient_until_window_filled() {
        let samples = rising(19, 100.0, 50.0);
        assert_eq!(classify_trend(&samples, 20, 0.01, true), Trend::InsufficientData);

        let samples = rising(20, 100.0, 50.0);
        assert_eq!(classify_trend(&samples, 20, 0.01, true), Trend::Degrading);
    }

    #[test]
    fn test_direction_respects_metric_polarity() {
        let falling = rising(20, 1.0, -0.02);
        assert_eq!(classify_trend(&falling, 20, 0.001, true), Trend::Improving);
        assert_eq!(classify_trend(&falling, 20, 0.001, false), Trend::Degrading);

        let flat = vec![42.0; 20];
        assert_eq!(classify_trend(&flat, 20, 0.01, true), Trend::Stable);
    }

    #[test]
    fn test_only_recent_window_counts() {
        let mut samples = rising(30, 100.0, 50.0);
        samples.extend(vec![500.0; 20]);
        assert_eq!(classify_trend(&samples, 20, 0.01, true), Trend::Stable);
    }

    #[test]
    fn test_seconds_to_threshold() {
        let threshold = MetricThreshold::new(1000.0, 3000.0);
        // Last sample 860, slope 40 per sample
        let samples = rising(20, 100.0, 40.0);
        let seconds = seconds_to_threshold(&samples, &threshold, 30).unwrap();
        assert!((seconds - 1605.0).abs() < 1e-6);

        assert_eq!(seconds_to_threshold(&rising(20, 900.0, -10.0), &threshold, 30), None);
        assert_eq!(seconds_to_threshold(&[3500.0, 3600.0], &threshold, 30), Some(0.0));
    }
}
