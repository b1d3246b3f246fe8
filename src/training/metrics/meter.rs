//! Running average tracker for scalar observations
//!
//! One [`RunningMetric`] is created per metric per phase (loss, top-1,
//! batch time, data time) and discarded once its average has been read.

use serde::{Deserialize, Serialize};

/// Current value, cumulative sum, count and average of a scalar series
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMetric {
    /// Most recent observation
    pub val: f64,

    /// Weighted sum of all observations
    pub sum: f64,

    /// Total weight observed
    pub count: f64,

    /// `sum / count`, or 0 before the first observation
    pub avg: f64,
}

impl RunningMetric {
    /// Create an empty metric
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` observed `weight` times (typically the batch size).
    ///
    /// The weight is not validated; callers pass non-negative sizes.
    pub fn update(&mut self, value: f64, weight: usize) {
        self.update_weighted(value, weight as f64);
    }

    /// Same as [`update`](Self::update) with a fractional weight
    pub fn update_weighted(&mut self, value: f64, weight: f64) {
        self.val = value;
        self.sum += value * weight;
        self.count += weight;
        if self.count > 0.0 {
            self.avg = self.sum / self.count;
        }
    }

    /// Return to the freshly constructed state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether any weight has been observed
    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_empty_metric_reports_zero() {
        let metric = RunningMetric::new();
        assert_eq!(metric.avg, 0.0);
        assert!(metric.is_empty());
    }

    #[test]
    fn test_weighted_average() {
        let mut metric = RunningMetric::new();
        metric.update(2.0, 3);
        metric.update(4.0, 1);

        assert_eq!(metric.val, 4.0);
        assert_eq!(metric.count, 4.0);
        assert_relative_eq!(metric.avg, 10.0 / 4.0);
    }

    #[test]
    fn test_zero_weight_keeps_average() {
        let mut metric = RunningMetric::new();
        metric.update(1.0, 2);
        metric.update(100.0, 0);

        assert_eq!(metric.val, 100.0);
        assert_relative_eq!(metric.avg, 1.0);
    }

    #[test]
    fn test_reset_matches_new() {
        let mut metric = RunningMetric::new();
        metric.update(3.5, 8);
        metric.reset();
        assert_eq!(metric, RunningMetric::new());
    }

    proptest! {
        #[test]
        fn prop_average_is_weighted_mean(
            obs in prop::collection::vec((-1000.0f64..1000.0, 1usize..64), 1..50)
        ) {
            let mut metric = RunningMetric::new();
            for (value, weight) in &obs {
                metric.update(*value, *weight);
            }

            let num: f64 = obs.iter().map(|(v, n)| v * *n as f64).sum();
            let den: f64 = obs.iter().map(|(_, n)| *n as f64).sum();
            prop_assert!((metric.avg - num / den).abs() <= 1e-9 * (1.0 + (num / den).abs()));

            metric.reset();
            prop_assert_eq!(metric, RunningMetric::new());
        }
    }
}
