//! Metric accumulation, accuracy and learning-curve history

pub mod accuracy;
pub mod history;
pub mod meter;

pub use accuracy::topk_precision;
pub use history::{EpochRecord, History, HistoryReport, JsonHistoryReport};
pub use meter::RunningMetric;

use serde::{Deserialize, Serialize};

/// Final averages of one train or eval phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    /// Average loss weighted by batch size
    pub loss: f64,
    /// Average top-1 precision weighted by batch size
    pub top1: f64,
    /// Number of batches processed
    pub batches: usize,
}

impl PhaseMetrics {
    /// Pair used by [`History::push`]
    pub fn as_pair(&self) -> (f64, f64) {
        (self.loss, self.top1)
    }
}

/// Meters owned by one phase
#[derive(Debug, Clone, Default)]
pub struct PhaseMeters {
    pub batch_time: RunningMetric,
    pub data_time: RunningMetric,
    pub losses: RunningMetric,
    pub top1: RunningMetric,
}

impl PhaseMeters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Averages after the last batch
    pub fn finish(&self, batches: usize) -> PhaseMetrics {
        PhaseMetrics {
            loss: self.losses.avg,
            top1: self.top1.avg,
            batches,
        }
    }
}
