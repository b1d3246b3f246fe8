//! Per-epoch learning curves and their report sinks
//!
//! The history is append-only, one record per completed epoch, and is not
//! persisted with checkpoints. At the end of a run it is handed to a
//! [`HistoryReport`] implementation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Phase averages of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Epoch index
    pub epoch: usize,
    /// Average training loss
    pub train_loss: f64,
    /// Average training top-1 precision
    pub train_acc: f64,
    /// Average validation loss
    pub val_loss: f64,
    /// Average validation top-1 precision
    pub val_acc: f64,
}

/// Four equal-length learning curves
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// First epoch covered by this history
    pub first_epoch: usize,
    pub train_loss: Vec<f64>,
    pub train_acc: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_acc: Vec<f64>,
}

impl History {
    /// Empty history whose first record will be `first_epoch`
    pub fn starting_at(first_epoch: usize) -> Self {
        Self {
            first_epoch,
            ..Self::default()
        }
    }

    /// Append one completed epoch
    pub fn push(&mut self, train: (f64, f64), val: (f64, f64)) {
        self.train_loss.push(train.0);
        self.train_acc.push(train.1);
        self.val_loss.push(val.0);
        self.val_acc.push(val.1);
    }

    pub fn len(&self) -> usize {
        self.train_loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train_loss.is_empty()
    }

    /// Record for absolute epoch index `epoch`, if present
    pub fn record(&self, epoch: usize) -> Option<EpochRecord> {
        let i = epoch.checked_sub(self.first_epoch)?;
        Some(EpochRecord {
            epoch,
            train_loss: *self.train_loss.get(i)?,
            train_acc: *self.train_acc.get(i)?,
            val_loss: *self.val_loss.get(i)?,
            val_acc: *self.val_acc.get(i)?,
        })
    }

    /// All records in epoch order
    pub fn records(&self) -> Vec<EpochRecord> {
        (0..self.len())
            .filter_map(|i| self.record(self.first_epoch + i))
            .collect()
    }
}

/// Consumer of the final history (plots, dashboards, files)
pub trait HistoryReport {
    /// Report name
    fn name(&self) -> &str;

    /// Publish the history, returning where it went if it was written to disk
    fn publish(&mut self, history: &History) -> Result<Option<PathBuf>>;
}

/// Writes the history as pretty JSON next to the other run outputs
pub struct JsonHistoryReport {
    path: PathBuf,
}

impl JsonHistoryReport {
    pub fn new(output_dir: impl AsRef<Path>, run_name: &str) -> Self {
        Self {
            path: output_dir.as_ref().join(format!("{}_history.json", run_name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a previously written report
    pub fn load(path: impl AsRef<Path>) -> Result<History> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl HistoryReport for JsonHistoryReport {
    fn name(&self) -> &str {
        "json"
    }

    fn publish(&mut self, history: &History) -> Result<Option<PathBuf>> {
        let lens = [
            history.train_loss.len(),
            history.train_acc.len(),
            history.val_loss.len(),
            history.val_acc.len(),
        ];
        if lens.iter().any(|&l| l != lens[0]) {
            return Err(Error::internal(format!("history curves have unequal lengths {:?}", lens)));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(history)?)?;
        info!("History written to {}", self.path.display());
        Ok(Some(self.path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_use_absolute_epochs() {
        let mut history = History::starting_at(3);
        history.push((1.0, 10.0), (1.5, 8.0));
        history.push((0.8, 20.0), (1.2, 12.0));

        assert_eq!(history.len(), 2);
        assert!(history.record(2).is_none());
        assert_eq!(history.record(4).unwrap().val_acc, 12.0);
        assert_eq!(history.records()[0].epoch, 3);
    }

    #[test]
    fn test_json_report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = History::starting_at(0);
        history.push((2.0, 5.0), (2.5, 4.0));

        let mut report = JsonHistoryReport::new(dir.path(), "TRN_test");
        let path = report.publish(&history).unwrap().unwrap();

        assert!(path.ends_with("TRN_test_history.json"));
        assert_eq!(JsonHistoryReport::load(&path).unwrap(), history);
    }

    #[test]
    fn test_json_report_keeps_f32_losses_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = History::starting_at(0);
        history.push((0.731_942_3f32 as f64, 50.0), (1.468_691_6f32 as f64, 33.333_333_333_333_336));

        let mut report = JsonHistoryReport::new(dir.path(), "TRN_f32");
        let path = report.publish(&history).unwrap().unwrap();
        let loaded = JsonHistoryReport::load(&path).unwrap();

        assert_eq!(loaded.val_loss[0].to_bits(), history.val_loss[0].to_bits());
        assert_eq!(loaded, history);
    }
}
