//! Common utilities for testing the training pipeline

use candle_core::Device;
use tempfile::TempDir;

use crate::models::{SegmentConsensusNet, SegmentConsensusNetConfig};
use crate::training::config::PathsConfig;
use crate::training::data::{DataLoader, DataLoaderConfig, InMemoryDataset, SyntheticClips, SyntheticClipsConfig};
use crate::training::metrics::History;
use crate::training::TrainingConfig;

pub const NUM_SEGMENTS: usize = 3;
pub const FEATURE_DIM: usize = 6;
pub const HIDDEN_DIM: usize = 8;
pub const NUM_CLASS: usize = 4;

/// Create a test device (CPU for CI compatibility)
pub fn create_test_device() -> Device {
    Device::Cpu
}

/// Create a small configuration writing into `dir`
pub fn create_test_config(dir: &TempDir) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.model.arch = "resnet101".to_string();
    config.model.num_segments = NUM_SEGMENTS;
    config.model.num_class = NUM_CLASS;
    config.model.img_feature_dim = HIDDEN_DIM;
    config.optimizer.learning_rate = 0.01;
    config.optimizer.lr_steps = vec![2];
    config.optimizer.clip_gradient = Some(20.0);
    config.training.epochs = 3;
    config.training.batch_size = 4;
    config.training.print_freq = 2;
    config.training.seed = 5;
    config.paths = PathsConfig {
        root_log: dir.path().join("log"),
        root_model: dir.path().join("model"),
        root_output: dir.path().join("output"),
    };
    config
}

/// Reference model matching [`create_test_config`]
pub fn create_test_model(config: &TrainingConfig) -> SegmentConsensusNet {
    SegmentConsensusNet::new(
        SegmentConsensusNetConfig {
            num_segments: config.model.num_segments,
            feature_dim: FEATURE_DIM,
            hidden_dim: config.model.img_feature_dim,
            num_class: config.model.num_class,
            seed: config.training.seed,
        },
        &create_test_device(),
    )
    .expect("test model shape is valid")
}

/// Synthetic clips in batches of 4
pub fn create_test_loader(num_clips: usize, seed: u64, shuffle: bool) -> DataLoader<InMemoryDataset> {
    let data = SyntheticClips::generate(
        &SyntheticClipsConfig {
            num_clips,
            num_segments: NUM_SEGMENTS,
            feature_dim: FEATURE_DIM,
            num_class: NUM_CLASS,
            noise: 30.0,
            seed,
        },
        &crate::models::ArchProfile::for_arch("resnet101"),
        &create_test_device(),
    )
    .expect("synthetic clips are valid");
    let config = DataLoaderConfig {
        batch_size: 4,
        shuffle,
        drop_last: false,
        seed,
    };
    DataLoader::new(data, config, create_test_device()).expect("batch size is non-zero")
}

/// Assert that every curve in `history` holds finite values in range
pub fn assert_history_valid(history: &History) {
    for record in history.records() {
        assert!(record.train_loss.is_finite() && record.train_loss >= 0.0, "{:?}", record);
        assert!(record.val_loss.is_finite() && record.val_loss >= 0.0, "{:?}", record);
        assert!((0.0..=100.0).contains(&record.train_acc), "{:?}", record);
        assert!((0.0..=100.0).contains(&record.val_acc), "{:?}", record);
    }
}
