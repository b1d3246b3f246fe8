//! Training infrastructure for TRN video classifiers
//!
//! This module provides the epoch loop and everything it coordinates: data
//! batching, the grouped SGD optimizer with its step-decay schedule, gradient
//! clipping, metric accumulation, progress logging and checkpointing.
//!
//! # Main Components
//!
//! - **Configuration**: JSON/YAML training configuration with fail-fast validation
//! - **Trainer**: train phase, eval phase and the epoch orchestrator
//! - **Data**: dataset and batch loader collaborators
//! - **Checkpoints**: latest/best safetensors slots, resume and pretrained transplant
//! - **Metrics**: running averages, top-k precision and learning-curve history
//! - **Optimizers**: grouped SGD, step decay and global-norm clipping
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use vidtrn::training::{TrainingConfig, Trainer, DataLoader};
//! use candle_core::Device;
//!
//! let config = TrainingConfig::from_file("trn.yaml")?;
//! let mut trainer = Trainer::new(config, model, Device::Cpu)?;
//! trainer.resume_from_config()?;
//!
//! let history = trainer.fit(&mut train_loader, &mut val_loader)?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod progress;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    DataConfig, DeviceType, ModelConfig, OptimizerConfig, PathsConfig, PretrainedConfig, RuntimeConfig,
    TrainingConfig, TrainingParams,
};

// Trainer re-exports
pub use trainer::{ResumeOutcome, RunOutcome, Trainer, TrainingState};

// Data re-exports
pub use data::{
    Batch, BatchLoader, ClipDataset, ClipSample, DataLoader, DataLoaderConfig, InMemoryDataset, SyntheticClips,
    SyntheticClipsConfig,
};

// Checkpoint re-exports
pub use checkpoints::{CheckpointManager, PretrainedArtifact, TrainingCheckpoint, TransplantReport};

// Metrics re-exports
pub use metrics::{
    topk_precision, EpochRecord, History, HistoryReport, JsonHistoryReport, PhaseMetrics, RunningMetric,
};

// Optimizer re-exports
pub use optimizers::{
    clip_grad_norm, ClipReport, GradientClipper, GroupHyperParams, GroupedSgd, ParameterGroup, StepDecayScheduler,
};

// Loss re-exports
pub use loss::{Criterion, LossType};

pub use progress::ProgressLog;
