//! VidTRN - training loop for Temporal Relation Network video classifiers
//!
//! The crate drives a segment-based action-recognition model through
//! epochs of grouped-SGD training and evaluation, with step-decay learning
//! rates, gradient clipping, best-model tracking and resumable checkpoints.
//! The model and the data pipeline are collaborators behind the
//! [`VideoClassifier`] and [`training::BatchLoader`] traits.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod models;
pub mod training;

// Re-exports
pub use error::{Error, Result};
pub use models::{ArchProfile, ModelMode, NoGradScope, SegmentConsensusNet, SegmentConsensusNetConfig, VideoClassifier};
pub use training::{CheckpointManager, DataLoader, History, Trainer, TrainingConfig};
