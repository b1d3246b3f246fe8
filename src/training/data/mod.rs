//! Data collaborator interface for the training loop
//!
//! Frame sampling and decoding live outside this crate. The trainer only
//! needs something that yields `(input, target)` batches in order, once per
//! epoch, and knows how many batches an epoch has.

pub mod datasets;
pub mod loaders;

pub use datasets::{InMemoryDataset, SyntheticClips, SyntheticClipsConfig};
pub use loaders::{DataLoader, DataLoaderConfig};

use candle_core::Tensor;

use crate::error::Result;

/// One clip: `[num_segments, feature_dim]` frames and an integer label
#[derive(Debug, Clone)]
pub struct ClipSample {
    pub frames: Tensor,
    pub label: u32,
}

/// Random-access collection of clips
pub trait ClipDataset {
    /// Get the number of clips in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a clip by index
    fn get(&self, index: usize) -> Result<ClipSample>;
}

/// A collated mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, num_segments, feature_dim]`
    pub input: Tensor,
    /// `[batch]` labels
    pub target: Tensor,
}

impl Batch {
    pub fn size(&self) -> Result<usize> {
        Ok(self.input.dim(0)?)
    }
}

/// Ordered producer of batches, restarted every epoch
pub trait BatchLoader {
    /// Batches produced per epoch
    fn num_batches(&self) -> usize;

    /// Iterate the batches of `epoch`
    fn epoch_batches(&mut self, epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>>;
}
