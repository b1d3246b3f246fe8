//! Batching data loader over a [`ClipDataset`]

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{Batch, BatchLoader, ClipDataset};
use crate::error::{Error, Result};

/// Batching behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Clips per batch
    pub batch_size: usize,
    /// Reshuffle every epoch
    pub shuffle: bool,
    /// Drop a trailing partial batch
    pub drop_last: bool,
    /// Shuffle seed; the epoch index is mixed in so every epoch differs but
    /// is reproducible
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            shuffle: true,
            drop_last: false,
            seed: 42,
        }
    }
}

/// Collates clips into batches in (optionally shuffled) index order
pub struct DataLoader<D: ClipDataset> {
    dataset: D,
    config: DataLoaderConfig,
    device: Device,
}

impl<D: ClipDataset> DataLoader<D> {
    pub fn new(dataset: D, config: DataLoaderConfig, device: Device) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("batch size must be greater than 0"));
        }
        Ok(Self {
            dataset,
            config,
            device,
        })
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Sample order for `epoch`
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    fn collate(&self, indices: &[usize]) -> Result<Batch> {
        let mut frames = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            let sample = self.dataset.get(i)?;
            frames.push(sample.frames);
            labels.push(sample.label);
        }
        Ok(Batch {
            input: Tensor::stack(&frames, 0)?.to_device(&self.device)?,
            target: Tensor::new(labels.as_slice(), &self.device)?,
        })
    }
}

impl<D: ClipDataset> BatchLoader for DataLoader<D> {
    fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    fn epoch_batches(&mut self, epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>> {
        let order = self.epoch_order(epoch);
        let batch_size = self.config.batch_size;
        let drop_last = self.config.drop_last;

        let chunks: Vec<Vec<usize>> = order
            .chunks(batch_size)
            .filter(|c| !drop_last || c.len() == batch_size)
            .map(|c| c.to_vec())
            .collect();

        let this = &*self;
        Ok(Box::new(chunks.into_iter().map(move |chunk| this.collate(&chunk))))
    }
}
