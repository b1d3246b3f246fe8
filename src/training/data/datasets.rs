//! Dataset implementations
//!
//! [`InMemoryDataset`] holds pre-decoded clips. [`SyntheticClips`] builds a
//! seeded, class-separable dataset used for smoke runs of the CLI and for
//! tests; it respects the backbone's [`ArchProfile`] the same way a real
//! frame pipeline would (channel order and value range).

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::{ClipDataset, ClipSample};
use crate::error::{Error, Result};
use crate::models::ArchProfile;

/// Clips kept in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<ClipSample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<ClipSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[ClipSample] {
        &self.samples
    }
}

impl ClipDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<ClipSample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| Error::invalid_input(format!("clip index {} out of range ({})", index, self.samples.len())))
    }
}

/// Parameters of the synthetic clip generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticClipsConfig {
    pub num_clips: usize,
    pub num_segments: usize,
    /// Features per segment; laid out as three equal channel planes when
    /// divisible by 3
    pub feature_dim: usize,
    pub num_class: usize,
    /// Standard deviation of per-segment noise in pixel units
    pub noise: f32,
    pub seed: u64,
}

/// Generator of class-conditional clips
pub struct SyntheticClips;

impl SyntheticClips {
    /// Each class gets a prototype in 0..255 pixel space; clips are the
    /// prototype plus Gaussian noise, then adapted to `profile`.
    pub fn generate(config: &SyntheticClipsConfig, profile: &ArchProfile, device: &Device) -> Result<InMemoryDataset> {
        if config.num_class == 0 || config.num_segments == 0 || config.feature_dim == 0 {
            return Err(Error::config(format!("degenerate synthetic dataset {:?}", config)));
        }
        let noise = Normal::new(0.0f32, config.noise).map_err(|e| Error::config(e.to_string()))?;

        // Prototypes share the seed so train and val splits with different
        // clip seeds still describe the same classes.
        let mut proto_rng = StdRng::seed_from_u64(0x7472_6e00 ^ config.num_class as u64);
        let prototypes: Vec<Vec<f32>> = (0..config.num_class)
            .map(|_| (0..config.feature_dim).map(|_| proto_rng.random_range(0.0f32..255.0)).collect())
            .collect();

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut samples = Vec::with_capacity(config.num_clips);
        for i in 0..config.num_clips {
            let label = (i % config.num_class) as u32;
            let proto = &prototypes[label as usize];

            let mut frames = Vec::with_capacity(config.num_segments * config.feature_dim);
            for _ in 0..config.num_segments {
                let segment: Vec<f32> = proto
                    .iter()
                    .map(|&p| (p + noise.sample(&mut rng)).clamp(0.0, 255.0))
                    .collect();
                frames.extend(adapt_segment(segment, profile));
            }

            samples.push(ClipSample {
                frames: Tensor::from_vec(frames, (config.num_segments, config.feature_dim), device)?,
                label,
            });
        }
        Ok(InMemoryDataset::new(samples))
    }
}

/// Apply channel order and value range expected by the backbone
fn adapt_segment(mut segment: Vec<f32>, profile: &ArchProfile) -> Vec<f32> {
    if profile.needs_channel_reorder && segment.len() % 3 == 0 {
        let plane = segment.len() / 3;
        let (r, rest) = segment.split_at_mut(plane);
        let (_, b) = rest.split_at_mut(plane);
        r.swap_with_slice(b);
    }
    if profile.needs_value_scaling {
        segment.iter_mut().for_each(|v| *v /= 255.0);
    }
    segment
}
