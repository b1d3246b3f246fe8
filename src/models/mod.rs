//! Model collaborator interface
//!
//! The training loop treats the backbone + consensus model as an opaque
//! predictor. Anything implementing [`VideoClassifier`] can be trained:
//! it maps an input batch to `[batch, num_classes]` logits, exposes mode
//! toggles and lists its parameters as optimisation policies.

pub mod consensus;

pub use consensus::{SegmentConsensusNet, SegmentConsensusNetConfig};

use std::ops::{Deref, DerefMut};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::optimizers::ParameterGroup;

/// Train / eval switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    Train,
    Eval,
}

/// Polymorphic video classifier driven by the trainer
pub trait VideoClassifier {
    /// Logits for one input batch
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Switch between training and evaluation behaviour
    fn set_mode(&mut self, mode: ModelMode);

    /// Current mode
    fn mode(&self) -> ModelMode;

    /// Freeze running statistics of every normalisation layer but the first
    fn set_partial_bn(&mut self, enabled: bool);

    /// Enable or disable gradient tracking through the parameters
    fn set_grad_enabled(&mut self, enabled: bool);

    /// Whether the forward pass currently records gradients
    fn grad_enabled(&self) -> bool;

    /// Named parameter groups with their lr / decay multipliers
    fn optim_policies(&self) -> Vec<ParameterGroup>;

    /// Backing storage for every persistent tensor (parameters and buffers)
    fn var_map(&self) -> &VarMap;
}

/// Disables gradient tracking on a model until dropped
pub struct NoGradScope<'a, M: VideoClassifier + ?Sized> {
    model: &'a mut M,
    previous: bool,
}

impl<'a, M: VideoClassifier + ?Sized> NoGradScope<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        let previous = model.grad_enabled();
        model.set_grad_enabled(false);
        Self { model, previous }
    }
}

impl<M: VideoClassifier + ?Sized> Deref for NoGradScope<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: VideoClassifier + ?Sized> DerefMut for NoGradScope<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: VideoClassifier + ?Sized> Drop for NoGradScope<'_, M> {
    fn drop(&mut self) {
        self.model.set_grad_enabled(self.previous);
    }
}

/// Input-pipeline capabilities of a backbone, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchProfile {
    /// Architecture name as configured
    pub name: String,
    /// Frames are fed BGR instead of RGB
    pub needs_channel_reorder: bool,
    /// Pixel values are scaled from 0..255 to 0..1
    pub needs_value_scaling: bool,
}

impl ArchProfile {
    /// Capability record for a configured architecture name
    pub fn for_arch(name: &str) -> Self {
        let caffe_style = matches!(name, "BNInception" | "InceptionV3");
        Self {
            name: name.to_string(),
            needs_channel_reorder: caffe_style,
            needs_value_scaling: !caffe_style,
        }
    }
}

/// Snapshot of every tensor in `var_map`
pub fn state_dict(var_map: &VarMap) -> Result<Vec<(String, Tensor)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?;
    let mut entries: Vec<(String, Tensor)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Insert a freshly initialised variable under `name`
pub fn register_var(var_map: &VarMap, name: &str, init: Tensor) -> Result<Var> {
    let var = Var::from_tensor(&init)?;
    var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?
        .insert(name.to_string(), var.clone());
    Ok(var)
}
