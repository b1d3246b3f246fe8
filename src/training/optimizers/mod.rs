//! Optimizer, learning-rate schedule and gradient clipping
//!
//! Parameters are organised into [`ParameterGroup`]s supplied by the model's
//! optimisation policy. Each group has fixed multipliers and a live
//! learning rate / weight decay that the scheduler rewrites once per epoch.

pub mod clipping;
pub mod schedulers;
pub mod sgd;

pub use clipping::{clip_grad_norm, ClipReport, GradientClipper};
pub use schedulers::StepDecayScheduler;
pub use sgd::GroupedSgd;

use candle_core::Var;
use serde::{Deserialize, Serialize};

/// Named set of trainable parameters sharing one optimisation policy
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    name: String,
    params: Vec<(String, Var)>,
    lr_mult: f64,
    decay_mult: f64,
    /// Live learning rate used by the next optimizer step
    pub lr: f64,
    /// Live weight decay used by the next optimizer step
    pub weight_decay: f64,
}

impl ParameterGroup {
    /// Create a group; the multipliers cannot change afterwards
    pub fn new(name: impl Into<String>, params: Vec<(String, Var)>, lr_mult: f64, decay_mult: f64) -> Self {
        Self {
            name: name.into(),
            params,
            lr_mult,
            decay_mult,
            lr: 0.0,
            weight_decay: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(name, var)` pairs in this group
    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn lr_mult(&self) -> f64 {
        self.lr_mult
    }

    pub fn decay_mult(&self) -> f64 {
        self.decay_mult
    }

    /// Current live settings
    pub fn hyper_params(&self) -> GroupHyperParams {
        GroupHyperParams {
            lr: self.lr,
            weight_decay: self.weight_decay,
        }
    }
}

/// Effective learning rate and weight decay of one group for one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupHyperParams {
    pub lr: f64,
    pub weight_decay: f64,
}
