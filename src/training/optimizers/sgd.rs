//! SGD optimizer with momentum over parameter groups
//!
//! Each group uses its own live learning rate and weight decay. Momentum
//! buffers are keyed by parameter name so they can be checkpointed and
//! restored alongside the model state.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::debug;

use super::{GroupHyperParams, ParameterGroup};
use crate::error::{Error, Result};

/// SGD optimizer with momentum
pub struct GroupedSgd {
    /// Parameter groups in policy order
    groups: Vec<ParameterGroup>,

    /// Momentum coefficient
    momentum: f64,

    /// Current step count
    step_count: usize,

    /// Momentum buffers
    momentum_buffers: HashMap<String, Tensor>,
}

impl GroupedSgd {
    /// Create a new optimizer; every group starts at `learning_rate` and
    /// `weight_decay` scaled by its multipliers
    pub fn new(mut groups: Vec<ParameterGroup>, learning_rate: f64, momentum: f64, weight_decay: f64) -> Result<Self> {
        if momentum < 0.0 {
            return Err(Error::config(format!("momentum must be non-negative, got {}", momentum)));
        }
        for group in groups.iter_mut() {
            group.lr = learning_rate * group.lr_mult();
            group.weight_decay = weight_decay * group.decay_mult();
        }

        Ok(Self {
            groups,
            momentum,
            step_count: 0,
            momentum_buffers: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    /// Overwrite the live settings of every group, in group order
    pub fn set_group_hyper_params(&mut self, settings: &[GroupHyperParams]) -> Result<()> {
        if settings.len() != self.groups.len() {
            return Err(Error::internal(format!(
                "{} group settings supplied for {} parameter groups",
                settings.len(),
                self.groups.len()
            )));
        }
        for (group, hp) in self.groups.iter_mut().zip(settings) {
            group.lr = hp.lr;
            group.weight_decay = hp.weight_decay;
        }
        Ok(())
    }

    /// Learning rate of the last group, the one shown in progress lines
    pub fn last_group_lr(&self) -> f64 {
        self.groups.last().map(|g| g.lr).unwrap_or(0.0)
    }

    /// All trainable variables, in group order
    pub fn all_vars(&self) -> Vec<Var> {
        self.groups
            .iter()
            .flat_map(|g| g.params().iter().map(|(_, v)| v.clone()))
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.groups.iter().map(|g| g.params().len()).sum()
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Apply one update using `grads`; parameters without a gradient are skipped
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for group in &self.groups {
            for (name, var) in group.params() {
                let Some(grad) = grads.get(var.as_tensor()) else {
                    continue;
                };

                let param = var.as_tensor();
                let effective_grad = if group.weight_decay != 0.0 {
                    (grad + (param * group.weight_decay)?)?
                } else {
                    grad.clone()
                };

                let update = if self.momentum > 0.0 {
                    // v_t = μ * v_{t-1} + g_t, seeded with g_0
                    let next = match self.momentum_buffers.get(name) {
                        Some(buf) => ((buf * self.momentum)? + &effective_grad)?,
                        None => effective_grad,
                    };
                    self.momentum_buffers.insert(name.clone(), next.clone());
                    next
                } else {
                    effective_grad
                };

                var.set(&(param - (update * group.lr)?)?)?;
            }
        }
        self.step_count += 1;
        debug!("SGD step {} applied to {} parameters", self.step_count, self.parameter_count());
        Ok(())
    }

    /// Momentum buffers for checkpointing
    pub fn momentum_buffers(&self) -> &HashMap<String, Tensor> {
        &self.momentum_buffers
    }

    /// Replace momentum buffers from a checkpoint; unknown names are rejected
    pub fn load_momentum_buffers(&mut self, buffers: HashMap<String, Tensor>) -> Result<()> {
        let known: HashMap<&str, &Var> = self
            .groups
            .iter()
            .flat_map(|g| g.params().iter().map(|(n, v)| (n.as_str(), v)))
            .collect();

        for (name, buf) in &buffers {
            match known.get(name.as_str()) {
                None => {
                    return Err(Error::incompatible_checkpoint(format!(
                        "momentum buffer for unknown parameter '{}'",
                        name
                    )))
                }
                Some(var) if var.as_tensor().dims() != buf.dims() => {
                    return Err(Error::incompatible_checkpoint(format!(
                        "momentum buffer '{}' has shape {:?}, parameter has {:?}",
                        name,
                        buf.dims(),
                        var.as_tensor().dims()
                    )))
                }
                Some(_) => {}
            }
        }
        self.momentum_buffers = buffers;
        Ok(())
    }
}
