//! Classification criterion selection

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported loss types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    /// Negative log-likelihood over softmax outputs (cross entropy)
    Nll,
}

impl FromStr for LossType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nll" => Ok(Self::Nll),
            other => Err(Error::config(format!("Unknown loss type '{}'", other))),
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nll => write!(f, "nll"),
        }
    }
}

/// Loss function applied to `[batch, num_classes]` logits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Criterion {
    loss_type: LossType,
}

impl Criterion {
    pub fn new(loss_type: LossType) -> Self {
        Self { loss_type }
    }

    pub fn loss_type(&self) -> LossType {
        self.loss_type
    }

    /// Mean loss over the batch as a scalar tensor
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (batch, _) = logits.dims2()?;
        let targets = targets.flatten_all()?;
        if targets.dim(0)? != batch {
            return Err(Error::invalid_input(format!(
                "{} targets supplied for a batch of {}",
                targets.dim(0)?,
                batch
            )));
        }
        match self.loss_type {
            LossType::Nll => Ok(candle_nn::loss::cross_entropy(logits, &targets.to_dtype(DType::U32)?)?),
        }
    }
}
