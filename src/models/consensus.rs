//! Reference segment-consensus classifier
//!
//! A deliberately small TSN-shaped model: a per-segment linear backbone
//! with running-statistics normalisation, average consensus over the
//! segments and a linear classifier. It lets the CLI and the tests drive
//! the training loop end to end without a real video backbone.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{register_var, ModelMode, VideoClassifier};
use crate::error::{Error, Result};
use crate::training::optimizers::ParameterGroup;

const NORM_EPS: f64 = 1e-5;
const NORM_MOMENTUM: f64 = 0.1;

/// Shape and initialisation of [`SegmentConsensusNet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConsensusNetConfig {
    /// Segments per clip
    pub num_segments: usize,
    /// Features per segment
    pub feature_dim: usize,
    /// Width of the per-segment embedding
    pub hidden_dim: usize,
    /// Output classes
    pub num_class: usize,
    /// Initialisation seed
    pub seed: u64,
}

/// Normalisation over the feature axis using running statistics
struct RunningNorm {
    mean: Var,
    var: Var,
}

impl RunningNorm {
    fn new(var_map: &VarMap, prefix: &str, dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            mean: register_var(var_map, &format!("{}.running_mean", prefix), Tensor::zeros(dim, DType::F32, device)?)?,
            var: register_var(var_map, &format!("{}.running_var", prefix), Tensor::ones(dim, DType::F32, device)?)?,
        })
    }

    /// `x` is `[rows, dim]`; statistics are folded in first when `update` is set
    fn forward(&self, x: &Tensor, update: bool) -> Result<Tensor> {
        if update {
            let detached = x.detach();
            let batch_mean = detached.mean(0)?;
            let centered = detached.broadcast_sub(&batch_mean)?;
            let batch_var = centered.sqr()?.mean(0)?;

            let mean = ((self.mean.as_tensor() * (1.0 - NORM_MOMENTUM))? + (batch_mean * NORM_MOMENTUM)?)?;
            let var = ((self.var.as_tensor() * (1.0 - NORM_MOMENTUM))? + (batch_var * NORM_MOMENTUM)?)?;
            self.mean.set(&mean)?;
            self.var.set(&var)?;
        }

        let denom = (self.var.as_tensor().detach() + NORM_EPS)?.sqrt()?;
        Ok(x.broadcast_sub(&self.mean.as_tensor().detach())?.broadcast_div(&denom)?)
    }
}

/// Linear per-segment backbone + average consensus
pub struct SegmentConsensusNet {
    config: SegmentConsensusNetConfig,
    var_map: VarMap,
    norm0: RunningNorm,
    fc1_weight: Var,
    fc1_bias: Var,
    norm1: RunningNorm,
    fc_weight: Var,
    fc_bias: Var,
    mode: ModelMode,
    partial_bn: bool,
    grad_enabled: bool,
}

impl SegmentConsensusNet {
    pub fn new(config: SegmentConsensusNetConfig, device: &Device) -> Result<Self> {
        if config.num_segments == 0 || config.feature_dim == 0 || config.hidden_dim == 0 || config.num_class == 0 {
            return Err(Error::config(format!("degenerate model shape {:?}", config)));
        }

        let var_map = VarMap::new();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut gaussian = |rows: usize, cols: usize| -> Result<Tensor> {
            let std = (1.0 / cols as f32).sqrt();
            let dist = Normal::new(0.0f32, std).map_err(|e| Error::internal(e.to_string()))?;
            let data: Vec<f32> = (0..rows * cols).map(|_| dist.sample(&mut rng)).collect();
            Ok(Tensor::from_vec(data, (rows, cols), device)?)
        };

        let fc1_w = gaussian(config.hidden_dim, config.feature_dim)?;
        let fc_w = gaussian(config.num_class, config.hidden_dim)?;

        let norm0 = RunningNorm::new(&var_map, "base.norm0", config.feature_dim, device)?;
        let fc1_weight = register_var(&var_map, "base.fc1.weight", fc1_w)?;
        let fc1_bias = register_var(&var_map, "base.fc1.bias", Tensor::zeros(config.hidden_dim, DType::F32, device)?)?;
        let norm1 = RunningNorm::new(&var_map, "base.norm1", config.hidden_dim, device)?;
        let fc_weight = register_var(&var_map, "consensus.fc.weight", fc_w)?;
        let fc_bias = register_var(&var_map, "consensus.fc.bias", Tensor::zeros(config.num_class, DType::F32, device)?)?;

        debug!(
            "SegmentConsensusNet: {} segments x {} features -> {} hidden -> {} classes",
            config.num_segments, config.feature_dim, config.hidden_dim, config.num_class
        );

        Ok(Self {
            config,
            var_map,
            norm0,
            fc1_weight,
            fc1_bias,
            norm1,
            fc_weight,
            fc_bias,
            mode: ModelMode::Train,
            partial_bn: true,
            grad_enabled: true,
        })
    }

    pub fn config(&self) -> &SegmentConsensusNetConfig {
        &self.config
    }

    pub fn partial_bn(&self) -> bool {
        self.partial_bn
    }

    fn param(&self, var: &Var) -> Tensor {
        if self.grad_enabled {
            var.as_tensor().clone()
        } else {
            var.as_tensor().detach()
        }
    }
}

impl VideoClassifier for SegmentConsensusNet {
    /// `input` is `[batch, num_segments, feature_dim]`
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (batch, segments, features) = input.dims3()?;
        if segments != self.config.num_segments || features != self.config.feature_dim {
            return Err(Error::invalid_input(format!(
                "expected [_, {}, {}] input, got {:?}",
                self.config.num_segments,
                self.config.feature_dim,
                input.dims()
            )));
        }

        let training = self.mode == ModelMode::Train;
        let x = input.to_dtype(DType::F32)?.reshape((batch * segments, features))?;

        let x = self.norm0.forward(&x, training)?;
        let h = x
            .matmul(&self.param(&self.fc1_weight).t()?)?
            .broadcast_add(&self.param(&self.fc1_bias))?;
        let h = self.norm1.forward(&h, training && !self.partial_bn)?.relu()?;

        let clip = h.reshape((batch, segments, self.config.hidden_dim))?.mean(1)?;
        let logits = clip
            .matmul(&self.param(&self.fc_weight).t()?)?
            .broadcast_add(&self.param(&self.fc_bias))?;
        Ok(logits)
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_partial_bn(&mut self, enabled: bool) {
        self.partial_bn = enabled;
    }

    fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }

    fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    fn optim_policies(&self) -> Vec<ParameterGroup> {
        vec![
            ParameterGroup::new("first_weight", vec![("base.fc1.weight".to_string(), self.fc1_weight.clone())], 1.0, 1.0),
            ParameterGroup::new("first_bias", vec![("base.fc1.bias".to_string(), self.fc1_bias.clone())], 2.0, 0.0),
            ParameterGroup::new("normal_weight", vec![("consensus.fc.weight".to_string(), self.fc_weight.clone())], 1.0, 1.0),
            ParameterGroup::new("normal_bias", vec![("consensus.fc.bias".to_string(), self.fc_bias.clone())], 2.0, 0.0),
        ]
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{state_dict, NoGradScope};

    fn config() -> SegmentConsensusNetConfig {
        SegmentConsensusNetConfig {
            num_segments: 3,
            feature_dim: 4,
            hidden_dim: 8,
            num_class: 5,
            seed: 7,
        }
    }

    fn input(batch: usize) -> Tensor {
        let data: Vec<f32> = (0..batch * 12).map(|i| (i % 7) as f32 - 3.0).collect();
        Tensor::from_vec(data, (batch, 3, 4), &Device::Cpu).unwrap()
    }

    fn running_mean(model: &SegmentConsensusNet, layer: &str) -> Vec<f32> {
        state_dict(model.var_map())
            .unwrap()
            .into_iter()
            .find(|(n, _)| n == &format!("{}.running_mean", layer))
            .unwrap()
            .1
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let model = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        let logits = model.forward(&input(2)).unwrap();
        assert_eq!(logits.dims(), &[2, 5]);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        let b = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        let wa = a.fc1_weight.as_tensor().to_vec2::<f32>().unwrap();
        let wb = b.fc1_weight.as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(wa, wb);
    }

    #[test]
    fn test_wrong_segment_count_rejected() {
        let model = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        let bad = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(model.forward(&bad), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_partial_bn_freezes_later_layers() {
        let mut model = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        model.set_partial_bn(true);
        model.forward(&input(2)).unwrap();

        assert!(running_mean(&model, "base.norm0").iter().any(|&v| v != 0.0));
        assert!(running_mean(&model, "base.norm1").iter().all(|&v| v == 0.0));

        model.set_partial_bn(false);
        model.forward(&input(2)).unwrap();
        assert!(running_mean(&model, "base.norm1").iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_eval_mode_keeps_statistics() {
        let mut model = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        model.set_mode(ModelMode::Eval);
        model.forward(&input(2)).unwrap();
        assert!(running_mean(&model, "base.norm0").iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_no_grad_scope_restores_tracking() {
        let mut model = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        {
            let scoped = NoGradScope::new(&mut model);
            assert!(!scoped.grad_enabled());
            let loss = scoped.forward(&input(1)).unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            assert!(grads.get(scoped.fc_weight.as_tensor()).is_none());
        }
        assert!(model.grad_enabled());
    }

    #[test]
    fn test_policies_follow_tsn_layout() {
        let model = SegmentConsensusNet::new(config(), &Device::Cpu).unwrap();
        let policies = model.optim_policies();
        let summary: Vec<(&str, f64, f64)> = policies
            .iter()
            .map(|g| (g.name(), g.lr_mult(), g.decay_mult()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("first_weight", 1.0, 1.0),
                ("first_bias", 2.0, 0.0),
                ("normal_weight", 1.0, 1.0),
                ("normal_bias", 2.0, 0.0),
            ]
        );
    }
}
