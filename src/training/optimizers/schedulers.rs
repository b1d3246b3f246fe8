//! Step-decay learning rate schedule
//!
//! The learning rate is multiplied by 0.1 for every threshold in `lr_steps`
//! that the epoch has reached. Weight decay is not scheduled; only the
//! group multipliers apply to it.

use tracing::debug;

use super::{GroupHyperParams, GroupedSgd, ParameterGroup};
use crate::error::{Error, Result};

/// Decay applied per crossed threshold
pub const STEP_DECAY: f64 = 0.1;

/// Epoch-indexed step decay over parameter groups
#[derive(Debug, Clone, PartialEq)]
pub struct StepDecayScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Ascending epoch thresholds
    lr_steps: Vec<usize>,

    /// Base weight decay
    base_weight_decay: f64,
}

impl StepDecayScheduler {
    /// Create a new step scheduler; `lr_steps` must be ascending
    pub fn new(base_lr: f64, lr_steps: Vec<usize>, base_weight_decay: f64) -> Result<Self> {
        if lr_steps.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::config(format!("lr_steps must be ascending, got {:?}", lr_steps)));
        }
        Ok(Self {
            base_lr,
            lr_steps,
            base_weight_decay,
        })
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn lr_steps(&self) -> &[usize] {
        &self.lr_steps
    }

    /// `0.1 ^ (number of thresholds <= epoch)`
    pub fn decay_factor(&self, epoch: usize) -> f64 {
        let crossed = self.lr_steps.iter().filter(|&&step| step <= epoch).count();
        STEP_DECAY.powi(crossed as i32)
    }

    /// Learning rate before group multipliers
    pub fn base_lr_at(&self, epoch: usize) -> f64 {
        self.base_lr * self.decay_factor(epoch)
    }

    /// Effective settings of every group at `epoch`
    pub fn compute(&self, epoch: usize, groups: &[ParameterGroup]) -> Vec<GroupHyperParams> {
        let lr = self.base_lr_at(epoch);
        groups
            .iter()
            .map(|g| GroupHyperParams {
                lr: lr * g.lr_mult(),
                weight_decay: self.base_weight_decay * g.decay_mult(),
            })
            .collect()
    }

    /// Rewrite the optimizer's live group settings for `epoch`
    pub fn apply(&self, epoch: usize, optimizer: &mut GroupedSgd) -> Result<Vec<GroupHyperParams>> {
        let settings = self.compute(epoch, optimizer.groups());
        optimizer.set_group_hyper_params(&settings)?;
        debug!("Epoch {} learning rates: {:?}", epoch, settings.iter().map(|s| s.lr).collect::<Vec<_>>());
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Var};
    use test_case::test_case;

    fn group(name: &str, lr_mult: f64, decay_mult: f64) -> ParameterGroup {
        let var = Var::new(&[0f32], &Device::Cpu).unwrap();
        ParameterGroup::new(name, vec![(name.to_string(), var)], lr_mult, decay_mult)
    }

    #[test_case(0, 1.0, 0.1 ; "before first step")]
    #[test_case(5, 1.0, 0.1 ; "between start and first step")]
    #[test_case(10, 0.1, 0.01 ; "on first step")]
    #[test_case(19, 0.1, 0.01 ; "before second step")]
    #[test_case(25, 0.01, 0.001 ; "after second step")]
    fn test_step_decay(epoch: usize, decay: f64, lr: f64) {
        let scheduler = StepDecayScheduler::new(0.1, vec![10, 20], 5e-4).unwrap();
        assert_relative_eq!(scheduler.decay_factor(epoch), decay, max_relative = 1e-12);
        assert_relative_eq!(scheduler.base_lr_at(epoch), lr, max_relative = 1e-12);
    }

    #[test]
    fn test_group_multipliers_apply_exactly() {
        let scheduler = StepDecayScheduler::new(0.1, vec![10, 20], 5e-4).unwrap();
        let groups = vec![group("a", 1.0, 1.0), group("b", 2.0, 0.0), group("c", 5.0, 2.0)];

        for epoch in [0, 10, 25] {
            let settings = scheduler.compute(epoch, &groups);
            let decay = scheduler.decay_factor(epoch);
            for (g, s) in groups.iter().zip(&settings) {
                assert_eq!(s.lr, 0.1 * decay * g.lr_mult());
                assert_eq!(s.weight_decay, 5e-4 * g.decay_mult());
            }
        }
    }

    #[test]
    fn test_apply_mutates_optimizer_in_place() {
        let scheduler = StepDecayScheduler::new(0.01, vec![1], 1e-4).unwrap();
        let mut opt = GroupedSgd::new(
            vec![group("a", 1.0, 1.0), group("b", 1.0, 0.0), group("c", 2.0, 1.0)],
            0.01,
            0.9,
            1e-4,
        )
        .unwrap();

        scheduler.apply(1, &mut opt).unwrap();
        let lrs: Vec<f64> = opt.groups().iter().map(|g| g.lr).collect();
        assert_relative_eq!(lrs[0], 0.001, max_relative = 1e-12);
        assert_relative_eq!(lrs[2], 0.002, max_relative = 1e-12);
        assert_eq!(opt.groups()[1].weight_decay, 0.0);
    }

    #[test]
    fn test_unsorted_steps_rejected() {
        assert!(StepDecayScheduler::new(0.1, vec![20, 10], 0.0).is_err());
    }

    #[test]
    fn test_duplicate_steps_count_twice() {
        let scheduler = StepDecayScheduler::new(1.0, vec![5, 5], 0.0).unwrap();
        assert_relative_eq!(scheduler.decay_factor(5), 0.01, max_relative = 1e-12);
    }
}
