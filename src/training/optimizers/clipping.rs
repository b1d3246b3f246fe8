//! Global L2 gradient-norm clipping

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use tracing::info;

use crate::error::Result;

/// Outcome of one clipping pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipReport {
    /// Global norm before any rescaling
    pub total_norm: f64,
    /// Whether gradients were rescaled
    pub was_clipped: bool,
    /// Scale applied to every gradient, 1.0 when untouched
    pub coefficient: f64,
}

/// Rescale the gradients of `params` so that their global L2 norm does not
/// exceed `max_norm`. Gradients are replaced in `grads`.
pub fn clip_grad_norm(params: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<ClipReport> {
    let mut total_sq = 0.0f64;
    for var in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_sq += grad.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
        }
    }
    let total_norm = total_sq.sqrt();

    if total_norm <= max_norm {
        return Ok(ClipReport {
            total_norm,
            was_clipped: false,
            coefficient: 1.0,
        });
    }

    let coefficient = max_norm / total_norm;
    for var in params {
        let scaled = match grads.get(var.as_tensor()) {
            Some(grad) => (grad * coefficient)?,
            None => continue,
        };
        grads.insert(var.as_tensor(), scaled);
    }

    Ok(ClipReport {
        total_norm,
        was_clipped: true,
        coefficient,
    })
}

/// Optional clipping stage applied between backward and the optimizer step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientClipper {
    max_norm: Option<f64>,
}

impl GradientClipper {
    /// `None` disables clipping entirely
    pub fn new(max_norm: Option<f64>) -> Self {
        Self { max_norm }
    }

    pub fn max_norm(&self) -> Option<f64> {
        self.max_norm
    }

    /// Clip if enabled; returns `None` when the stage is disabled
    pub fn apply(&self, params: &[Var], grads: &mut GradStore) -> Result<Option<ClipReport>> {
        let Some(max_norm) = self.max_norm else {
            return Ok(None);
        };
        let report = clip_grad_norm(params, grads, max_norm)?;
        if report.was_clipped {
            info!(
                "clipping gradient: {:.4} with coef {:.4}",
                report.total_norm, report.coefficient
            );
        }
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    /// Gradient of sum(var * [6, 8]) is [6, 8], norm 10
    fn norm_ten() -> (Var, GradStore) {
        let var = Var::new(&[0f32, 0.0], &Device::Cpu).unwrap();
        let coef = Tensor::new(&[6f32, 8.0], &Device::Cpu).unwrap();
        let grads = var.as_tensor().mul(&coef).unwrap().sum_all().unwrap().backward().unwrap();
        (var, grads)
    }

    fn grad_values(var: &Var, grads: &GradStore) -> Vec<f32> {
        grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_clips_to_max_norm() {
        let (var, mut grads) = norm_ten();
        let report = clip_grad_norm(&[var.clone()], &mut grads, 5.0).unwrap();

        assert_eq!(report.total_norm, 10.0);
        assert!(report.was_clipped);
        assert_eq!(report.coefficient, 0.5);
        assert_eq!(grad_values(&var, &grads), vec![3.0, 4.0]);
    }

    #[test]
    fn test_leaves_small_gradients_alone() {
        let (var, mut grads) = norm_ten();
        let report = clip_grad_norm(&[var.clone()], &mut grads, 20.0).unwrap();

        assert_eq!(report.total_norm, 10.0);
        assert!(!report.was_clipped);
        assert_eq!(grad_values(&var, &grads), vec![6.0, 8.0]);
    }

    #[test]
    fn test_disabled_clipper_is_noop() {
        let (var, mut grads) = norm_ten();
        let clipper = GradientClipper::new(None);

        assert!(clipper.apply(&[var.clone()], &mut grads).unwrap().is_none());
        assert_eq!(grad_values(&var, &grads), vec![6.0, 8.0]);
    }

    #[test]
    fn test_norm_spans_all_parameters() {
        let a = Var::new(&[0f32], &Device::Cpu).unwrap();
        let b = Var::new(&[0f32], &Device::Cpu).unwrap();
        let loss = ((a.as_tensor() * 3.0).unwrap() + (b.as_tensor() * 4.0).unwrap()).unwrap();
        let mut grads = loss.sum_all().unwrap().backward().unwrap();

        let report = clip_grad_norm(&[a.clone(), b.clone()], &mut grads, 1.0).unwrap();
        assert_eq!(report.total_norm, 5.0);
        approx::assert_relative_eq!(grad_values(&a, &grads)[0], 0.6, epsilon = 1e-6);
        approx::assert_relative_eq!(grad_values(&b, &grads)[0], 0.8, epsilon = 1e-6);
    }
}
