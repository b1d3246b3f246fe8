//! Top-k classification precision

use std::cmp::Ordering;
use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Compute precision@k (in percent) for every `k` in `ks`.
///
/// `logits` is `[batch, num_classes]`, `targets` holds `batch` integer
/// labels in `0..num_classes`. Classes are ranked by descending logit under
/// IEEE total order (a positive NaN outranks every number); equal logits rank
/// the lower class index first.
pub fn topk_precision(logits: &Tensor, targets: &Tensor, ks: &[usize]) -> Result<BTreeMap<usize, f64>> {
    let (batch, num_classes) = logits.dims2()?;
    let labels = targets.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;

    if labels.len() != batch {
        return Err(Error::invalid_input(format!(
            "logits batch size {} does not match {} targets",
            batch,
            labels.len()
        )));
    }
    if let Some(&label) = labels.iter().find(|&&l| l as usize >= num_classes) {
        return Err(Error::invalid_input(format!(
            "target label {} out of range for {} classes",
            label, num_classes
        )));
    }
    if let Some(&k) = ks.iter().find(|&&k| k == 0 || k > num_classes) {
        return Err(Error::invalid_input(format!(
            "top-{} requested for {} classes",
            k, num_classes
        )));
    }

    let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(precision_from_rows(&rows, &labels, ks))
}

/// Rank of `label` (0-based) within `row` under the deterministic ordering
fn rank_of(row: &[f32], label: usize) -> usize {
    let target = row[label];
    row.iter()
        .enumerate()
        .filter(|&(class, score)| match score.total_cmp(&target) {
            Ordering::Greater => true,
            Ordering::Equal => class < label,
            Ordering::Less => false,
        })
        .count()
}

fn precision_from_rows(rows: &[Vec<f32>], labels: &[u32], ks: &[usize]) -> BTreeMap<usize, f64> {
    let batch = rows.len();
    let ranks: Vec<usize> = rows
        .iter()
        .zip(labels)
        .map(|(row, &label)| rank_of(row, label as usize))
        .collect();

    ks.iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|&&rank| rank < k).count();
            let precision = if batch == 0 {
                0.0
            } else {
                correct as f64 * 100.0 / batch as f64
            };
            (k, precision)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(rows: &[[f32; 4]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_top1_and_top2() {
        // Sample 3 has its true class ranked second.
        let logits = logits(&[
            [0.9, 0.05, 0.03, 0.02],
            [0.1, 0.7, 0.1, 0.1],
            [0.0, 0.2, 0.6, 0.2],
            [0.1, 0.1, 0.5, 0.3],
        ]);
        let targets = Tensor::new(&[0u32, 1, 2, 3], &Device::Cpu).unwrap();

        let prec = topk_precision(&logits, &targets, &[1, 2]).unwrap();
        assert_eq!(prec[&1], 75.0);
        assert_eq!(prec[&2], 100.0);
    }

    #[test]
    fn test_ties_prefer_lower_class_index() {
        let logits = logits(&[[1.0, 1.0, 1.0, 0.0], [1.0, 1.0, 1.0, 0.0]]);
        let targets = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();

        let prec = topk_precision(&logits, &targets, &[1, 2, 3]).unwrap();
        assert_eq!(prec[&1], 50.0);
        assert_eq!(prec[&2], 50.0);
        assert_eq!(prec[&3], 100.0);
    }

    #[test]
    fn test_batch_mismatch_is_rejected() {
        let logits = logits(&[[0.1, 0.2, 0.3, 0.4]]);
        let targets = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();

        let err = topk_precision(&logits, &targets, &[1]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_k_larger_than_classes_is_rejected() {
        let logits = logits(&[[0.1, 0.2, 0.3, 0.4]]);
        let targets = Tensor::new(&[0u32], &Device::Cpu).unwrap();

        let err = topk_precision(&logits, &targets, &[5]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_label_out_of_range_is_rejected() {
        let logits = logits(&[[0.1, 0.2, 0.3, 0.4]]);
        let targets = Tensor::new(&[4u32], &Device::Cpu).unwrap();

        let err = topk_precision(&logits, &targets, &[1]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_nan_logit_outranks_numbers() {
        let logits = logits(&[[f32::NAN, 1.0, 0.0, -1.0]]);
        let targets = Tensor::new(&[1u32], &Device::Cpu).unwrap();

        let prec = topk_precision(&logits, &targets, &[1, 2]).unwrap();
        assert_eq!(prec[&1], 0.0);
        assert_eq!(prec[&2], 100.0);
    }

    #[test]
    fn test_i64_targets_are_accepted() {
        let logits = logits(&[[0.1, 0.2, 0.3, 0.4]]);
        let targets = Tensor::new(&[3i64], &Device::Cpu).unwrap();

        let prec = topk_precision(&logits, &targets, &[1]).unwrap();
        assert_eq!(prec[&1], 100.0);
    }
}
