//! Token-level metrics for causal language models.

use candle_core::{DType, Tensor, D};
use forneus_core::{Error, Result};
use marbas::CausalLm;
use serde::Serialize;
use tracing::info;

/// Streaming accuracy of argmax predictions against integer labels.
///
/// Recreate the accumulator to reset it.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    count: usize,
    true_positives: usize,
}

impl Accuracy {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates a batch and returns the batch accuracy.
    ///
    /// `logits` has shape `(..., C)` and `labels` the matching leading shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the flattened predictions and labels
    /// differ in length, and [`Error::EmptyMetric`] for an empty batch.
    #[allow(clippy::cast_precision_loss)]
    pub fn update(&mut self, logits: &Tensor, labels: &Tensor) -> Result<f64> {
        if logits.rank() == 0 {
            return Err(Error::ShapeMismatch {
                message: "logits need a class axis".to_string(),
            });
        }
        let predictions = logits
            .argmax(D::Minus1)?
            .flatten_all()?
            .to_dtype(DType::I64)?;
        let labels = labels.flatten_all()?.to_dtype(DType::I64)?;

        let n = predictions.elem_count();
        if n != labels.elem_count() {
            return Err(Error::ShapeMismatch {
                message: format!(
                    "{n} predictions for {} labels (logits {:?}, labels {:?})",
                    labels.elem_count(),
                    logits.dims(),
                    labels.dims()
                ),
            });
        }
        if n == 0 {
            return Err(Error::EmptyMetric {
                metric: "accuracy".to_string(),
            });
        }

        let tp = predictions
            .eq(&labels)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()? as usize;
        self.count += n;
        self.true_positives += tp;
        Ok(tp as f64 / n as f64)
    }

    /// Accuracy over everything seen so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyMetric`] before the first update.
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(&self) -> Result<f64> {
        if self.count == 0 {
            return Err(Error::EmptyMetric {
                metric: "accuracy".to_string(),
            });
        }
        Ok(self.true_positives as f64 / self.count as f64)
    }

    /// Number of positions seen.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of correct positions seen.
    #[must_use]
    pub fn true_positives(&self) -> usize {
        self.true_positives
    }
}

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Cross-entropy over every labelled position of a batch.
///
/// `x` of shape `(..., C)` is viewed as `(N, C)` and `y` as `(N,)`. Positions
/// labelled [`IGNORE_INDEX`] are dropped and the loss is the mean over the rest.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if `N` differs between `x` and `y`, and
/// [`Error::EmptyMetric`] if every position is ignored.
pub fn flat_cross_entropy(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let classes = x.dim(D::Minus1)?;
    let x = x.reshape(((), classes))?;
    let y = y.flatten_all()?.to_dtype(DType::I64)?;
    if x.dim(0)? != y.dim(0)? {
        return Err(Error::ShapeMismatch {
            message: format!("{} rows of logits for {} labels", x.dim(0)?, y.dim(0)?),
        });
    }

    let labels = y.to_vec1::<i64>()?;
    let kept: Vec<u32> = (0u32..)
        .zip(&labels)
        .filter(|&(_, &label)| label != IGNORE_INDEX)
        .map(|(row, _)| row)
        .collect();
    if kept.is_empty() {
        return Err(Error::EmptyMetric {
            metric: "cross_entropy".to_string(),
        });
    }
    if kept.len() == labels.len() {
        return Ok(candle_nn::loss::cross_entropy(&x, &y)?);
    }

    let rows = Tensor::new(kept.as_slice(), x.device())?;
    let x = x.index_select(&rows, 0)?;
    let y = y.index_select(&rows, 0)?;
    Ok(candle_nn::loss::cross_entropy(&x, &y)?)
}

/// Logits and labels gathered by a trainer's evaluation loop.
#[derive(Debug, Clone)]
pub struct EvalPrediction {
    /// Logits of shape `(..., C)`.
    pub logits: Tensor,
    /// Integer labels with the leading shape of `logits`.
    pub labels: Tensor,
}

/// Output of [`token_accuracy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccuracyScore {
    /// Fraction of matching positions.
    pub accuracy: f64,
}

/// Fraction of positions whose argmax matches the label.
///
/// # Errors
///
/// Returns an error on shape mismatches or an empty prediction set.
pub fn token_accuracy(eval_preds: &EvalPrediction) -> Result<AccuracyScore> {
    let mut accuracy = Accuracy::new();
    accuracy.update(&eval_preds.logits, &eval_preds.labels)?;
    Ok(AccuracyScore {
        accuracy: accuracy.compute()?,
    })
}

/// Parameter counts in millions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamCount {
    /// All parameters.
    pub total: f64,
    /// Parameters marked trainable.
    pub trainable: f64,
}

/// Counts total and trainable parameters and logs them.
///
/// # Errors
///
/// Returns an error if the parameter store cannot be read.
#[allow(clippy::cast_precision_loss)]
pub fn param_count(model: &CausalLm) -> Result<ParamCount> {
    let params = model.params();
    let total = params.num_params()? as f64 / 1_000_000.0;
    let trainable = params.num_trainable()? as f64 / 1_000_000.0;
    info!("Total params: {total:.2}M, Trainable: {trainable:.2}M");
    Ok(ParamCount { total, trainable })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use marbas::test_utils::tiny_model;

    fn logits() -> Tensor {
        // argmax: [1, 0, 2]
        Tensor::new(
            &[[[0.1f32, 0.9, 0.0], [0.8, 0.1, 0.1], [0.0, 0.2, 0.7]]],
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_perfect_predictions() {
        let labels = Tensor::new(&[[1u32, 0, 2]], &Device::Cpu).unwrap();
        let mut acc = Accuracy::new();
        for _ in 0..3 {
            assert!((acc.update(&logits(), &labels).unwrap() - 1.0).abs() < f64::EPSILON);
        }
        assert!((acc.compute().unwrap() - 1.0).abs() < f64::EPSILON);
        assert_eq!(acc.count(), 9);
    }

    #[test]
    fn test_no_matches() {
        let labels = Tensor::new(&[[2i64, 2, 0]], &Device::Cpu).unwrap();
        let mut acc = Accuracy::new();
        assert!(acc.update(&logits(), &labels).unwrap().abs() < f64::EPSILON);
        assert!(acc.compute().unwrap().abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_batches_accumulate() {
        let mut acc = Accuracy::new();
        let hit = Tensor::new(&[[1u32, 0, 2]], &Device::Cpu).unwrap();
        let one = Tensor::new(&[[1u32, 1, 1]], &Device::Cpu).unwrap();
        acc.update(&logits(), &hit).unwrap();
        let batch = acc.update(&logits(), &one).unwrap();
        assert!((batch - 1.0 / 3.0).abs() < 1e-9);
        assert!((acc.compute().unwrap() - 4.0 / 6.0).abs() < 1e-9);
        assert!(acc.true_positives() <= acc.count());
    }

    #[test]
    fn test_compute_before_update_fails() {
        assert!(matches!(
            Accuracy::new().compute(),
            Err(Error::EmptyMetric { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let labels = Tensor::new(&[1u32, 0], &Device::Cpu).unwrap();
        assert!(matches!(
            Accuracy::new().update(&logits(), &labels),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_flat_cross_entropy_of_confident_logits() {
        let x = Tensor::new(
            &[[[20f32, 0.0, 0.0], [0.0, 20.0, 0.0]], [[0.0, 0.0, 20.0], [20.0, 0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let y = Tensor::new(&[[0u32, 1], [2, 0]], &Device::Cpu).unwrap();
        let loss = flat_cross_entropy(&x, &y).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss < 1e-4, "{loss}");

        let wrong = Tensor::new(&[[1u32, 0], [0, 1]], &Device::Cpu).unwrap();
        let loss = flat_cross_entropy(&x, &wrong).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss > 10.0, "{loss}");
    }

    #[test]
    fn test_flat_cross_entropy_skips_ignored_labels() {
        let x = Tensor::new(
            &[[[2f32, 1.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]]],
            &Device::Cpu,
        )
        .unwrap();
        // The last row would be a confident miss if it counted.
        let y = Tensor::new(&[[0i64, 1, IGNORE_INDEX]], &Device::Cpu).unwrap();
        let masked = flat_cross_entropy(&x, &y).unwrap().to_scalar::<f32>().unwrap();

        let kept_x = Tensor::new(&[[2f32, 1.0, 0.0], [0.0, 20.0, 0.0]], &Device::Cpu).unwrap();
        let kept_y = Tensor::new(&[0i64, 1], &Device::Cpu).unwrap();
        let expected = flat_cross_entropy(&kept_x, &kept_y)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((masked - expected).abs() < 1e-6, "{masked} vs {expected}");

        let confident = Tensor::new(&[[[20f32, 0.0, 0.0], [0.0, 20.0, 0.0]]], &Device::Cpu).unwrap();
        let y = Tensor::new(&[[0i64, IGNORE_INDEX]], &Device::Cpu).unwrap();
        let loss = flat_cross_entropy(&confident, &y)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 1e-4, "{loss}");
    }

    #[test]
    fn test_flat_cross_entropy_all_ignored_fails() {
        let y = Tensor::new(&[[IGNORE_INDEX; 3]], &Device::Cpu).unwrap();
        assert!(matches!(
            flat_cross_entropy(&logits(), &y),
            Err(Error::EmptyMetric { .. })
        ));
    }

    #[test]
    fn test_token_accuracy() {
        let eval = EvalPrediction {
            logits: logits(),
            labels: Tensor::new(&[[1u32, 1, 2]], &Device::Cpu).unwrap(),
        };
        let score = token_accuracy(&eval).unwrap();
        assert!((score.accuracy - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_param_count_tracks_trainable() {
        let mut model = tiny_model("tiny").unwrap();
        let all = param_count(&model).unwrap();
        assert!((all.total - all.trainable).abs() < f64::EPSILON);

        model.params_mut().set_all_trainable(false);
        let frozen = param_count(&model).unwrap();
        assert!(frozen.trainable.abs() < f64::EPSILON);
        assert!((frozen.total - all.total).abs() < f64::EPSILON);
    }
}
