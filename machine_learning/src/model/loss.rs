use ndarray::{Array2, ArrayView2, Axis};

/// A classification loss over raw model outputs and class-index labels.
pub trait LossFn {
    /// The mean loss of the batch.
    fn loss(&self, y_pred: ArrayView2<f32>, labels: &[usize]) -> f32;

    /// The derivative of `loss` with respect to `y_pred`.
    fn loss_prime(&self, y_pred: ArrayView2<f32>, labels: &[usize]) -> Array2<f32>;
}

/// Softmax followed by cross-entropy, computed over logits.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    fn softmax(y_pred: ArrayView2<f32>) -> Array2<f32> {
        let mut out = y_pred.to_owned();

        for mut row in out.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        }

        out
    }
}

impl LossFn for SoftmaxCrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, labels: &[usize]) -> f32 {
        let n = y_pred.nrows();
        if n == 0 {
            return 0.;
        }

        let total: f32 = y_pred
            .axis_iter(Axis(0))
            .zip(labels)
            .map(|(row, &label)| {
                let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                let log_sum_exp = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
                log_sum_exp - row[label]
            })
            .sum();

        total / n as f32
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, labels: &[usize]) -> Array2<f32> {
        let n = y_pred.nrows().max(1) as f32;
        let mut d = Self::softmax(y_pred);

        for (mut row, &label) in d.axis_iter_mut(Axis(0)).zip(labels) {
            row[label] -= 1.;
            row.mapv_inplace(|v| v / n);
        }

        d
    }
}
