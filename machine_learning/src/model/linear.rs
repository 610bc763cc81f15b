use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};

use super::{
    EmbeddingExtractor, Forward, Mode, ParamLayout,
    loss::{LossFn, SoftmaxCrossEntropy},
};
use crate::{MlErr, Result, dataset::BatchView};

const PROJECTION_WEIGHTS: &str = "projection/weights";
const PROJECTION_BIAS: &str = "projection/bias";
const CLASSIFIER_WEIGHTS: &str = "classifier/weights";
const CLASSIFIER_BIAS: &str = "classifier/bias";

/// A linear speaker embedder: `e = x W + b`, trained through a softmax classifier
/// head over the speaker classes.
///
/// Only the projection is exposed as the embedding, the classifier head exists to
/// give the projection a training signal.
#[derive(Debug, Clone)]
pub struct LinearEmbedder {
    feature_dim: usize,
    embedding_dim: usize,
    classes: usize,
    layout: ParamLayout,
    loss_fn: SoftmaxCrossEntropy,
}

impl LinearEmbedder {
    /// Creates a new `LinearEmbedder`.
    ///
    /// # Arguments
    /// * `feature_dim` - The width of each flattened feature row.
    /// * `embedding_dim` - The dimension of the produced embeddings.
    /// * `classes` - The amount of speaker classes of the classifier head.
    pub fn new(feature_dim: usize, embedding_dim: usize, classes: usize) -> Self {
        let layout = ParamLayout::new()
            .push(PROJECTION_WEIGHTS, &[feature_dim, embedding_dim])
            .push(PROJECTION_BIAS, &[embedding_dim])
            .push(CLASSIFIER_WEIGHTS, &[embedding_dim, classes])
            .push(CLASSIFIER_BIAS, &[classes]);

        Self {
            feature_dim,
            embedding_dim,
            classes,
            layout,
            loss_fn: SoftmaxCrossEntropy::new(),
        }
    }

    /// Gives a view of the raw parameter slice as the weights and biases of both layers.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(
        ArrayView2<'a, f32>,
        ArrayView1<'a, f32>,
        ArrayView2<'a, f32>,
        ArrayView1<'a, f32>,
    )> {
        let (f, d, c) = (self.feature_dim, self.embedding_dim, self.classes);

        let (w1, rest) = params.split_at(f * d);
        let (b1, rest) = rest.split_at(d);
        let (w2, b2) = rest.split_at(d * c);

        Ok((
            ArrayView2::from_shape((f, d), w1)?,
            ArrayView1::from_shape(d, b1)?,
            ArrayView2::from_shape((d, c), w2)?,
            ArrayView1::from_shape(c, b2)?,
        ))
    }

    /// Gives a view of the raw gradient slice as the deltas of both layers.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(
        ArrayViewMut2<'a, f32>,
        ArrayViewMut1<'a, f32>,
        ArrayViewMut2<'a, f32>,
        ArrayViewMut1<'a, f32>,
    )> {
        let (f, d, c) = (self.feature_dim, self.embedding_dim, self.classes);

        let (dw1, rest) = grad.split_at_mut(f * d);
        let (db1, rest) = rest.split_at_mut(d);
        let (dw2, db2) = rest.split_at_mut(d * c);

        Ok((
            ArrayViewMut2::from_shape((f, d), dw1)?,
            ArrayViewMut1::from_shape(d, db1)?,
            ArrayViewMut2::from_shape((d, c), dw2)?,
            ArrayViewMut1::from_shape(c, db2)?,
        ))
    }
}

impl EmbeddingExtractor for LinearEmbedder {
    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn embed(&mut self, params: &[f32], batch: BatchView<'_>, mode: Mode<'_>) -> Result<Forward> {
        self.layout.check("params", params)?;

        let x = batch.features;
        if x.ncols() != self.feature_dim {
            return Err(MlErr::SizeMismatch {
                what: "feature row",
                got: x.ncols(),
                expected: self.feature_dim,
            });
        }

        let (w1, b1, w2, b2) = self.view_params(params)?;
        let embeddings = x.dot(&w1) + &b1;

        let grad = match mode {
            Mode::Infer => return Ok(Forward::Infer { embeddings }),
            Mode::Train { grad } => grad,
        };

        self.layout.check("grad", grad)?;
        if let Some(&label) = batch.labels.iter().find(|&&l| l >= self.classes) {
            return Err(MlErr::LabelOutOfRange {
                label,
                classes: self.classes,
            });
        }

        let logits = embeddings.dot(&w2) + &b2;
        let loss = self.loss_fn.loss(logits.view(), batch.labels);
        let d_logits = self.loss_fn.loss_prime(logits.view(), batch.labels);

        let (mut dw1, mut db1, mut dw2, mut db2) = self.view_grad(grad)?;

        linalg::general_mat_mul(1.0, &embeddings.t(), &d_logits, 0.0, &mut dw2);
        db2.assign(&d_logits.sum_axis(Axis(0)));

        let d_embeddings = d_logits.dot(&w2.t());
        linalg::general_mat_mul(1.0, &x.t(), &d_embeddings, 0.0, &mut dw1);
        db1.assign(&d_embeddings.sum_axis(Axis(0)));

        Ok(Forward::Train { embeddings, loss })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};

    use super::*;
    use crate::dataset::Batch;

    fn params(size: usize) -> Vec<f32> {
        (0..size).map(|i| ((i * 7 % 11) as f32 - 5.) * 0.1).collect()
    }

    #[test]
    fn infer_returns_projection_only() {
        let mut model = LinearEmbedder::new(2, 3, 4);
        let params = params(model.layout().size());
        let batch = Batch::new(array![[1., 0.], [0., 1.]], vec![0, 1]).unwrap();

        let out = model.embed(&params, batch.view(), Mode::Infer).unwrap();
        assert!(out.loss().is_none());
        assert_eq!(out.embeddings().dim(), (2, 3));

        // e = x W1 + b1, with x the identity rows.
        let w1 = &params[..6];
        let b1 = &params[6..9];
        for j in 0..3 {
            assert!((out.embeddings()[[0, j]] - (w1[j] + b1[j])).abs() < 1e-6);
            assert!((out.embeddings()[[1, j]] - (w1[3 + j] + b1[j])).abs() < 1e-6);
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut model = LinearEmbedder::new(3, 2, 3);
        let size = model.layout().size();
        let mut params = params(size);

        let x = Array2::from_shape_fn((4, 3), |(i, j)| ((i + 2 * j) % 5) as f32 * 0.3 - 0.5);
        let batch = Batch::new(x, vec![0, 2, 1, 2]).unwrap();

        let mut grad = vec![0.; size];
        model
            .embed(&params, batch.view(), Mode::Train { grad: &mut grad })
            .unwrap();

        let eps = 1e-2;
        let mut scratch = vec![0.; size];
        for i in 0..size {
            let original = params[i];

            params[i] = original + eps;
            let plus = model
                .embed(&params, batch.view(), Mode::Train { grad: &mut scratch })
                .unwrap()
                .loss()
                .unwrap();

            params[i] = original - eps;
            let minus = model
                .embed(&params, batch.view(), Mode::Train { grad: &mut scratch })
                .unwrap()
                .loss()
                .unwrap();

            params[i] = original;
            let numeric = (plus - minus) / (2. * eps);
            assert!(
                (numeric - grad[i]).abs() < 1e-2,
                "param {i}: numeric {numeric} vs analytic {}",
                grad[i]
            );
        }
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let mut model = LinearEmbedder::new(2, 2, 2);
        let batch = Batch::new(array![[1., 0.]], vec![0]).unwrap();

        let short = vec![0.; model.layout().size() - 1];
        assert!(model.embed(&short, batch.view(), Mode::Infer).is_err());

        let params = vec![0.; model.layout().size()];
        let mut grad = vec![0.; 1];
        let res = model.embed(&params, batch.view(), Mode::Train { grad: &mut grad });
        assert!(matches!(res, Err(MlErr::SizeMismatch { what: "grad", .. })));
    }

    #[test]
    fn rejects_labels_outside_the_head() {
        let mut model = LinearEmbedder::new(1, 1, 2);
        let params = vec![0.; model.layout().size()];
        let mut grad = vec![0.; model.layout().size()];
        let batch = Batch::new(array![[1.]], vec![5]).unwrap();

        let res = model.embed(&params, batch.view(), Mode::Train { grad: &mut grad });
        assert!(matches!(res, Err(MlErr::LabelOutOfRange { label: 5, .. })));
    }
}
