use ndarray::Array2;

use super::ParamLayout;
use crate::{Result, dataset::BatchView};

/// Selects how an extractor runs a batch.
///
/// The training variant carries the buffer the gradient of the loss gets written to.
#[derive(Debug)]
pub enum Mode<'g> {
    Train { grad: &'g mut [f32] },
    Infer,
}

/// The result of running a batch through an extractor, tagged by the mode it ran in.
#[derive(Debug, Clone)]
pub enum Forward {
    Train { embeddings: Array2<f32>, loss: f32 },
    Infer { embeddings: Array2<f32> },
}

impl Forward {
    /// The `[n, embedding_dim]` embeddings of the batch.
    pub fn embeddings(&self) -> &Array2<f32> {
        match self {
            Forward::Train { embeddings, .. } | Forward::Infer { embeddings } => embeddings,
        }
    }

    /// The batch loss, only present when running in training mode.
    pub fn loss(&self) -> Option<f32> {
        match self {
            Forward::Train { loss, .. } => Some(*loss),
            Forward::Infer { .. } => None,
        }
    }

    pub fn into_embeddings(self) -> Array2<f32> {
        match self {
            Forward::Train { embeddings, .. } | Forward::Infer { embeddings } => embeddings,
        }
    }
}

/// A trainable function mapping a batch of features to one embedding per example.
///
/// Each replica owns its own instance (the private activations of a forward pass live
/// in it) while the parameters are always provided from the outside as a flat buffer
/// following `layout`.
pub trait EmbeddingExtractor: Clone + Send + 'static {
    /// The layout of the flat parameter buffer this extractor reads.
    fn layout(&self) -> &ParamLayout;

    /// The dimension of the produced embeddings.
    fn embedding_dim(&self) -> usize;

    /// Runs a forward pass, and a backward pass when `mode` is `Mode::Train`.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `batch` - The features and labels of the examples, labels are ignored when inferring.
    /// * `mode` - Whether to train (writing the gradient into the given buffer) or infer.
    ///
    /// # Returns
    /// The embeddings (and loss when training) or an error if any buffer doesn't match the layout.
    fn embed(&mut self, params: &[f32], batch: BatchView<'_>, mode: Mode<'_>) -> Result<Forward>;
}
