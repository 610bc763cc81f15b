use log::debug;
use machine_learning::{
    dataset::BatchView,
    model::{EmbeddingExtractor, Forward, Mode},
};
use ndarray::Array2;
use parameter_server::{ParameterHandle, Synchronizer, optimization::Optimizer};
use tokio::task;

use crate::{ReplicaErr, Result};

/// What a replica hands back after a training step on its shard.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub embeddings: Array2<f32>,
    pub labels: Vec<usize>,
    pub loss: f32,
}

/// One parallel copy of the forward/backward computation.
///
/// The replica owns its extractor (and with it the private activations of a pass) plus
/// a local copy of the shared parameters, refreshed from the store before every pass.
pub struct Replica<E: EmbeddingExtractor> {
    id: usize,
    extractor: E,
    params: Vec<f32>,
    grad: Vec<f32>,
}

impl<E: EmbeddingExtractor> Replica<E> {
    /// Creates a new `Replica`.
    ///
    /// # Arguments
    /// * `id` - The position of this replica, shards are assigned by it.
    /// * `extractor` - This replica's copy of the embedding extractor.
    pub fn new(id: usize, extractor: E) -> Self {
        let nparams = extractor.layout().size();

        Self {
            id,
            extractor,
            params: vec![0.; nparams],
            grad: vec![0.; nparams],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs the forward and backward pass over `shard` and synchronizes the gradient
    /// through `sync`.
    ///
    /// When the pass fails the replica abstains from the step, so the remaining replicas
    /// can still go through the barrier and the step's update is dropped, and then
    /// returns the error.
    ///
    /// # Arguments
    /// * `handle` - The shared parameters.
    /// * `sync` - The synchronization policy of the step.
    /// * `shard` - The part of the batch assigned to this replica.
    ///
    /// # Returns
    /// The shard's embeddings, labels and loss.
    pub async fn train_step<O, S>(
        &mut self,
        handle: &ParameterHandle<O>,
        sync: &S,
        shard: BatchView<'_>,
    ) -> Result<StepOutput>
    where
        O: Optimizer + Send,
        S: Synchronizer,
    {
        let id = self.id;
        debug!(replica = id, examples = shard.len(); "starting training step");

        let forward = match handle.pull_params(&mut self.params).await {
            Ok(()) => {
                self.grad.fill(0.);
                task::block_in_place(|| {
                    let mode = Mode::Train {
                        grad: &mut self.grad,
                    };
                    self.extractor.embed(&self.params, shard, mode)
                })
                .map_err(|source| ReplicaErr::Extractor { replica: id, source })
            }
            Err(e) => Err(e.into()),
        };

        let (embeddings, loss) = match forward {
            Ok(Forward::Train { embeddings, loss }) => (embeddings, loss),
            Ok(Forward::Infer { .. }) => {
                sync.abstain(handle).await;
                return Err(ReplicaErr::MissingLoss { replica: id });
            }
            Err(e) => {
                sync.abstain(handle).await;
                return Err(e);
            }
        };

        sync.step(handle, &self.grad, &mut self.params).await?;

        debug!(replica = id, loss = loss; "finished training step");
        Ok(StepOutput {
            embeddings,
            labels: shard.labels.to_vec(),
            loss,
        })
    }

    /// Runs the forward pass over `shard` with the current parameters.
    ///
    /// # Returns
    /// The `[shard.len(), embedding_dim]` embeddings.
    pub async fn infer<O>(&mut self, handle: &ParameterHandle<O>, shard: BatchView<'_>) -> Result<Array2<f32>>
    where
        O: Optimizer + Send,
    {
        handle.pull_params(&mut self.params).await?;

        let forward = task::block_in_place(|| self.extractor.embed(&self.params, shard, Mode::Infer))
            .map_err(|source| ReplicaErr::Extractor {
                replica: self.id,
                source,
            })?;

        Ok(forward.into_embeddings())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use machine_learning::{dataset::Batch, model::LinearEmbedder};
    use ndarray::array;
    use parameter_server::{
        NoBlockingSync, ParameterStore, initialization::ConstParamGen,
        optimization::GradientDescent,
    };

    use super::*;

    fn create_handle(nparams: usize) -> ParameterHandle<GradientDescent> {
        let shard_size = NonZeroUsize::new(4).unwrap();
        let store = ParameterStore::new(shard_size, ConstParamGen::new(0.1, nparams), |_| {
            GradientDescent::new(0.5)
        });
        ParameterHandle::new(store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn training_step_moves_the_shared_parameters() {
        let extractor = LinearEmbedder::new(2, 2, 2);
        let nparams = extractor.layout().size();
        let handle = create_handle(nparams);
        let mut replica = Replica::new(0, extractor);

        let batch = Batch::new(array![[1., 0.], [0., 1.]], vec![0, 0]).unwrap();
        let before = handle.snapshot().await.unwrap();

        let out = replica
            .train_step(&handle, &NoBlockingSync::new(), batch.view())
            .await
            .unwrap();

        assert_eq!(out.embeddings.dim(), (2, 2));
        assert_eq!(out.labels, [0, 0]);
        assert!(out.loss.is_finite());
        assert_ne!(handle.snapshot().await.unwrap(), before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inference_leaves_the_parameters_untouched() {
        let extractor = LinearEmbedder::new(2, 3, 2);
        let nparams = extractor.layout().size();
        let handle = create_handle(nparams);
        let mut replica = Replica::new(0, extractor);

        let batch = Batch::new(array![[1., 1.]], vec![0]).unwrap();
        let embeddings = replica.infer(&handle, batch.view()).await.unwrap();

        // Every weight and bias is 0.1: 1 * 0.1 + 1 * 0.1 + 0.1.
        for e in embeddings.iter() {
            assert!((e - 0.3).abs() < 1e-6);
        }
        assert_eq!(handle.snapshot().await.unwrap(), vec![0.1; nparams]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extractor_errors_are_reported_with_the_replica() {
        let extractor = LinearEmbedder::new(2, 2, 2);
        let nparams = extractor.layout().size();
        let handle = create_handle(nparams);
        let mut replica = Replica::new(3, extractor);

        let batch = Batch::new(array![[1., 0.]], vec![7]).unwrap();
        let err = replica
            .train_step(&handle, &NoBlockingSync::new(), batch.view())
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicaErr::Extractor { replica: 3, .. }));
        assert_eq!(handle.snapshot().await.unwrap(), vec![0.1; nparams]);
    }
}
