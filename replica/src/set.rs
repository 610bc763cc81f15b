use log::{debug, warn};
use machine_learning::{
    dataset::{Batch, BatchView},
    model::EmbeddingExtractor,
};
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use parameter_server::{
    BarrierSync, NoBlockingSync, ParameterHandle, Synchronizer, average_losses,
    optimization::Optimizer,
};
use tokio::task::JoinSet;

use crate::{Replica, ReplicaErr, Result, ShardPlan, StepOutput};

/// The replicas taking part in training or inference, together with the shared
/// parameters and the synchronization policy between them.
///
/// A set built with `single` runs every batch whole on one replica. A set built with
/// `multi` shards every batch and runs one task per replica, returning the results in
/// replica order regardless of which task finished first.
pub struct ReplicaSet<E: EmbeddingExtractor, O: Optimizer, S> {
    replicas: Vec<Replica<E>>,
    size: usize,
    handle: ParameterHandle<O>,
    sync: S,
    sharded: bool,
}

impl<E: EmbeddingExtractor, O: Optimizer> ReplicaSet<E, O, NoBlockingSync> {
    /// Creates the single-process set: no sharding and no gradient averaging.
    pub fn single(extractor: E, handle: ParameterHandle<O>) -> Self {
        Self {
            replicas: vec![Replica::new(0, extractor)],
            size: 1,
            handle,
            sync: NoBlockingSync::new(),
            sharded: false,
        }
    }
}

impl<E: EmbeddingExtractor, O: Optimizer> ReplicaSet<E, O, BarrierSync> {
    /// Creates a data-parallel set of `replicas` replicas, each with its own copy of `extractor`.
    ///
    /// # Returns
    /// `ReplicaErr::ZeroReplicas` if `replicas` is zero.
    pub fn multi(extractor: E, handle: ParameterHandle<O>, replicas: usize) -> Result<Self> {
        if replicas == 0 {
            return Err(ReplicaErr::ZeroReplicas);
        }

        Ok(Self {
            replicas: (0..replicas)
                .map(|id| Replica::new(id, extractor.clone()))
                .collect(),
            size: replicas,
            handle,
            sync: BarrierSync::new(replicas),
            sharded: true,
        })
    }
}

impl<E, O, S> ReplicaSet<E, O, S>
where
    E: EmbeddingExtractor,
    O: Optimizer + Send + 'static,
    S: Synchronizer + Sync + 'static,
{
    /// The amount of replicas in the set.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn handle(&self) -> &ParameterHandle<O> {
        &self.handle
    }

    /// Runs one synchronous training step over `batch`.
    ///
    /// # Returns
    /// The embeddings of every assigned example concatenated in replica order, their
    /// labels and the mean loss across replicas.
    pub async fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.check_complete()?;
        if !self.sharded {
            let replica = &mut self.replicas[0];
            return replica.train_step(&self.handle, &self.sync, batch.view()).await;
        }

        let (_, shards) = ShardPlan::split(batch.view(), self.replicas.len())?;
        let mut tasks = JoinSet::new();

        for (mut replica, shard) in self.replicas.drain(..).zip(shards) {
            let (features, labels) = (shard.features.to_owned(), shard.labels.to_vec());
            let handle = self.handle.clone();
            let sync = self.sync.clone();

            tasks.spawn(async move {
                let shard = BatchView {
                    features: features.view(),
                    labels: &labels,
                };

                let res = replica.train_step(&handle, &sync, shard).await;
                (replica, res)
            });
        }

        let outputs = self.join(tasks).await?;
        let losses: Vec<f32> = outputs.iter().map(|out| out.loss).collect();
        let loss = average_losses(&losses).unwrap_or_default();
        let (embeddings, labels) = gather(outputs.into_iter().map(|out| (out.embeddings, out.labels)))?;

        Ok(StepOutput {
            embeddings,
            labels,
            loss,
        })
    }

    /// Runs `batch` through the extractor in inference mode.
    ///
    /// # Returns
    /// The embeddings of every assigned example in replica order and their labels.
    pub async fn infer(&mut self, batch: &Batch) -> Result<(Array2<f32>, Vec<usize>)> {
        self.check_complete()?;
        if !self.sharded {
            let replica = &mut self.replicas[0];
            let embeddings = replica.infer(&self.handle, batch.view()).await?;
            return Ok((embeddings, batch.labels().to_vec()));
        }

        let (_, shards) = ShardPlan::split(batch.view(), self.replicas.len())?;
        let mut tasks = JoinSet::new();

        for (mut replica, shard) in self.replicas.drain(..).zip(shards) {
            let (features, labels) = (shard.features.to_owned(), shard.labels.to_vec());
            let handle = self.handle.clone();

            tasks.spawn(async move {
                let shard = BatchView {
                    features: features.view(),
                    labels: &labels,
                };

                let res = replica.infer(&handle, shard).await;
                (replica, res.map(|embeddings| (embeddings, labels)))
            });
        }

        let outputs = self.join(tasks).await?;
        gather(outputs)
    }

    fn check_complete(&self) -> Result<()> {
        if self.replicas.len() != self.size {
            return Err(ReplicaErr::Lost {
                expected: self.size,
                got: self.replicas.len(),
            });
        }

        Ok(())
    }

    /// Waits for every replica task, puts the replicas back in order and returns their
    /// results ordered by replica id.
    ///
    /// If a task dies the others are aborted, since they may be waiting on it at the
    /// barrier, and whatever they accumulated is dropped. The replicas of aborted tasks
    /// are lost with it, so the set refuses to run any further step.
    async fn join<T: 'static>(
        &mut self,
        mut tasks: JoinSet<(Replica<E>, Result<T>)>,
    ) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(tasks.len());
        let mut failure = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((replica, res)) => {
                    results.push((replica.id(), res));
                    self.replicas.push(replica);
                }
                Err(e) => {
                    if failure.is_none() {
                        tasks.abort_all();
                    }
                    failure.get_or_insert(ReplicaErr::Join(e));
                }
            }
        }

        self.replicas.sort_by_key(Replica::id);
        if let Some(e) = failure {
            warn!(
                replicas = self.replicas.len(),
                expected = self.size;
                "a replica task failed, dropping the step"
            );

            if let Err(discard) = self.handle.discard_update().await {
                warn!(
                    got = discard.got,
                    expected = discard.expected;
                    "couldn't drop the accumulated gradients"
                );
            }
            return Err(e);
        }

        debug!(replicas = results.len(); "replicas finished");
        results.sort_by_key(|(id, _)| *id);
        results.into_iter().map(|(_, res)| res).collect()
    }
}

/// Concatenates per-replica embeddings and labels, keeping replica order.
fn gather<I>(outputs: I) -> Result<(Array2<f32>, Vec<usize>)>
where
    I: IntoIterator<Item = (Array2<f32>, Vec<usize>)>,
{
    let (embeddings, labels): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
    let views: Vec<ArrayView2<f32>> = embeddings.iter().map(|e| e.view()).collect();
    let embeddings = concatenate(Axis(0), &views)?;
    Ok((embeddings, labels.concat()))
}
