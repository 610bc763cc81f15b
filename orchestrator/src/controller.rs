use std::time::{Duration, Instant};

use log::{debug, info};
use machine_learning::{
    MlErr,
    dataset::{Batch, DataSource},
    model::{EmbeddingExtractor, ParamLayout},
};
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use parameter_server::{BarrierSync, NoBlockingSync, ParameterHandle, Synchronizer};
use replica::ReplicaSet;

use crate::{
    OrchestratorError, Result,
    centroids::CentroidTable,
    checkpoint::Checkpoint,
    classifier,
    configs::TrainingConfig,
    params::{self, DynOptimizer, ParamInit},
};

/// Everything a training run mutates, owned by the controller.
pub struct TrainingState {
    /// The shared model parameters, only written by the update step.
    pub params: ParameterHandle<DynOptimizer>,
    pub centroids: CentroidTable,
    /// The amount of finished epochs.
    pub epoch: usize,
}

/// The summary of one finished epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// The mean training loss over the epoch's steps.
    pub loss: f32,
    /// The nearest-centroid accuracy over the validation set.
    pub accuracy: f32,
    pub batches: usize,
    pub elapsed: Duration,
}

/// Drives the training epochs: feeding batches to the replicas, folding the epoch's
/// embeddings into the centroids, validating and checkpointing.
pub struct Controller<E: EmbeddingExtractor, S> {
    config: TrainingConfig,
    layout: ParamLayout,
    replicas: ReplicaSet<E, DynOptimizer, S>,
    state: TrainingState,
}

impl<E: EmbeddingExtractor> Controller<E, NoBlockingSync> {
    /// Creates a controller that runs every batch on a single replica.
    pub fn single(config: TrainingConfig, extractor: E, init: ParamInit) -> Result<Self> {
        let (layout, state) = Self::init(&config, &extractor, init)?;
        let replicas = ReplicaSet::single(extractor, state.params.clone());
        Ok(Self::new(config, layout, replicas, state))
    }
}

impl<E: EmbeddingExtractor> Controller<E, BarrierSync> {
    /// Creates a controller that shards every batch across `config.replica_count` replicas.
    pub fn multi(config: TrainingConfig, extractor: E, init: ParamInit) -> Result<Self> {
        let (layout, state) = Self::init(&config, &extractor, init)?;
        let replicas = ReplicaSet::multi(extractor, state.params.clone(), config.replica_count)?;
        Ok(Self::new(config, layout, replicas, state))
    }
}

impl<E, S> Controller<E, S>
where
    E: EmbeddingExtractor,
    S: Synchronizer + Sync + 'static,
{
    fn new(
        config: TrainingConfig,
        layout: ParamLayout,
        replicas: ReplicaSet<E, DynOptimizer, S>,
        state: TrainingState,
    ) -> Self {
        Self {
            config,
            layout,
            replicas,
            state,
        }
    }

    fn init(config: &TrainingConfig, extractor: &E, init: ParamInit) -> Result<(ParamLayout, TrainingState)> {
        config.validate()?;

        if extractor.embedding_dim() != config.embedding_dim {
            return Err(OrchestratorError::InvalidConfig(format!(
                "the extractor produces {}-dimensional embeddings, the config expects {}",
                extractor.embedding_dim(),
                config.embedding_dim
            )));
        }

        let layout = extractor.layout().clone();
        let state = TrainingState {
            params: params::build_handle(config, &layout, init)?,
            centroids: CentroidTable::new(config.n_speaker, config.embedding_dim),
            epoch: 0,
        };

        Ok((layout, state))
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn into_state(self) -> TrainingState {
        self.state
    }

    /// Runs one epoch: the training batches, the centroid update and the validation pass.
    ///
    /// # Arguments
    /// * `train` - The training set, rewound once every full batch was consumed.
    /// * `validation` - The validation set, rewound after the pass.
    ///
    /// # Returns
    /// The epoch's report, or the first error raised by a replica or the parameter update.
    pub async fn run_epoch<D, V>(&mut self, train: &mut D, validation: &mut V) -> Result<EpochReport>
    where
        D: DataSource,
        V: DataSource,
    {
        let start = Instant::now();
        let epoch = self.state.epoch + 1;
        let batch_size = self.config.batch_size;
        check_batch_size(train, batch_size, "training")?;
        check_batch_size(validation, batch_size, "validation")?;

        let mut loss_sum = 0.;
        let mut batches = 0;
        let mut embeddings = Vec::new();
        let mut labels = Vec::new();

        while let Some(batch) = next_full_batch(train, batch_size) {
            let out = self.replicas.train_step(&batch).await?;
            debug!(epoch = epoch, batch = batches, loss = out.loss; "finished batch");

            loss_sum += out.loss;
            batches += 1;
            embeddings.push(out.embeddings);
            labels.extend(out.labels);
        }
        train.reset_batch_counter();

        if batches == 0 {
            return Err(OrchestratorError::EmptyEpoch { what: "training" });
        }

        let loss = loss_sum / batches as f32;
        let embeddings = stack(&embeddings)?;
        self.state.centroids.blend_epoch(embeddings.view(), &labels)?;

        let (embeddings, labels) = self.embed_validation(validation).await?;
        let accuracy = self.accuracy(embeddings.view(), &labels);

        self.state.epoch = epoch;
        let elapsed = start.elapsed();

        info!(
            epoch = epoch,
            loss = loss,
            accuracy = accuracy,
            batches = batches,
            elapsed_ms = elapsed.as_millis() as u64;
            "finished epoch"
        );

        Ok(EpochReport {
            epoch,
            loss,
            accuracy,
            batches,
            elapsed,
        })
    }

    /// Trains for `max_step` epochs, checkpointing the parameters after every one.
    ///
    /// # Returns
    /// The final state and the report of every epoch.
    pub async fn run<D, V, C>(
        mut self,
        train: &mut D,
        validation: &mut V,
        checkpoint: &C,
    ) -> Result<(TrainingState, Vec<EpochReport>)>
    where
        D: DataSource,
        V: DataSource,
        C: Checkpoint,
    {
        let mut reports = Vec::with_capacity(self.config.max_step);

        for _ in 0..self.config.max_step {
            let report = self.run_epoch(train, validation).await?;
            let params = self.state.params.snapshot().await?;
            checkpoint.save(&self.layout, &params)?;
            reports.push(report);
        }

        info!(epochs = reports.len(); "training done");
        Ok((self.state, reports))
    }

    async fn embed_validation<V: DataSource>(&mut self, validation: &mut V) -> Result<(Array2<f32>, Vec<usize>)> {
        let mut embeddings = Vec::new();
        let mut labels = Vec::new();

        while let Some(batch) = next_full_batch(validation, self.config.batch_size) {
            let (batch_embeddings, batch_labels) = self.replicas.infer(&batch).await?;
            embeddings.push(batch_embeddings);
            labels.extend(batch_labels);
        }
        validation.reset_batch_counter();

        if embeddings.is_empty() {
            return Err(OrchestratorError::EmptyEpoch { what: "validation" });
        }

        Ok((stack(&embeddings)?, labels))
    }

    /// The fraction of `embeddings` whose nearest centroid is their own class.
    fn accuracy(&self, embeddings: ArrayView2<f32>, labels: &[usize]) -> f32 {
        if labels.is_empty() {
            return 0.;
        }

        let correct = embeddings
            .axis_iter(Axis(0))
            .zip(labels)
            .filter(|(row, label)| classifier::classify(&self.state.centroids, *row).class == Some(**label))
            .count();

        correct as f32 / labels.len() as f32
    }
}

/// Trains a model with the execution mode selected by `config.replica_count`.
///
/// # Arguments
/// * `config` - The run's configuration.
/// * `extractor` - The embedding extractor, cloned once per replica.
/// * `init` - Fresh initialization or parameters to resume from.
/// * `train` - The training set.
/// * `validation` - The validation set.
/// * `checkpoint` - Where the parameters are saved after every epoch.
pub async fn train<E, D, V, C>(
    config: &TrainingConfig,
    extractor: E,
    init: ParamInit,
    train: &mut D,
    validation: &mut V,
    checkpoint: &C,
) -> Result<(TrainingState, Vec<EpochReport>)>
where
    E: EmbeddingExtractor,
    D: DataSource,
    V: DataSource,
    C: Checkpoint,
{
    info!(replicas = config.replica_count, epochs = config.max_step; "starting training");

    match config.replica_count {
        0 => {
            let controller = Controller::single(config.clone(), extractor, init)?;
            controller.run(train, validation, checkpoint).await
        }
        _ => {
            let controller = Controller::multi(config.clone(), extractor, init)?;
            controller.run(train, validation, checkpoint).await
        }
    }
}

/// Pulls the next batch from `source` if it's a full one.
///
/// A trailing partial batch is dropped with a notice and ends the pass.
pub(crate) fn next_full_batch<D: DataSource>(source: &mut D, batch_size: usize) -> Option<Batch> {
    let batch = source.next_batch()?;

    if batch.len() < batch_size {
        info!(examples = batch.len(), batch_size = batch_size; "dropping the last batch, it isn't a full one");
        return None;
    }

    Some(batch)
}

pub(crate) fn check_batch_size<D: DataSource>(source: &D, batch_size: usize, what: &str) -> Result<()> {
    if source.batch_size() != batch_size {
        return Err(OrchestratorError::InvalidConfig(format!(
            "the {what} data source yields batches of {}, the config expects {batch_size}",
            source.batch_size()
        )));
    }

    Ok(())
}

/// Stacks per-batch embeddings into one matrix.
pub(crate) fn stack(embeddings: &[Array2<f32>]) -> Result<Array2<f32>> {
    let views: Vec<ArrayView2<f32>> = embeddings.iter().map(|e| e.view()).collect();
    Ok(concatenate(Axis(0), &views).map_err(MlErr::from)?)
}
