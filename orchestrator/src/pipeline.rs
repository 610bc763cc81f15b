use std::{
    fmt::Write as _,
    fs,
    io::{BufWriter, Write},
    path::Path,
};

use log::info;
use machine_learning::{dataset::DataSource, model::EmbeddingExtractor};
use ndarray::{Array2, ArrayView2, Axis};
use parameter_server::{BarrierSync, NoBlockingSync, Synchronizer};
use replica::ReplicaSet;

use crate::{
    OrchestratorError, Result,
    centroids::CentroidTable,
    checkpoint::Checkpoint,
    classifier::{self, Prediction},
    configs::TrainingConfig,
    controller::{check_batch_size, next_full_batch, stack},
    params::{self, DynOptimizer, ParamInit},
};

/// The verification outcome of one test embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub index: usize,
    pub truth: usize,
    pub prediction: Prediction,
}

impl VerificationResult {
    pub fn correct(&self) -> bool {
        self.prediction.class == Some(self.truth)
    }
}

/// Every verification result plus the counters behind the reported accuracy.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
    /// The amount of test embeddings whose true class held the running best at some
    /// point of the scan, even if a later class overtook it.
    pub support: usize,
    /// The amount of class comparisons that replaced a sample's running best.
    pub comparisons: usize,
}

impl VerificationReport {
    /// Scores every test embedding against the enrolled centroids.
    ///
    /// # Arguments
    /// * `table` - The enrolled centroids.
    /// * `embeddings` - The `[n, dim]` test embeddings.
    /// * `labels` - The true class of each test embedding.
    pub fn score(table: &CentroidTable, embeddings: ArrayView2<f32>, labels: &[usize]) -> Self {
        let results: Vec<VerificationResult> = embeddings
            .axis_iter(Axis(0))
            .zip(labels)
            .enumerate()
            .map(|(index, (row, &truth))| VerificationResult {
                index,
                truth,
                prediction: classifier::classify(table, row),
            })
            .collect();

        let support = results.iter().filter(|r| r.prediction.led(r.truth)).count();
        let comparisons = results.iter().map(|r| r.prediction.improvements()).sum();

        Self {
            results,
            support,
            comparisons,
        }
    }

    /// The count of test embeddings whose true class led the scan at some point.
    pub fn num_true(&self) -> usize {
        self.support
    }

    /// `support / comparisons`, the accuracy written to the report.
    ///
    /// # Returns
    /// `OrchestratorError::NoComparisons` if no comparison was made.
    pub fn accuracy(&self) -> Result<f32> {
        if self.comparisons == 0 {
            return Err(OrchestratorError::NoComparisons);
        }

        Ok(self.support as f32 / self.comparisons as f32)
    }

    /// The fraction of test embeddings whose top-1 class is their own.
    pub fn top1_accuracy(&self) -> f32 {
        if self.results.is_empty() {
            return 0.;
        }

        let correct = self.results.iter().filter(|r| r.correct()).count();
        correct as f32 / self.results.len() as f32
    }

    /// Writes the summary line followed by one line per test embedding.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        writeln!(w, "Acc:{:.4}  Num_of_true:{}", self.accuracy()?, self.num_true())?;

        for result in &self.results {
            writeln!(w, "{}", format_result(result))?;
        }

        w.flush()?;
        Ok(())
    }

    /// Writes the report to `path`, replacing any previous one.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        info!("writing the verification report to {}", path.display());
        let file = fs::File::create(path)?;
        self.write_to(BufWriter::new(file))
    }
}

fn format_result(result: &VerificationResult) -> String {
    let pred = result
        .prediction
        .class
        .map_or_else(|| "None".to_string(), |class| class.to_string());
    let correct = if result.correct() { "True" } else { "False" };

    let mut scores = String::from("[");
    for (i, score) in result.prediction.scores.iter().enumerate() {
        if i > 0 {
            scores.push_str(", ");
        }
        let _ = write!(scores, "{score:?}");
    }
    scores.push(']');

    format!(
        "No.{} vector, pred:{pred} {correct} Score list:{scores}",
        result.index
    )
}

/// Enrolls speakers and verifies a test set against them with fixed parameters.
pub struct Pipeline<E: EmbeddingExtractor, S> {
    config: TrainingConfig,
    replicas: ReplicaSet<E, DynOptimizer, S>,
}

impl<E: EmbeddingExtractor> Pipeline<E, NoBlockingSync> {
    /// Creates a pipeline that runs every batch on a single replica.
    pub fn single(config: TrainingConfig, extractor: E, params: Vec<f32>) -> Result<Self> {
        config.validate()?;
        let handle = params::build_handle(&config, extractor.layout(), ParamInit::Restored(params))?;
        let replicas = ReplicaSet::single(extractor, handle);
        Ok(Self { config, replicas })
    }
}

impl<E: EmbeddingExtractor> Pipeline<E, BarrierSync> {
    /// Creates a pipeline that shards every batch across `config.replica_count` replicas.
    pub fn multi(config: TrainingConfig, extractor: E, params: Vec<f32>) -> Result<Self> {
        config.validate()?;
        let handle = params::build_handle(&config, extractor.layout(), ParamInit::Restored(params))?;
        let replicas = ReplicaSet::multi(extractor, handle, config.replica_count)?;
        Ok(Self { config, replicas })
    }
}

impl<E, S> Pipeline<E, S>
where
    E: EmbeddingExtractor,
    S: Synchronizer + Sync + 'static,
{
    /// Builds one centroid per class from the enrollment set, as the true mean of the
    /// class embeddings.
    pub async fn enroll<D: DataSource>(&mut self, enroll: &mut D) -> Result<CentroidTable> {
        info!("enrolling");
        let (embeddings, labels) = self.embed_all(enroll, "enrollment").await?;
        CentroidTable::from_enrollment(self.config.n_speaker, embeddings.view(), &labels)
    }

    /// Scores every test embedding against `table`.
    pub async fn verify<D: DataSource>(&mut self, table: &CentroidTable, test: &mut D) -> Result<VerificationReport> {
        info!("testing");
        let (embeddings, labels) = self.embed_all(test, "test").await?;
        let report = VerificationReport::score(table, embeddings.view(), &labels);

        info!(
            samples = report.results.len(),
            num_true = report.num_true(),
            comparisons = report.comparisons;
            "verified test set"
        );
        Ok(report)
    }

    /// Runs every full batch of `source` through the extractor in inference mode.
    async fn embed_all<D: DataSource>(&mut self, source: &mut D, what: &'static str) -> Result<(Array2<f32>, Vec<usize>)> {
        let batch_size = self.config.batch_size;
        check_batch_size(source, batch_size, what)?;

        let mut embeddings = Vec::new();
        let mut labels = Vec::new();

        while let Some(batch) = next_full_batch(source, batch_size) {
            let (batch_embeddings, batch_labels) = self.replicas.infer(&batch).await?;
            embeddings.push(batch_embeddings);
            labels.extend(batch_labels);
        }
        source.reset_batch_counter();

        if embeddings.is_empty() {
            return Err(OrchestratorError::EmptyEpoch { what });
        }

        Ok((stack(&embeddings)?, labels))
    }
}

/// Restores the checkpointed model, enrolls, verifies and writes the report to
/// `config.report_path()`.
///
/// # Returns
/// The verification report.
pub async fn restore<E, D, T, C>(
    config: &TrainingConfig,
    extractor: E,
    checkpoint: &C,
    enroll: &mut D,
    test: &mut T,
) -> Result<VerificationReport>
where
    E: EmbeddingExtractor,
    D: DataSource,
    T: DataSource,
    C: Checkpoint,
{
    let params = checkpoint.restore(extractor.layout())?;

    let report = match config.replica_count {
        0 => {
            let mut pipeline = Pipeline::single(config.clone(), extractor, params)?;
            let table = pipeline.enroll(enroll).await?;
            pipeline.verify(&table, test).await?
        }
        _ => {
            let mut pipeline = Pipeline::multi(config.clone(), extractor, params)?;
            let table = pipeline.enroll(enroll).await?;
            pipeline.verify(&table, test).await?
        }
    };

    report.save(config.report_path())?;
    Ok(report)
}
