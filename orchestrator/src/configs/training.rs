use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use parameter_server::optimization::{Adam, GradientDescent, Optimizer};
use serde::{Deserialize, Serialize};

use crate::{OrchestratorError, Result, devices::Device};

/// The optimization algorithm applied by the single parameter update of every step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        lr: f32,
        #[serde(default = "default_b1")]
        b1: f32,
        #[serde(default = "default_b2")]
        b2: f32,
        #[serde(default = "default_eps")]
        eps: f32,
    },
    GradientDescent {
        lr: f32,
    },
    GradientDescentWithMomentum {
        lr: f32,
        mu: f32,
    },
}

fn default_b1() -> f32 {
    0.9
}

fn default_b2() -> f32 {
    0.999
}

fn default_eps() -> f32 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            lr: 1e-3,
            b1: default_b1(),
            b2: default_b2(),
            eps: default_eps(),
        }
    }
}

impl OptimizerConfig {
    pub fn learning_rate(&self) -> f32 {
        match *self {
            Self::Adam { lr, .. }
            | Self::GradientDescent { lr }
            | Self::GradientDescentWithMomentum { lr, .. } => lr,
        }
    }

    /// Builds the optimizer for a store shard of `len` parameters.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer + Send> {
        match *self {
            Self::Adam { lr, b1, b2, eps } => Box::new(Adam::new(len, lr, b1, b2, eps)),
            Self::GradientDescent { lr } => Box::new(GradientDescent::new(lr)),
            Self::GradientDescentWithMomentum { lr, mu } => {
                Box::new(GradientDescent::with_momentum(len, lr, mu))
            }
        }
    }
}

/// The immutable parameters of a training or verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub model_name: String,
    pub batch_size: usize,
    /// The amount of data-parallel replicas, `0` runs the single-process path.
    #[serde(default)]
    pub replica_count: usize,
    /// The amount of epochs to train for.
    pub max_step: usize,
    pub n_speaker: usize,
    pub embedding_dim: usize,
    pub feature_dim: usize,
    pub save_path: PathBuf,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,
    #[serde(default)]
    pub seed: u64,
    /// The devices the replicas may be placed on, `replica_count` of them are selected.
    #[serde(default)]
    pub devices: Vec<Device>,
}

fn default_shard_size() -> usize {
    1024
}

impl TrainingConfig {
    /// Reads and validates a config from a json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every constraint the run relies on.
    ///
    /// A batch size that isn't divisible by the amount of replicas is accepted, the
    /// remainder of every batch is dropped by the sharder.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("max_step", self.max_step),
            ("n_speaker", self.n_speaker),
            ("embedding_dim", self.embedding_dim),
            ("feature_dim", self.feature_dim),
            ("shard_size", self.shard_size),
        ];

        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{field} must be greater than zero"
            )));
        }

        if self.model_name.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "model_name can't be empty".into(),
            ));
        }

        let lr = self.learning_rate();
        if !lr.is_finite() || lr <= 0. {
            return Err(OrchestratorError::InvalidConfig(format!(
                "the learning rate must be a positive number, got {lr}"
            )));
        }

        if self.replica_count > self.batch_size {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{} replicas can't share batches of {} examples",
                self.replica_count, self.batch_size
            )));
        }

        if !self.devices.is_empty() && self.devices.len() < self.replica_count {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{} replicas requested but only {} devices are available",
                self.replica_count,
                self.devices.len()
            )));
        }

        Ok(())
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    /// The shard size of the parameter store.
    ///
    /// # Errors
    /// If the configured size is zero.
    pub fn store_shard_size(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.shard_size)
            .ok_or_else(|| OrchestratorError::InvalidConfig("shard_size must be greater than zero".into()))
    }

    /// Where the model parameters are checkpointed.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.save_path.join(format!("{}.safetensors", self.model_name))
    }

    /// Where the verification report is written.
    pub fn report_path(&self) -> PathBuf {
        self.save_path.join("result.txt")
    }
}
