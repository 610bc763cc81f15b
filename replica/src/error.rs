use std::{error::Error, fmt};

use machine_learning::MlErr;
use ndarray::ShapeError;
use parameter_server::SizeMismatchErr;
use tokio::task::JoinError;

/// The replica module's result type.
pub type Result<T> = std::result::Result<T, ReplicaErr>;

/// Replica execution failures, every one of them is fatal for the run.
#[derive(Debug)]
pub enum ReplicaErr {
    /// Sharding a batch across zero replicas.
    ZeroReplicas,
    Extractor {
        replica: usize,
        source: MlErr,
    },
    Store(SizeMismatchErr),
    Join(JoinError),
    /// The replicas produced embeddings of different dimensions.
    Shape(ShapeError),
    /// The extractor returned an inference result for a training step.
    MissingLoss {
        replica: usize,
    },
    /// A replica task died in an earlier step and the set can't run without it.
    Lost {
        expected: usize,
        got: usize,
    },
}

impl fmt::Display for ReplicaErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaErr::ZeroReplicas => write!(f, "can't shard a batch across zero replicas"),
            ReplicaErr::Extractor { replica, source } => {
                write!(f, "replica {replica} failed to run its shard: {source}")
            }
            ReplicaErr::Store(e) => write!(f, "parameter store error: {e}"),
            ReplicaErr::Join(e) => write!(f, "replica task failed: {e}"),
            ReplicaErr::Shape(e) => write!(f, "can't gather the replica embeddings: {e}"),
            ReplicaErr::MissingLoss { replica } => {
                write!(f, "replica {replica} produced no loss for a training step")
            }
            ReplicaErr::Lost { expected, got } => {
                write!(f, "only {got} of {expected} replicas are left after a failed task")
            }
        }
    }
}

impl Error for ReplicaErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplicaErr::Extractor { source, .. } => Some(source),
            ReplicaErr::Store(e) => Some(e),
            ReplicaErr::Join(e) => Some(e),
            ReplicaErr::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SizeMismatchErr> for ReplicaErr {
    fn from(value: SizeMismatchErr) -> Self {
        Self::Store(value)
    }
}

impl From<JoinError> for ReplicaErr {
    fn from(value: JoinError) -> Self {
        Self::Join(value)
    }
}

impl From<ShapeError> for ReplicaErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}
