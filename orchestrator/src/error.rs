use std::{fmt, io};

use machine_learning::MlErr;
use parameter_server::{SizeMismatchErr, initialization::RandErr};
use replica::ReplicaErr;
use safetensors::SafeTensorError;

/// The orchestrator's result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All errors that can occur while training or verifying.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before any work starts.
    InvalidConfig(String),
    Io(io::Error),
    Json(serde_json::Error),
    /// A checkpoint file couldn't be written or read back.
    Checkpoint(SafeTensorError),
    /// A checkpoint file doesn't match the model's parameter layout.
    CheckpointMismatch { tensor: String, reason: String },
    Ml(MlErr),
    Init(RandErr),
    Store(SizeMismatchErr),
    /// A replica failed while running a step, fatal for the run.
    Replica(ReplicaErr),
    /// A data source yielded no full batch for an epoch or pass.
    EmptyEpoch { what: &'static str },
    /// No class comparison was made during verification, the accuracy is undefined.
    NoComparisons,
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
            Self::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            Self::CheckpointMismatch { tensor, reason } => {
                write!(f, "checkpoint tensor {tensor} doesn't match the model: {reason}")
            }
            Self::Ml(e) => write!(f, "{e}"),
            Self::Init(e) => write!(f, "parameter initialization failed: {e}"),
            Self::Store(e) => write!(f, "parameter store error: {e}"),
            Self::Replica(e) => write!(f, "{e}"),
            Self::EmptyEpoch { what } => {
                write!(f, "the {what} data source has no full batch")
            }
            Self::NoComparisons => {
                write!(f, "no class comparison was made, the accuracy is undefined")
            }
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
            Self::Ml(e) => Some(e),
            Self::Init(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Replica(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<SafeTensorError> for OrchestratorError {
    fn from(e: SafeTensorError) -> Self {
        Self::Checkpoint(e)
    }
}

impl From<MlErr> for OrchestratorError {
    fn from(e: MlErr) -> Self {
        Self::Ml(e)
    }
}

impl From<RandErr> for OrchestratorError {
    fn from(e: RandErr) -> Self {
        Self::Init(e)
    }
}

impl From<SizeMismatchErr> for OrchestratorError {
    fn from(e: SizeMismatchErr) -> Self {
        Self::Store(e)
    }
}

impl From<ReplicaErr> for OrchestratorError {
    fn from(e: ReplicaErr) -> Self {
        Self::Replica(e)
    }
}

/// Boundary conversion for binaries.
impl From<OrchestratorError> for io::Error {
    fn from(value: OrchestratorError) -> Self {
        match value {
            OrchestratorError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
