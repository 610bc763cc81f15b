pub mod centroids;
pub mod checkpoint;
pub mod classifier;
pub mod configs;
pub mod controller;
pub mod devices;
pub mod error;
pub mod params;
pub mod pipeline;

pub use centroids::CentroidTable;
pub use checkpoint::{Checkpoint, SafetensorsCheckpoint};
pub use configs::{OptimizerConfig, TrainingConfig};
pub use controller::{Controller, EpochReport, TrainingState, train};
pub use devices::{Device, DeviceCatalog};
pub use error::{OrchestratorError, Result};
pub use params::ParamInit;
pub use pipeline::{Pipeline, VerificationReport, VerificationResult, restore};
