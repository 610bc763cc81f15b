mod training;

pub use training::{OptimizerConfig, TrainingConfig};
