pub mod model;
pub mod dataset;
pub mod error;

pub use error::{MlErr, Result};
