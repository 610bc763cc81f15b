pub mod aggregation;
pub mod initialization;
pub mod optimization;
pub mod storage;
pub mod synchronization;

pub use aggregation::{average_gradients, average_losses};
pub use storage::{ParameterHandle, ParameterStore, SizeMismatchErr};
pub use synchronization::{BarrierSync, NoBlockingSync, Synchronizer};
