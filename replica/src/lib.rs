pub mod error;
pub mod replica;
pub mod set;
pub mod shard;

pub use error::{ReplicaErr, Result};
pub use replica::{Replica, StepOutput};
pub use set::ReplicaSet;
pub use shard::ShardPlan;
