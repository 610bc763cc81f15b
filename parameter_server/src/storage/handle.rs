use std::ops::Deref;

use tokio::task;

use super::{ParameterStore, Result};
use crate::optimization::Optimizer;

/// The async interface to a `ParameterStore`.
///
/// It bridges the async runtime with the blocking CPU-bound implementation of the
/// store, so it must be used from a multi-threaded tokio runtime.
pub struct ParameterHandle<O: Optimizer>(ParameterStore<O>);

impl<O: Optimizer> Clone for ParameterHandle<O> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<O: Optimizer> Deref for ParameterHandle<O> {
    type Target = ParameterStore<O>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<O: Optimizer> ParameterHandle<O> {
    pub fn new(store: ParameterStore<O>) -> Self {
        Self(store)
    }
}

impl<O: Optimizer + Send> ParameterHandle<O> {
    /// Async call to `ParameterStore::accumulate`.
    ///
    /// # Arguments
    /// * `grad` - A flat slice containing a replica's gradient.
    pub async fn accumulate(&self, grad: &[f32]) -> Result<()> {
        task::block_in_place(|| self.0.accumulate(grad))
    }

    /// Async call to `ParameterStore::update_params`.
    pub async fn update_params(&self) -> Result<()> {
        task::block_in_place(|| self.0.update_params())
    }

    /// Async call to `ParameterStore::discard_update`.
    pub async fn discard_update(&self) -> Result<()> {
        task::block_in_place(|| self.0.discard_update())
    }

    /// Async call to `ParameterStore::pull_params`.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    pub async fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        task::block_in_place(|| self.0.pull_params(out))
    }

    /// Copies the current parameters into a new buffer.
    pub async fn snapshot(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.; self.0.len()];
        self.pull_params(&mut out).await?;
        Ok(out)
    }
}
