use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// Executes a single parameter update step.
///
/// A `Synchronizer` decides when the gradients accumulated by the replicas are
/// averaged into the shared parameters.
#[allow(unused)]
#[trait_variant::make(Synchronizer: Send)]
pub trait SynchronizerTemplate: Clone {
    /// Accumulates this replica's gradient, updates the parameters once the policy allows
    /// it and copies the resulting parameters into `params`.
    ///
    /// # Arguments
    /// * `handle` - The parameter handle holding the parameters of the model.
    /// * `grad` - The incoming gradient to accumulate.
    /// * `params` - Where to write the resultant parameters.
    ///
    /// # Returns
    /// An error if there's a size mismatch between `grad`, `params` and the size of the storage.
    async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<()>
    where
        O: Optimizer + Send;

    /// Takes part in a step without contributing a gradient, used by a replica whose
    /// forward pass failed so the rest of them aren't left waiting.
    ///
    /// # Arguments
    /// * `handle` - The parameter handle holding the parameters of the model.
    async fn abstain<O>(&self, handle: &ParameterHandle<O>)
    where
        O: Optimizer + Send;
}
