use crate::storage::Result;

/// Defines the strategy for updating model parameters based on the averaged gradient.
pub trait Optimizer {
    /// Updates `params` in place using `grad`.
    ///
    /// # Arguments
    /// * `grad` - The averaged gradient, one value per parameter.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// The base step size of the algorithm.
    fn learning_rate(&self) -> f32;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        (**self).update_params(grad, params)
    }

    fn learning_rate(&self) -> f32 {
        (**self).learning_rate()
    }
}
