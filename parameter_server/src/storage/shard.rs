use parking_lot::{Mutex, RwLock};

use crate::{
    optimization::Optimizer,
    storage::{Result, SizeMismatchErr},
};

/// A slice of the model's parameters together with two gradient accumulators.
///
/// Replicas accumulate into the active gradient while the frozen one is averaged,
/// applied through the optimizer and cleared by `update_params`.
#[derive(Debug)]
pub struct ParameterShard<O: Optimizer> {
    nparams: usize,
    grads: [Mutex<Box<[f32]>>; 2],
    params: RwLock<Box<[f32]>>,
    optimizer: Mutex<O>,
}

impl<O: Optimizer> ParameterShard<O> {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `params` - The initial state of the parameters.
    /// * `optimizer` - The optimization algorithm for this slice of parameters.
    pub fn new(params: Vec<f32>, optimizer: O) -> Self {
        let nparams = params.len();

        Self {
            nparams,
            grads: [
                Mutex::new(vec![0.; nparams].into_boxed_slice()),
                Mutex::new(vec![0.; nparams].into_boxed_slice()),
            ],
            params: RwLock::new(params.into_boxed_slice()),
            optimizer: Mutex::new(optimizer),
        }
    }

    /// Adds `grad` into the gradient at `active_idx`.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `grad` isn't the same size as this shard.
    pub fn accumulate(&self, active_idx: usize, grad: &[f32]) -> Result<()> {
        SizeMismatchErr::check(grad.len(), self.nparams)?;

        self.grads[active_idx]
            .lock()
            .iter_mut()
            .zip(grad)
            .for_each(|(acc, g)| *acc += g);

        Ok(())
    }

    /// Divides the gradient at `frozen_idx` by `contributions`, applies the resulting mean
    /// gradient to the parameters and clears the accumulator.
    ///
    /// # Arguments
    /// * `frozen_idx` - The index of the frozen gradient, must be `0` or `1`.
    /// * `contributions` - The amount of gradients summed into the frozen accumulator.
    pub fn update_params(&self, frozen_idx: usize, contributions: usize) -> Result<()> {
        let mut params = self.params.write();
        let mut grad = self.grads[frozen_idx].lock();

        let replicas = contributions as f32;
        grad.iter_mut().for_each(|g| *g /= replicas);

        let res = self.optimizer.lock().update_params(&grad, &mut params);
        grad.fill(0.);
        res
    }

    /// Clears the gradient at `frozen_idx` without applying it.
    pub fn discard(&self, frozen_idx: usize) {
        self.grads[frozen_idx].lock().fill(0.);
    }

    /// Copies the shard's parameters into `out`.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `out` isn't the same size as this shard.
    pub fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(out.len(), self.nparams)?;
        out.copy_from_slice(&self.params.read());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AddOptimizer;

    impl Optimizer for AddOptimizer {
        fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
            params.iter_mut().zip(grad).for_each(|(p, g)| *p += g);
            Ok(())
        }

        fn learning_rate(&self) -> f32 {
            1.
        }
    }

    #[test]
    fn update_applies_the_mean_of_contributions() {
        let shard = ParameterShard::new(vec![0.; 3], AddOptimizer);

        shard.accumulate(0, &[1.0, 2.0, 3.0]).unwrap();
        shard.accumulate(0, &[3.0, 2.0, 1.0]).unwrap();
        shard.update_params(0, 2).unwrap();

        let mut out = [0.; 3];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [2., 2., 2.]);
        assert_eq!(**shard.grads[0].lock(), [0., 0., 0.]);
    }

    #[test]
    fn double_buffering_keeps_accumulators_apart() {
        let shard = ParameterShard::new(vec![0.], AddOptimizer);

        shard.accumulate(0, &[10.]).unwrap();
        shard.accumulate(1, &[5.]).unwrap();
        shard.update_params(0, 1).unwrap();

        let mut out = [0.];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [10.]);

        shard.update_params(1, 1).unwrap();
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [15.]);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let shard = ParameterShard::new(vec![0.; 2], AddOptimizer);

        let err = shard.accumulate(0, &[1.]).unwrap_err();
        assert_eq!(err, SizeMismatchErr { got: 1, expected: 2 });

        let mut out = [0.; 3];
        assert!(shard.pull_params(&mut out).is_err());
    }
}
