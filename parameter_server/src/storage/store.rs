use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
};

use log::debug;
use rayon::prelude::*;

use super::ParameterShard;
use crate::{
    initialization::ParamGen,
    optimization::Optimizer,
    storage::{Result, SizeMismatchErr},
};

/// The single logical parameter set shared by every replica.
///
/// Parameters are partitioned in shards so accumulation, averaging and the optimizer
/// step run in parallel. These methods are private to the module, they become
/// available through the async interface of a `ParameterHandle`.
#[derive(Debug)]
pub struct ParameterStore<O: Optimizer> {
    nparams: usize,
    active_idx: Arc<AtomicU8>,
    updating: Arc<AtomicBool>,
    contributions: Arc<[AtomicUsize; 2]>,
    shards: Arc<[ParameterShard<O>]>,
    shard_size: NonZeroUsize,
}

impl<O: Optimizer> Clone for ParameterStore<O> {
    fn clone(&self) -> Self {
        Self {
            nparams: self.nparams,
            active_idx: Arc::clone(&self.active_idx),
            updating: Arc::clone(&self.updating),
            contributions: Arc::clone(&self.contributions),
            shards: Arc::clone(&self.shards),
            shard_size: self.shard_size,
        }
    }
}

impl<O: Optimizer> ParameterStore<O> {
    /// Creates a new `ParameterStore`.
    ///
    /// # Arguments
    /// * `shard_size` - The maximum amount of parameters per shard.
    /// * `param_gen` - The generator of the initial parameters, drained until exhausted.
    /// * `optimizer_factory` - Builds the optimizer of each shard given its length.
    pub fn new<PG, OF>(shard_size: NonZeroUsize, mut param_gen: PG, mut optimizer_factory: OF) -> Self
    where
        PG: ParamGen,
        OF: FnMut(usize) -> O,
    {
        let mut nparams = 0;
        let mut shards = Vec::new();

        while let Some(params) = param_gen.sample(shard_size.get()) {
            nparams += params.len();
            let optimizer = optimizer_factory(params.len());
            shards.push(ParameterShard::new(params, optimizer));
        }

        debug!(params = nparams, shards = shards.len(); "created parameter store");

        Self {
            nparams,
            active_idx: Arc::new(AtomicU8::new(0)),
            updating: Arc::new(AtomicBool::new(false)),
            contributions: Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]),
            shards: Arc::from(shards),
            shard_size,
        }
    }

    /// The amount of parameters in the store.
    pub fn len(&self) -> usize {
        self.nparams
    }

    pub fn is_empty(&self) -> bool {
        self.nparams == 0
    }
}

impl<O: Optimizer + Send> ParameterStore<O> {
    /// Adds a replica's gradient into the active accumulator.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `grad` doesn't hold exactly one value per parameter.
    pub(super) fn accumulate(&self, grad: &[f32]) -> Result<()> {
        SizeMismatchErr::check(grad.len(), self.nparams)?;
        let active_idx = self.active_idx.load(Ordering::Acquire) as usize;

        self.shards
            .par_iter()
            .zip(grad.par_chunks(self.shard_size.get()))
            .try_for_each(|(shard, grad_slice)| shard.accumulate(active_idx, grad_slice))?;

        self.contributions[active_idx].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Swaps the active accumulator and applies the mean of the frozen one to the parameters.
    ///
    /// The mean divides by the amount of `accumulate` calls since the last update, so every
    /// contribution has to land before this is called. Concurrent calls are ignored while
    /// an update is running, and an update with no contributions leaves the parameters as is.
    pub(super) fn update_params(&self) -> Result<()> {
        self.with_frozen(|shard, frozen_idx, contributions| {
            shard.update_params(frozen_idx, contributions)
        })
    }

    /// Swaps the active accumulator and clears the frozen one, leaving the parameters as is.
    pub(super) fn discard_update(&self) -> Result<()> {
        self.with_frozen(|shard, frozen_idx, _| {
            shard.discard(frozen_idx);
            Ok(())
        })
    }

    /// Freezes the active accumulator and runs `f` on every shard with the frozen index
    /// and the amount of contributions it holds.
    fn with_frozen<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&ParameterShard<O>, usize, usize) -> Result<()> + Send + Sync,
    {
        let acquired = self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();

        if !acquired {
            return Ok(());
        }

        let frozen_idx = self.active_idx.fetch_xor(1, Ordering::AcqRel) as usize;
        let contributions = self.contributions[frozen_idx].swap(0, Ordering::AcqRel);

        let res = if contributions > 0 {
            self.shards
                .par_iter()
                .try_for_each(|shard| f(shard, frozen_idx, contributions))
        } else {
            Ok(())
        };

        self.updating.store(false, Ordering::Release);
        res
    }

    /// Gathers all the sharded parameters into `out`.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `out` doesn't hold exactly one value per parameter.
    pub(super) fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(out.len(), self.nparams)?;

        self.shards
            .par_iter()
            .zip(out.par_chunks_mut(self.shard_size.get()))
            .try_for_each(|(shard, out_slice)| shard.pull_params(out_slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initialization::ConstParamGen;

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

    fn create_test_store(params: usize, shard_size: usize) -> ParameterStore<AddOptimizer> {
        let shard_size = NonZeroUsize::new(shard_size).unwrap();
        let param_gen = ConstParamGen::new(0., params);
        ParameterStore::new(shard_size, param_gen, |_| AddOptimizer)
    }

    #[test]
    fn ragged_shards_cover_every_parameter() {
        const PARAMS: usize = 105;
        const SHARD_SIZE: usize = 10;

        let store = create_test_store(PARAMS, SHARD_SIZE);
        assert_eq!(store.len(), PARAMS);
        assert_eq!(store.shards.len(), 11);

        store.accumulate(&[1.0; PARAMS]).unwrap();
        store.update_params().unwrap();

        let mut out = [0.0; PARAMS];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [1.0; PARAMS]);
    }

    #[test]
    fn update_averages_every_contribution() {
        const PARAMS: usize = 4;

        let store = create_test_store(PARAMS, 3);
        store.accumulate(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        store.accumulate(&[3.0, 2.0, 1.0, 0.0]).unwrap();
        store.accumulate(&[2.0, 2.0, 2.0, 2.0]).unwrap();
        store.update_params().unwrap();

        let mut out = [0.0; PARAMS];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn buffer_swap_defers_late_gradients() {
        const PARAMS: usize = 10;

        let store = create_test_store(PARAMS, 1);
        store.accumulate(&[1.0; PARAMS]).unwrap();

        store.update_params().unwrap();
        assert_eq!(store.active_idx.load(Ordering::Acquire), 1);
        store.accumulate(&[5.0; PARAMS]).unwrap();

        let mut params = [0.0; PARAMS];
        store.pull_params(&mut params).unwrap();
        assert_eq!(params, [1.0; PARAMS]);

        store.update_params().unwrap();
        store.pull_params(&mut params).unwrap();
        assert_eq!(params, [6.0; PARAMS]);
    }

    #[test]
    fn discarded_update_leaves_params_untouched() {
        const PARAMS: usize = 4;

        let store = create_test_store(PARAMS, 3);
        store.accumulate(&[7.0; PARAMS]).unwrap();
        store.discard_update().unwrap();

        let mut out = [9.0; PARAMS];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [0.0; PARAMS]);

        // Nothing of the dropped gradient leaks into the following updates.
        store.accumulate(&[1.0; PARAMS]).unwrap();
        store.update_params().unwrap();
        store.accumulate(&[2.0; PARAMS]).unwrap();
        store.update_params().unwrap();
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [3.0; PARAMS]);
    }

    #[test]
    fn update_without_contributions_is_a_no_op() {
        let store = create_test_store(3, 2);
        store.update_params().unwrap();

        let mut out = [9.0; 3];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [0.0; 3]);
    }

    #[test]
    fn concurrent_update_is_skipped() {
        let store = create_test_store(10, 1);
        store.updating.store(true, Ordering::SeqCst);

        let active_idx = store.active_idx.load(Ordering::Acquire);
        store.update_params().unwrap();
        assert_eq!(store.active_idx.load(Ordering::Acquire), active_idx);

        store.updating.store(false, Ordering::Release);
        store.update_params().unwrap();
        assert_ne!(store.active_idx.load(Ordering::SeqCst), active_idx);
    }

    #[test]
    fn mismatched_gradient_is_rejected() {
        let store = create_test_store(4, 2);
        let err = store.accumulate(&[1.0; 5]).unwrap_err();
        assert_eq!(err, SizeMismatchErr { got: 5, expected: 4 });
        assert_eq!(store.contributions[0].load(Ordering::Acquire), 0);
    }
}
