use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::warn;
use tokio::sync::Barrier;

use super::Synchronizer;
use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// Synchronizes parameter updates across every replica using a barrier.
///
/// No replica observes new parameters until all of them contributed their gradient
/// for the step, and the leader of the barrier applies the averaged update exactly once.
/// If any replica fails its part of the step the whole update is dropped, so the
/// parameters only ever move by a mean over every replica.
#[derive(Clone)]
pub struct BarrierSync {
    barrier: Arc<Barrier>,
    poisoned: Arc<AtomicBool>,
}

impl BarrierSync {
    /// Creates a new `BarrierSync` synchronizer.
    ///
    /// # Arguments
    /// * `replicas` - The amount of replicas to wait on until updating the parameters of the model.
    pub fn new(replicas: usize) -> Self {
        Self {
            barrier: Arc::new(Barrier::new(replicas)),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Waits for every replica of the step, then the leader either applies the averaged
    /// gradient or, when a replica failed, clears it.
    async fn settle<O>(&self, handle: &ParameterHandle<O>) -> Result<()>
    where
        O: Optimizer + Send,
    {
        if !self.barrier.wait().await.is_leader() {
            return Ok(());
        }

        if self.poisoned.swap(false, Ordering::AcqRel) {
            warn!("a replica failed its step, discarding the accumulated gradients");
            return handle.discard_update().await;
        }

        let updated = handle.update_params().await;
        if let Err(e) = &updated {
            warn!(got = e.got, expected = e.expected; "parameter update failed");
        }

        updated
    }
}

impl Synchronizer for BarrierSync {
    async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<()>
    where
        O: Optimizer + Send,
    {
        // Both barriers are always awaited, otherwise a failing replica would leave
        // the rest of them waiting forever.
        let accumulated = handle.accumulate(grad).await;
        if accumulated.is_err() {
            self.poisoned.store(true, Ordering::Release);
        }

        let updated = self.settle(handle).await;
        self.barrier.wait().await;

        accumulated?;
        updated?;
        handle.pull_params(params).await
    }

    async fn abstain<O>(&self, handle: &ParameterHandle<O>)
    where
        O: Optimizer + Send,
    {
        self.poisoned.store(true, Ordering::Release);

        // The leader already logged a failed update.
        let _ = self.settle(handle).await;
        self.barrier.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use tokio::task::JoinSet;

    use super::*;
    use crate::{
        ParameterStore, SizeMismatchErr, initialization::ConstParamGen,
        optimization::GradientDescent,
    };

    fn create_handle(params: usize) -> ParameterHandle<GradientDescent> {
        let shard_size = NonZeroUsize::new(3).unwrap();
        let store = ParameterStore::new(shard_size, ConstParamGen::new(0., params), |_| {
            GradientDescent::new(1.)
        });
        ParameterHandle::new(store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replicas_observe_the_same_averaged_update() {
        const REPLICAS: usize = 4;

        let handle = create_handle(5);
        let sync = BarrierSync::new(REPLICAS);
        let mut tasks = JoinSet::new();

        for i in 0..REPLICAS {
            let handle = handle.clone();
            let sync = sync.clone();

            tasks.spawn(async move {
                let grad = [i as f32; 5];
                let mut params = [0.; 5];
                sync.step(&handle, &grad, &mut params).await.map(|_| params)
            });
        }

        let expected = [-1.5; 5];
        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap().unwrap(), expected);
        }
    }

    /// Runs one step of `grads.len()` replicas and returns the parameters each one pulled.
    async fn step_all(
        handle: &ParameterHandle<GradientDescent>,
        sync: &BarrierSync,
        grads: &[f32],
    ) -> Vec<[f32; 2]> {
        let mut tasks = JoinSet::new();

        for (i, &g) in grads.iter().enumerate() {
            let handle = handle.clone();
            let sync = sync.clone();

            tasks.spawn(async move {
                let mut params = [0.; 2];
                sync.step(&handle, &[g; 2], &mut params).await.map(|_| (i, params))
            });
        }

        let mut pulled: Vec<_> = tasks
            .join_all()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        pulled.sort_by_key(|(i, _)| *i);
        pulled.into_iter().map(|(_, params)| params).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_failing_replica_drops_the_whole_update() {
        let handle = create_handle(2);
        let sync = BarrierSync::new(2);

        let bad = {
            let handle = handle.clone();
            let sync = sync.clone();
            tokio::spawn(async move {
                let mut params = [0.; 2];
                sync.step(&handle, &[1.; 3], &mut params).await
            })
        };

        let mut params = [9.; 2];
        sync.step(&handle, &[2.; 2], &mut params).await.unwrap();
        assert_eq!(params, [0.; 2]);

        let err = bad.await.unwrap().unwrap_err();
        assert_eq!(err, SizeMismatchErr { got: 3, expected: 2 });

        // The survivor's gradient was dropped along with the step.
        assert_eq!(step_all(&handle, &sync, &[1., 3.]).await, [[-2.; 2], [-2.; 2]]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abstaining_replica_releases_the_barrier_without_an_update() {
        let handle = create_handle(2);
        let sync = BarrierSync::new(2);

        let abstainer = {
            let handle = handle.clone();
            let sync = sync.clone();
            tokio::spawn(async move { sync.abstain(&handle).await })
        };

        let mut params = [9.; 2];
        sync.step(&handle, &[4.; 2], &mut params).await.unwrap();
        abstainer.await.unwrap();
        assert_eq!(params, [0.; 2]);
        assert_eq!(handle.snapshot().await.unwrap(), [0.; 2]);

        assert_eq!(step_all(&handle, &sync, &[2., 2.]).await, [[-2.; 2], [-2.; 2]]);
    }
}
