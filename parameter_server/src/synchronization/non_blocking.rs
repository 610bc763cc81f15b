use super::Synchronizer;
use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// Applies every gradient as soon as it arrives, used when training runs on a single replica.
#[derive(Clone, Default)]
pub struct NoBlockingSync;

impl NoBlockingSync {
    pub fn new() -> Self {
        Self
    }
}

impl Synchronizer for NoBlockingSync {
    async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<()>
    where
        O: Optimizer + Send,
    {
        handle.accumulate(grad).await?;
        handle.update_params().await?;
        handle.pull_params(params).await
    }

    async fn abstain<O>(&self, _handle: &ParameterHandle<O>)
    where
        O: Optimizer + Send,
    {
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::{
        ParameterStore, initialization::ConstParamGen, optimization::GradientDescent,
    };

    #[tokio::test(flavor = "multi_thread")]
    async fn every_step_updates_the_parameters() {
        let shard_size = NonZeroUsize::new(2).unwrap();
        let store = ParameterStore::new(shard_size, ConstParamGen::new(1., 3), |_| {
            GradientDescent::new(0.5)
        });
        let handle = ParameterHandle::new(store);
        let sync = NoBlockingSync::new();

        let mut params = [0.; 3];
        sync.step(&handle, &[1., 2., 4.], &mut params).await.unwrap();
        assert_eq!(params, [0.5, 0., -1.]);

        sync.step(&handle, &[1., 0., 0.], &mut params).await.unwrap();
        assert_eq!(params, [0., 0., -1.]);
    }
}
