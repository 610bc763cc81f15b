use log::debug;
use machine_learning::model::ParamLayout;
use parameter_server::{
    ParameterHandle, ParameterStore,
    initialization::{ChainedParamGen, ConstParamGen, FixedParamGen, ParamGen, RandParamGen},
    optimization::Optimizer,
};
use rand::{SeedableRng, rngs::StdRng};

use crate::{OrchestratorError, Result, configs::TrainingConfig};

/// The optimizer type of every store the orchestrator builds, chosen by the config.
pub type DynOptimizer = Box<dyn Optimizer + Send>;

/// Where the initial parameters of a run come from.
#[derive(Debug, Clone)]
pub enum ParamInit {
    /// Seeded random initialization.
    Fresh,
    /// Parameters restored from a checkpoint, used to resume or to verify.
    Restored(Vec<f32>),
}

/// Builds the generator of fresh parameters for `layout`.
///
/// Bias segments start at zero, every other segment is Xavier-uniform over its last
/// dimension as fan-out. Each segment draws from its own rng seeded from `seed` and its
/// position, so a segment's values don't depend on the ones before it.
pub fn initial_param_gen(layout: &ParamLayout, seed: u64) -> Result<ChainedParamGen> {
    let mut param_gens: Vec<Box<dyn ParamGen + Send>> = Vec::with_capacity(layout.segments().len());

    for (i, seg) in layout.segments().iter().enumerate() {
        if seg.name.ends_with("bias") {
            param_gens.push(Box::new(ConstParamGen::new(0., seg.len())));
            continue;
        }

        let fan_out = seg.shape.last().copied().unwrap_or(1).max(1);
        let fan_in = (seg.len() / fan_out).max(1);
        let rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
        param_gens.push(Box::new(RandParamGen::xavier_uniform(
            rng,
            seg.len(),
            fan_in,
            fan_out,
        )?));
    }

    Ok(ChainedParamGen::new(param_gens))
}

/// Creates the shared parameter store of a run.
///
/// # Returns
/// The handle to the store, or an error if restored parameters don't match `layout`.
pub fn build_handle(
    config: &TrainingConfig,
    layout: &ParamLayout,
    init: ParamInit,
) -> Result<ParameterHandle<DynOptimizer>> {
    let param_gen: Box<dyn ParamGen + Send> = match init {
        ParamInit::Fresh => Box::new(initial_param_gen(layout, config.seed)?),
        ParamInit::Restored(params) => {
            layout.check("restored params", &params)?;
            Box::new(FixedParamGen::new(params))
        }
    };

    let optimizer = config.optimizer;
    let store = ParameterStore::new(config.store_shard_size()?, param_gen, |len| {
        optimizer.build(len)
    });

    if store.len() != layout.size() {
        return Err(OrchestratorError::InvalidConfig(format!(
            "the parameter store holds {} parameters, the model needs {}",
            store.len(),
            layout.size()
        )));
    }

    debug!(params = store.len(), lr = optimizer.learning_rate(); "built parameter store");
    Ok(ParameterHandle::new(store))
}
