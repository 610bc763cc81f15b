use super::ParamGen;

/// A parameter generator that delegates to a chain of generators, one after the other.
///
/// This becomes handy whenever one wants a different initialization for each parameter
/// segment of the model, each generator knowing how many values it has to produce.
pub struct ChainedParamGen {
    param_gens: Vec<Box<dyn ParamGen + Send>>,
    curr: usize,
}

impl ChainedParamGen {
    pub fn new(param_gens: Vec<Box<dyn ParamGen + Send>>) -> Self {
        Self {
            param_gens,
            curr: 0,
        }
    }
}

impl ParamGen for ChainedParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        let mut out = Vec::with_capacity(n);

        while out.len() < n && self.curr < self.param_gens.len() {
            match self.param_gens[self.curr].sample(n - out.len()) {
                Some(sample) if !sample.is_empty() => out.extend(sample),
                _ => self.curr += 1,
            }
        }

        (!out.is_empty()).then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{super::ConstParamGen, *};

    #[test]
    fn empty() {
        let mut param_gen = ChainedParamGen::new(vec![]);
        assert!(param_gen.sample(1).is_none());
    }

    #[test]
    fn crosses_generator_boundaries() {
        let param_gens: Vec<Box<dyn ParamGen + Send>> = vec![
            Box::new(ConstParamGen::new(0., 1)),
            Box::new(ConstParamGen::new(1., 3)),
        ];

        let mut param_gen = ChainedParamGen::new(param_gens);
        assert_eq!(param_gen.sample(2).unwrap(), [0., 1.]);
        assert_eq!(param_gen.sample(3).unwrap(), [1., 1.]);
        assert!(param_gen.sample(1).is_none());
    }

    #[test]
    fn nested_chains() {
        let inner: Vec<Box<dyn ParamGen + Send>> = vec![
            Box::new(ConstParamGen::new(1., 1)),
            Box::new(ConstParamGen::new(2., 1)),
        ];

        let param_gens: Vec<Box<dyn ParamGen + Send>> = vec![
            Box::new(ConstParamGen::new(0., 1)),
            Box::new(ChainedParamGen::new(inner)),
            Box::new(ConstParamGen::new(3., 1)),
        ];

        let mut param_gen = ChainedParamGen::new(param_gens);
        assert_eq!(param_gen.sample(4).unwrap(), [0., 1., 2., 3.]);
        assert!(param_gen.sample(1).is_none());
    }
}
