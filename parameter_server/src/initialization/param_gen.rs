/// A `ParamGen` generates values for the initial state of the model's parameters.
pub trait ParamGen {
    /// Should sample at most `n` parameters.
    ///
    /// # Arguments
    /// * `n` - The upper limit of samples to generate.
    ///
    /// # Returns
    /// The next values, or `None` once the generator is exhausted.
    fn sample(&mut self, n: usize) -> Option<Vec<f32>>;
}

impl<P: ParamGen + ?Sized> ParamGen for Box<P> {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        (**self).sample(n)
    }
}
