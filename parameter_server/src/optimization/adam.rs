use super::Optimizer;
use crate::storage::{Result, SizeMismatchErr};

/// The Adam optimization algorithm with bias-corrected moment estimates.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Box<[f32]>,
    v: Box<[f32]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance updates.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.,
            beta2_t: 1.,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
        }
    }

    /// Creates an `Adam` optimizer with the usual `0.9`, `0.999` and `1e-8` hyperparameters.
    pub fn with_defaults(len: usize, learning_rate: f32) -> Self {
        Self::new(len, learning_rate, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(grad.len(), params.len())?;
        SizeMismatchErr::check(self.m.len(), params.len())?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let step_size = lr * (1. - self.beta2_t).sqrt() / (1. - self.beta1_t);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
            .for_each(|((p, g), (m, v))| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
                *p -= step_size * *m / (v.sqrt() + eps);
            });

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_the_learning_rate() {
        let mut opt = Adam::with_defaults(2, 0.1);
        let mut params = [1.0, 1.0];
        opt.update_params(&[0.5, -3.0], &mut params).unwrap();

        // The bias-corrected first step is `lr * sign(g)` up to epsilon.
        assert!((params[0] - 0.9).abs() < 1e-4);
        assert!((params[1] - 1.1).abs() < 1e-4);
    }

    #[test]
    fn converges_on_a_quadratic() {
        let mut opt = Adam::with_defaults(1, 0.05);
        let mut params = [5.0];

        for _ in 0..2000 {
            let grad = [2.0 * (params[0] - 1.0)];
            opt.update_params(&grad, &mut params).unwrap();
        }

        assert!((params[0] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn rejects_foreign_lengths() {
        let mut opt = Adam::with_defaults(2, 0.1);
        let mut params = [0.0; 3];
        assert!(opt.update_params(&[0.0; 3], &mut params).is_err());
    }
}
