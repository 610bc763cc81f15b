use super::Optimizer;
use crate::storage::{Result, SizeMismatchErr};

/// Gradient descent, with optional classical momentum.
#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
    momentum: Option<(f32, Box<[f32]>)>,
}

impl GradientDescent {
    /// Creates a plain `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: None,
        }
    }

    /// Creates a `GradientDescent` optimizer that keeps a velocity per parameter.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance updates.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `mu` - The fraction of the previous velocity kept on every update.
    pub fn with_momentum(len: usize, learning_rate: f32, mu: f32) -> Self {
        Self {
            learning_rate,
            momentum: Some((mu, vec![0.; len].into_boxed_slice())),
        }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(grad.len(), params.len())?;
        let lr = self.learning_rate;

        match &mut self.momentum {
            None => params.iter_mut().zip(grad).for_each(|(p, g)| *p -= lr * g),
            Some((mu, velocity)) => {
                SizeMismatchErr::check(velocity.len(), params.len())?;
                let mu = *mu;

                params
                    .iter_mut()
                    .zip(grad)
                    .zip(velocity.iter_mut())
                    .for_each(|((p, g), v)| {
                        *v = mu * *v + g;
                        *p -= lr * *v;
                    });
            }
        }

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}
