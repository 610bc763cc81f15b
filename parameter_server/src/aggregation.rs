//! Averaging of the per-replica outputs of a training step.

use crate::storage::{Result, SizeMismatchErr};

/// Averages the gradients produced by every replica in the same step.
///
/// The gradients are summed in the order given and the sum is divided by the amount of
/// replicas, so the result doesn't depend on how the replicas were scheduled.
///
/// # Arguments
/// * `grads` - One flat gradient per replica, all of the same length.
///
/// # Returns
/// The element-wise mean, an empty vector if there are no gradients or a `SizeMismatchErr`
/// if any gradient differs in length from the first one.
pub fn average_gradients(grads: &[&[f32]]) -> Result<Vec<f32>> {
    let Some((first, rest)) = grads.split_first() else {
        return Ok(Vec::new());
    };

    let mut sum = first.to_vec();
    for grad in rest {
        SizeMismatchErr::check(grad.len(), sum.len())?;
        sum.iter_mut().zip(grad.iter()).for_each(|(s, g)| *s += g);
    }

    let replicas = grads.len() as f32;
    sum.iter_mut().for_each(|s| *s /= replicas);
    Ok(sum)
}

/// Averages the scalar losses produced by every replica in the same step.
///
/// # Returns
/// The arithmetic mean, or `None` if there are no losses.
pub fn average_losses(losses: &[f32]) -> Option<f32> {
    if losses.is_empty() {
        return None;
    }

    Some(losses.iter().sum::<f32>() / losses.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_element_wise() {
        let a = [1., 2., 3.];
        let b = [3., 4., 5.];
        assert_eq!(average_gradients(&[&a, &b]).unwrap(), [2., 3., 4.]);
    }

    #[test]
    fn single_gradient_is_returned_unchanged() {
        let a = [0.25, -1.];
        assert_eq!(average_gradients(&[&a]).unwrap(), a);
    }

    #[test]
    fn no_gradients() {
        assert!(average_gradients(&[]).unwrap().is_empty());
    }

    #[test]
    fn mismatched_lengths_error() {
        let a = [1., 2.];
        let b = [1.];
        let err = average_gradients(&[&a, &b]).unwrap_err();
        assert_eq!(err, SizeMismatchErr { got: 1, expected: 2 });
    }

    #[test]
    fn loss_mean() {
        assert_eq!(average_losses(&[1., 2., 6.]), Some(3.));
        assert_eq!(average_losses(&[]), None);
    }
}
