use crate::error::Result;

/// The weight-update seam fed by the privacy-preserving step.
///
/// Implementations receive the final reduced gradients, index-aligned with
/// the parameter layout (`None` for parameters that hold no gradient), and
/// apply whatever update arithmetic they encapsulate. By the time this runs,
/// every worker in the group holds the identical gradients, so replicated
/// weights stay replicated.
pub trait UpdateRule {
    /// # Args
    /// * `grads` - Per-parameter reduced gradients, in layout order.
    ///
    /// # Errors
    /// Implementation-defined; any error fails the enclosing step.
    fn apply(&mut self, grads: &[Option<&[f32]>]) -> Result<()>;
}

impl<U: UpdateRule + ?Sized> UpdateRule for Box<U> {
    fn apply(&mut self, grads: &[Option<&[f32]>]) -> Result<()> {
        (**self).apply(grads)
    }
}

/// Plain gradient descent over flat per-parameter weight buffers.
pub struct Sgd {
    learning_rate: f32,
    weights: Vec<Vec<f32>>,
}

impl Sgd {
    /// # Args
    /// * `learning_rate` - The length of the steps taken against the
    ///   gradient.
    /// * `weights` - One flat buffer per parameter, in layout order.
    pub fn new(learning_rate: f32, weights: Vec<Vec<f32>>) -> Self {
        Self {
            learning_rate,
            weights,
        }
    }

    pub fn weights(&self) -> &[Vec<f32>] {
        &self.weights
    }
}

impl UpdateRule for Sgd {
    fn apply(&mut self, grads: &[Option<&[f32]>]) -> Result<()> {
        let lr = self.learning_rate;

        for (weights, grad) in self.weights.iter_mut().zip(grads) {
            let Some(grad) = grad else { continue };

            for (w, g) in weights.iter_mut().zip(*grad) {
                *w -= lr * g;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgd_steps_against_the_gradient() {
        let mut sgd = Sgd::new(0.5, vec![vec![1.0, 2.0], vec![3.0]]);

        sgd.apply(&[Some(&[2.0, -2.0]), None]).unwrap();

        assert_eq!(sgd.weights()[0], [0.0, 3.0]);
        assert_eq!(sgd.weights()[1], [3.0]);
    }
}
