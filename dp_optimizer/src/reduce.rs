use collective::Collective;

use crate::{
    config::LossReduction,
    error::Result,
    params::StepGrads,
};

/// Combines every worker's in-flight gradients into the identical group-wide
/// gradient.
pub struct Reducer {
    reduction: LossReduction,
}

impl Reducer {
    pub fn new(reduction: LossReduction) -> Self {
        Self { reduction }
    }

    /// Sum-combines each trainable parameter's current gradient across the
    /// group in layout order, then normalizes by the world size under mean
    /// reduction. Non-trainable parameters are skipped entirely.
    ///
    /// Every worker must call this with the same layout, once per step; the
    /// collective pairs up contributions purely by call order.
    ///
    /// # Errors
    /// Returns `MissingCurrentGrad` if a trainable parameter was not treated
    /// by the noise stage, and propagates any collective failure. Either way
    /// the step is aborted: partially reduced gradients must not reach an
    /// update.
    pub fn reduce<C: Collective>(&self, grads: &mut StepGrads, group: &C) -> Result<()> {
        let world_size = group.world_size() as f32;

        for grad in grads.trainable_mut() {
            let current = grad.current_mut_or_missing()?;
            group.all_reduce_sum(current)?;

            if self.reduction == LossReduction::Mean {
                for x in current.iter_mut() {
                    *x /= world_size;
                }
            }
        }

        Ok(())
    }
}
