use crate::{
    error::{DpErr, Result},
    params::{ParamGrad, ParamLayout, StepGrads},
};

/// Accumulates already-clipped microbatch gradients for the current step.
///
/// Contract: every contribution passed to `accumulate` must already have its
/// per-example norm bounded by the configured clipping bound. This layer
/// never re-clips; it trusts the bound the noise calibration was derived
/// from.
#[derive(Debug)]
pub struct GradAccumulator {
    layout: ParamLayout,
    summed: Vec<Option<Vec<f32>>>,
    microbatches: usize,
}

impl GradAccumulator {
    /// Creates an empty accumulator over the given layout.
    pub fn new(layout: ParamLayout) -> Self {
        let summed = (0..layout.len()).map(|_| None).collect();

        Self {
            layout,
            summed,
            microbatches: 0,
        }
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Microbatches accumulated since the last finalize.
    pub fn microbatches(&self) -> usize {
        self.microbatches
    }

    /// Adds one microbatch's clipped gradient into a parameter's summed
    /// buffer, allocating the buffer on first use.
    ///
    /// # Args
    /// * `param` - Index of the parameter within the layout.
    /// * `grad` - The microbatch's summed, clipped gradient.
    ///
    /// # Errors
    /// Returns `UnknownParam` for an out-of-layout index, `NotTrainable` for
    /// a parameter that takes no gradients, and `GradLengthMismatch` when
    /// `grad` disagrees with the parameter's length.
    pub fn accumulate(&mut self, param: usize, grad: &[f32]) -> Result<()> {
        let meta = self
            .layout
            .get(param)
            .ok_or(DpErr::UnknownParam { index: param })?;

        if !meta.requires_grad() {
            return Err(DpErr::NotTrainable {
                param: meta.name().to_string(),
            });
        }

        if grad.len() != meta.len() {
            return Err(DpErr::GradLengthMismatch {
                param: meta.name().to_string(),
                got: grad.len(),
                expected: meta.len(),
            });
        }

        match &mut self.summed[param] {
            Some(summed) => {
                for (s, g) in summed.iter_mut().zip(grad) {
                    *s += g;
                }
            }
            slot => *slot = Some(grad.to_vec()),
        }

        self.microbatches += 1;
        Ok(())
    }

    /// Validates the accumulated state and moves it out as step-scoped
    /// gradients, leaving the accumulator empty for the next step.
    ///
    /// On failure the accumulated state is left untouched, so the caller can
    /// either top up the missing contribution or `reset`.
    ///
    /// # Returns
    /// The step's gradients, index-aligned with the layout.
    ///
    /// # Errors
    /// Returns `MissingSummedGrad` if any trainable parameter received no
    /// contributions this step.
    pub fn finalize(&mut self) -> Result<StepGrads> {
        for (meta, summed) in self.layout.iter().zip(&self.summed) {
            if meta.requires_grad() && summed.is_none() {
                return Err(DpErr::MissingSummedGrad {
                    param: meta.name().to_string(),
                });
            }
        }

        let grads = self
            .layout
            .iter()
            .zip(&mut self.summed)
            .map(|(meta, summed)| {
                summed
                    .take()
                    .map(|buf| ParamGrad::new(meta.name().to_string(), buf))
            })
            .collect();

        self.microbatches = 0;
        Ok(StepGrads::new(grads))
    }

    /// Drops any partially accumulated state.
    pub fn reset(&mut self) {
        for summed in &mut self.summed {
            summed.take();
        }

        self.microbatches = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamMeta;

    fn layout() -> ParamLayout {
        ParamLayout::new(vec![
            ParamMeta::new("weight", 2, true),
            ParamMeta::new("running_stat", 2, false),
            ParamMeta::new("bias", 1, true),
        ])
    }

    #[test]
    fn microbatches_sum_into_the_same_buffer() {
        let mut acc = GradAccumulator::new(layout());

        acc.accumulate(0, &[1.0, 2.0]).unwrap();
        acc.accumulate(0, &[0.5, -1.0]).unwrap();
        acc.accumulate(2, &[3.0]).unwrap();
        assert_eq!(acc.microbatches(), 3);

        let grads = acc.finalize().unwrap();
        assert_eq!(grads.param(0).unwrap().summed(), [1.5, 1.0]);
        assert!(grads.param(1).is_none());
        assert_eq!(grads.param(2).unwrap().summed(), [3.0]);

        // The accumulator starts the next step clean.
        assert_eq!(acc.microbatches(), 0);
        assert!(matches!(
            acc.finalize(),
            Err(DpErr::MissingSummedGrad { .. })
        ));
    }

    #[test]
    fn contributions_are_validated_against_the_layout() {
        let mut acc = GradAccumulator::new(layout());

        assert!(matches!(
            acc.accumulate(7, &[1.0]),
            Err(DpErr::UnknownParam { index: 7 })
        ));
        assert!(matches!(
            acc.accumulate(1, &[1.0, 2.0]),
            Err(DpErr::NotTrainable { .. })
        ));
        assert!(matches!(
            acc.accumulate(0, &[1.0]),
            Err(DpErr::GradLengthMismatch { .. })
        ));

        assert_eq!(acc.microbatches(), 0);
    }

    #[test]
    fn finalize_requires_every_trainable_parameter() {
        let mut acc = GradAccumulator::new(layout());
        acc.accumulate(0, &[1.0, 2.0]).unwrap();

        let err = acc.finalize();
        assert!(matches!(err, Err(DpErr::MissingSummedGrad { param }) if param == "bias"));

        // Failure leaves the state intact: topping up makes finalize pass.
        acc.accumulate(2, &[1.0]).unwrap();
        let grads = acc.finalize().unwrap();
        assert_eq!(grads.param(0).unwrap().summed(), [1.0, 2.0]);
    }

    #[test]
    fn reset_drops_partial_state() {
        let mut acc = GradAccumulator::new(layout());
        acc.accumulate(0, &[1.0, 2.0]).unwrap();

        acc.reset();
        assert_eq!(acc.microbatches(), 0);
        assert!(matches!(
            acc.finalize(),
            Err(DpErr::MissingSummedGrad { .. })
        ));
    }
}
