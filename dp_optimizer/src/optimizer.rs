use collective::Collective;
use log::debug;

use crate::{
    accumulate::GradAccumulator,
    config::{DpSpec, LossReduction},
    error::Result,
    metrics::StepMetrics,
    noise::NoiseStrategy,
    params::{ParamLayout, StepGrads},
    reduce::Reducer,
    update::UpdateRule,
};

/// Orchestrates one privacy-preserving optimization step per call.
///
/// Design:
/// - Local accumulation is finalized into step-scoped gradient state.
/// - The noise strategy runs before any cross-worker combination.
/// - The blocking collective is the only cross-worker synchronization point.
/// - Any failure surfaces from the step before the update rule runs.
///
/// Worker identity (`rank`, `world_size`) is read from the same collective
/// handle the gradients are reduced through, so the identity and the group's
/// own view of its membership cannot diverge.
pub struct DpOptimizer<N, U, C> {
    spec: DpSpec,
    accumulator: GradAccumulator,
    reducer: Reducer,
    noise: N,
    update: U,
    group: C,
    metrics: StepMetrics,
}

impl<N, U, C> DpOptimizer<N, U, C>
where
    N: NoiseStrategy,
    U: UpdateRule,
    C: Collective,
{
    /// Creates the optimizer for one worker.
    ///
    /// # Args
    /// * `spec` - The privacy calibration, identical on every worker.
    /// * `layout` - The model's parameters, identical on every worker.
    /// * `noise` - The noise strategy selected for this deployment.
    /// * `update` - The wrapped weight-update rule.
    /// * `group` - This worker's collective handle.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid calibration.
    pub fn new(spec: DpSpec, layout: ParamLayout, noise: N, update: U, group: C) -> Result<Self> {
        spec.validate()?;
        let reducer = Reducer::new(spec.loss_reduction);

        Ok(Self {
            accumulator: GradAccumulator::new(layout),
            reducer,
            spec,
            noise,
            update,
            group,
            metrics: StepMetrics::default(),
        })
    }

    pub fn spec(&self) -> &DpSpec {
        &self.spec
    }

    pub fn group(&self) -> &C {
        &self.group
    }

    /// The step's gradient sink; feed it one call per clipped microbatch.
    pub fn accumulator(&mut self) -> &mut GradAccumulator {
        &mut self.accumulator
    }

    pub fn update_rule(&self) -> &U {
        &self.update
    }

    pub fn metrics(&self) -> &StepMetrics {
        &self.metrics
    }

    /// Runs one full step: finalize, noise, scale, reduce, update.
    ///
    /// Callable once per training iteration; every worker in the group must
    /// call it the same number of times.
    ///
    /// # Errors
    /// Any stage failure aborts the step before the update rule is invoked;
    /// the accumulated gradients for the step are discarded.
    pub fn step(&mut self) -> Result<()> {
        let microbatches = self.accumulator.microbatches();
        let grads = self.reduce_phase()?;

        self.update_phase(&grads, microbatches)
    }

    /// Like `step`, evaluating `closure` between reduction and update and
    /// returning its value (conventionally a recomputed loss).
    ///
    /// # Errors
    /// See `step`.
    pub fn step_with<F>(&mut self, closure: F) -> Result<f32>
    where
        F: FnOnce() -> f32,
    {
        let microbatches = self.accumulator.microbatches();
        let grads = self.reduce_phase()?;

        let loss = closure();
        self.update_phase(&grads, microbatches)?;

        Ok(loss)
    }

    /// Finalize, noise, scale, reduce: the gradients leave this worker
    /// exactly once, noisy on the leader only, and come back
    /// group-identical.
    fn reduce_phase(&mut self) -> Result<StepGrads> {
        let mut grads = self.accumulator.finalize()?;

        self.noise.add_noise(&mut grads)?;
        self.scale_grad(&mut grads);
        self.reducer.reduce(&mut grads, &self.group)?;

        Ok(grads)
    }

    fn update_phase(&mut self, grads: &StepGrads, microbatches: usize) -> Result<()> {
        let currents = grads.currents();
        self.update.apply(&currents)?;

        self.metrics.bump_step();
        self.metrics.add_reduced_params(grads.trainable_count());
        self.metrics.add_microbatches(microbatches);

        if self.group.is_leader() {
            self.metrics.bump_noisy_step();
        }

        debug!(
            step = self.metrics.steps,
            rank = self.group.rank(),
            params = grads.trainable_count();
            "applied reduced gradients"
        );

        Ok(())
    }

    /// Mean-reduced losses over a declared batch size divide the gradient
    /// before the combine; a no-op when no batch size was declared.
    fn scale_grad(&self, grads: &mut StepGrads) {
        let Some(batch_size) = self.spec.expected_batch_size else {
            return;
        };

        if self.spec.loss_reduction != LossReduction::Mean {
            return;
        }

        let denom = batch_size.get() as f32;

        for grad in grads.trainable_mut() {
            if let Some(current) = grad.current_mut() {
                for x in current.iter_mut() {
                    *x /= denom;
                }
            }
        }
    }
}
