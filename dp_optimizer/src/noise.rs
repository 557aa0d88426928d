use collective::Collective;
use log::debug;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{
    config::DpSpec,
    error::Result,
    params::StepGrads,
};

/// Turns summed gradients into the gradients entering the cross-worker
/// combine, sampling calibrated noise where the strategy calls for it.
///
/// Either every trainable parameter is treated or the step aborts; partial
/// application never survives into the reduction stage.
pub trait NoiseStrategy {
    /// # Errors
    /// Any failure aborts the step before reduction.
    fn add_noise(&mut self, grads: &mut StepGrads) -> Result<()>;
}

/// Single-process strategy: every call samples fresh Gaussian noise with
/// per-coordinate standard deviation `noise_multiplier * max_grad_norm`.
pub struct LocalNoise<R: Rng> {
    noise: Normal<f32>,
    rng: R,
}

impl<R: Rng> LocalNoise<R> {
    /// # Args
    /// * `spec` - The privacy calibration.
    /// * `rng` - The noise source.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid calibration.
    pub fn new(spec: &DpSpec, rng: R) -> Result<Self> {
        spec.validate()?;
        let noise = Normal::new(0.0, spec.noise_std())?;

        Ok(Self { noise, rng })
    }
}

impl<R: Rng> NoiseStrategy for LocalNoise<R> {
    fn add_noise(&mut self, grads: &mut StepGrads) -> Result<()> {
        for grad in grads.trainable_mut() {
            let mut current = grad.summed().to_vec();

            for x in current.iter_mut() {
                *x += self.noise.sample(&mut self.rng);
            }

            grad.set_current(current)?;
        }

        Ok(())
    }
}

/// Distributed strategy: the group leader samples exactly like `LocalNoise`,
/// every other worker passes its summed gradient through verbatim.
///
/// One injection followed by the group sum keeps the total noise variance at
/// the calibrated `(noise_multiplier * max_grad_norm)^2`; sampling on every
/// worker would multiply it by the world size.
pub struct DistributedNoise<R: Rng> {
    leader: bool,
    rank: usize,
    inner: LocalNoise<R>,
}

impl<R: Rng> DistributedNoise<R> {
    /// # Args
    /// * `spec` - The privacy calibration, identical on every worker.
    /// * `group` - The collective this worker reduces through; the leader
    ///   tag is read from it.
    /// * `rng` - The noise source, only ever sampled on the leader.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid calibration.
    pub fn new<C: Collective>(spec: &DpSpec, group: &C, rng: R) -> Result<Self> {
        Ok(Self {
            leader: group.is_leader(),
            rank: group.rank(),
            inner: LocalNoise::new(spec, rng)?,
        })
    }
}

impl<R: Rng> NoiseStrategy for DistributedNoise<R> {
    fn add_noise(&mut self, grads: &mut StepGrads) -> Result<()> {
        if self.leader {
            debug!(rank = self.rank; "injecting calibrated noise");
            return self.inner.add_noise(grads);
        }

        for grad in grads.trainable_mut() {
            let current = grad.summed().to_vec();
            grad.set_current(current)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use collective::LocalGroup;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        accumulate::GradAccumulator,
        params::{ParamLayout, ParamMeta},
    };

    fn grads_for(summed: &[f32]) -> StepGrads {
        let layout = ParamLayout::new(vec![ParamMeta::new("w", summed.len(), true)]);
        let mut acc = GradAccumulator::new(layout);
        acc.accumulate(0, summed).unwrap();
        acc.finalize().unwrap()
    }

    fn two_workers() -> (LocalGroup, LocalGroup) {
        let mut group = LocalGroup::group(NonZeroUsize::new(2).unwrap());
        let follower = group.pop().unwrap();
        let leader = group.pop().unwrap();
        (leader, follower)
    }

    #[test]
    fn the_follower_passes_its_summed_gradient_through_verbatim() {
        let (_, follower) = two_workers();
        let spec = DpSpec::new(1.3, 1.0);
        let rng = StdRng::seed_from_u64(1);

        let mut noise = DistributedNoise::new(&spec, &follower, rng).unwrap();
        let mut grads = grads_for(&[3.0, -1.5, 0.25]);
        noise.add_noise(&mut grads).unwrap();

        let grad = grads.param(0).unwrap();
        let summed: Vec<_> = grad.summed().iter().map(|x| x.to_bits()).collect();
        let current: Vec<_> = grad.current().unwrap().iter().map(|x| x.to_bits()).collect();
        assert_eq!(summed, current);
    }

    #[test]
    fn the_leader_perturbs_every_coordinate() {
        let (leader, _) = two_workers();
        let spec = DpSpec::new(0.7, 1.0);
        let rng = StdRng::seed_from_u64(2);

        let mut noise = DistributedNoise::new(&spec, &leader, rng).unwrap();
        let mut grads = grads_for(&[3.0, -1.5, 0.25]);
        noise.add_noise(&mut grads).unwrap();

        let grad = grads.param(0).unwrap();
        let current = grad.current().unwrap();
        assert_eq!(current.len(), grad.summed().len());
        assert!(
            grad.summed()
                .iter()
                .zip(current)
                .all(|(s, c)| s != c)
        );
    }

    #[test]
    fn a_zero_multiplier_adds_exactly_zero_noise() {
        let (leader, _) = two_workers();
        let spec = DpSpec::new(0.0, 1.0);
        let rng = StdRng::seed_from_u64(3);

        let mut noise = DistributedNoise::new(&spec, &leader, rng).unwrap();
        let mut grads = grads_for(&[3.0]);
        noise.add_noise(&mut grads).unwrap();

        assert_eq!(grads.param(0).unwrap().current().unwrap(), [3.0]);
    }

    #[test]
    fn noise_variance_matches_the_calibration() {
        const N: usize = 20_000;

        // sigma = 0.5 * 2.0 = 1.0 per coordinate.
        let spec = DpSpec::new(0.5, 2.0);
        let rng = StdRng::seed_from_u64(4);
        let mut noise = LocalNoise::new(&spec, rng).unwrap();

        let mut grads = grads_for(&vec![0.0; N]);
        noise.add_noise(&mut grads).unwrap();

        let samples = grads.param(0).unwrap().current().unwrap();
        let mean = samples.iter().sum::<f32>() / N as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / N as f32;

        let expected = spec.noise_std().powi(2);
        assert!(
            (var - expected).abs() < 0.1 * expected,
            "sample variance {var} too far from {expected}"
        );
    }
}
