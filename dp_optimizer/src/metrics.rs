/// Counters kept across optimization steps, for observability only.
#[derive(Debug, Default, Clone)]
pub struct StepMetrics {
    pub steps: u64,
    pub noisy_steps: u64,
    pub reduced_params: u64,
    pub microbatches: u64,
}

impl StepMetrics {
    #[inline]
    pub fn bump_step(&mut self) {
        self.steps += 1;
    }

    #[inline]
    pub fn bump_noisy_step(&mut self) {
        self.noisy_steps += 1;
    }

    #[inline]
    pub fn add_reduced_params(&mut self, n: usize) {
        self.reduced_params += n as u64;
    }

    #[inline]
    pub fn add_microbatches(&mut self, n: usize) {
        self.microbatches += n as u64;
    }
}
