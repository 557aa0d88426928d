use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::{DpErr, Result};

/// Whether the training objective is averaged or summed across contributions.
///
/// `Mean` triggers the post-combine division by the group's world size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReduction {
    #[default]
    Mean,
    Sum,
}

/// Privacy calibration for one optimizer instance.
///
/// Exchanged during job bootstrap and identical on every worker; only the act
/// of sampling noise is restricted to the group leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpSpec {
    /// Scale factor applied to the clipping bound to obtain the injected
    /// noise's standard deviation.
    pub noise_multiplier: f32,

    /// Upper bound on each example's gradient norm, enforced upstream.
    pub max_grad_norm: f32,

    /// Nominal per-step batch size; divides mean-reduced gradients before
    /// the cross-worker combine when present.
    #[serde(default)]
    pub expected_batch_size: Option<NonZeroUsize>,

    #[serde(default)]
    pub loss_reduction: LossReduction,
}

impl DpSpec {
    /// Creates a spec with mean loss reduction and no expected batch size.
    ///
    /// # Args
    /// * `noise_multiplier` - Noise scale relative to the clipping bound.
    /// * `max_grad_norm` - The per-example clipping bound.
    ///
    /// # Returns
    /// A `DpSpec` instance. Call `validate` before use.
    pub fn new(noise_multiplier: f32, max_grad_norm: f32) -> Self {
        Self {
            noise_multiplier,
            max_grad_norm,
            expected_batch_size: None,
            loss_reduction: LossReduction::default(),
        }
    }

    /// Per-coordinate standard deviation of the injected noise.
    pub fn noise_std(&self) -> f32 {
        self.noise_multiplier * self.max_grad_norm
    }

    /// Checks the calibration parameters.
    ///
    /// # Errors
    /// Returns `InvalidNoiseMultiplier` for a negative or non-finite
    /// multiplier, `InvalidClipBound` for a non-positive or non-finite
    /// clipping bound. Invalid values are never silently corrected.
    pub fn validate(&self) -> Result<()> {
        if !self.noise_multiplier.is_finite() || self.noise_multiplier < 0.0 {
            return Err(DpErr::InvalidNoiseMultiplier {
                got: self.noise_multiplier,
            });
        }

        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(DpErr::InvalidClipBound {
                got: self.max_grad_norm,
            });
        }

        Ok(())
    }
}
