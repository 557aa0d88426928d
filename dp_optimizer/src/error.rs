use std::{error::Error, fmt};

use collective::CollectiveErr;
use rand_distr::NormalError;

/// The gradient-step layer's result type.
pub type Result<T> = std::result::Result<T, DpErr>;

/// Failures of the privacy-preserving gradient step.
///
/// None of these are recoverable within the step: the caller must treat the
/// step as aborted and must not feed partial gradients to an update.
#[derive(Debug)]
pub enum DpErr {
    InvalidNoiseMultiplier {
        got: f32,
    },
    InvalidClipBound {
        got: f32,
    },
    UnknownParam {
        index: usize,
    },
    NotTrainable {
        param: String,
    },
    GradLengthMismatch {
        param: String,
        got: usize,
        expected: usize,
    },
    MissingSummedGrad {
        param: String,
    },
    MissingCurrentGrad {
        param: String,
    },
    Noise(NormalError),
    Collective(CollectiveErr),
}

impl fmt::Display for DpErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpErr::InvalidNoiseMultiplier { got } => {
                write!(f, "the noise multiplier must be finite and >= 0, got {got}")
            }
            DpErr::InvalidClipBound { got } => {
                write!(f, "the clipping bound must be finite and > 0, got {got}")
            }
            DpErr::UnknownParam { index } => {
                write!(f, "parameter index {index} is outside the layout")
            }
            DpErr::NotTrainable { param } => {
                write!(f, "parameter {param} does not take gradients")
            }
            DpErr::GradLengthMismatch {
                param,
                got,
                expected,
            } => write!(
                f,
                "gradient length mismatch for {param}: got {got}, expected {expected}"
            ),
            DpErr::MissingSummedGrad { param } => {
                write!(f, "parameter {param} has no accumulated gradient this step")
            }
            DpErr::MissingCurrentGrad { param } => {
                write!(f, "parameter {param} reached reduction without a gradient")
            }
            DpErr::Noise(e) => write!(f, "noise sampling failed: {e}"),
            DpErr::Collective(e) => write!(f, "collective operation failed: {e}"),
        }
    }
}

impl Error for DpErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DpErr::Noise(e) => Some(e),
            DpErr::Collective(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NormalError> for DpErr {
    fn from(value: NormalError) -> Self {
        Self::Noise(value)
    }
}

impl From<CollectiveErr> for DpErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}
