pub mod accumulate;
pub mod config;
pub mod error;
pub mod metrics;
pub mod noise;
pub mod optimizer;
pub mod params;
pub mod reduce;
pub mod update;

pub use accumulate::GradAccumulator;
pub use config::{DpSpec, LossReduction};
pub use error::{DpErr, Result};
pub use metrics::StepMetrics;
pub use noise::{DistributedNoise, LocalNoise, NoiseStrategy};
pub use optimizer::DpOptimizer;
pub use params::{ParamGrad, ParamLayout, ParamMeta, StepGrads};
pub use reduce::Reducer;
pub use update::{Sgd, UpdateRule};
