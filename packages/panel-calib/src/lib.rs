// src/lib.rs
//! Calibration of survey-panel weights against population-register margins
//! and the uncertainty of the resulting weighted estimates.
//!
//! - [`weighting`]: marginal/rate correctors, iterative raking, Gaussian age
//!   spreading and the per-year demographic post-processing pipeline
//! - [`estimation`]: effective sample sizes, sample size planning, classical
//!   and weighted margins of error, distribution distances
//! - [`regression`]: intercept-only weighted least squares with robust
//!   covariance, used by the weighted margins of error
//! - [`config`]: TOML-backed configuration of all of the above

pub mod config;
pub mod estimation;
pub mod regression;
pub mod weighting;

pub use config::{CalibrationConfig, ConfigError, MarginConfig, PipelineConfig};
pub use estimation::EstimationError;
pub use weighting::{
    correct_year_weights, post_process, rake, rake_by_group, Corrector, MarginalCorrector,
    PopulationDistribution, RakeOptions, RakeOutcome, RateCorrector, WeightingError,
};
