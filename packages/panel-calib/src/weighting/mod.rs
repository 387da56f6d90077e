// src/weighting/mod.rs

pub mod utils;
pub mod correctors;
pub mod raking;
pub mod spreading;
pub mod poststratification;
pub mod pipeline;

// Re-export main implementations for easier access
pub use utils::{WeightingError, KEY_SEPARATOR};
pub use correctors::{
    tuple_key, Corrector, MarginalCorrector, PopulationDistribution, RateCorrector, SampleFrame,
};
pub use raking::{rake, rake_by_group, PartitionOutcome, RakeOptions, RakeOutcome};
pub use spreading::{smooth_age, smoothed_age_histogram, spread_age, SpreadOptions};
pub use poststratification::{apply_demographic_correction, DemographicCorrectionOptions};
pub use pipeline::{correct_year_weights, post_process};
