// src/estimation/mod.rs
pub mod utils;
pub mod uncertainty;
pub mod distribution;

pub use utils::{z_score, EstimationError};
pub use uncertainty::{
    // Effective sample size
    kish_effective_sample_size, effective_sample_size,
    // Sample size planning
    infinite_population_sample_size, finite_population_sample_size,
    // Classical margins
    finite_population_correction,
    infinite_classical_error_margin, finite_classical_error_margin,
    // Weighted margins
    robust_standard_error,
    infinite_weighted_error_margin, finite_weighted_error_margin,
    propagate_error_for_weighted_mean,
};
pub use distribution::{
    merge_proportional, total_variation_distance, column_total_variation_distance,
};
