// src/regression/mod.rs
pub mod wls;

pub use wls::{CovarianceType, InterceptFit};
