// src/estimation/utils.rs

use std::collections::HashMap;

use polars::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Length mismatch: {left} ({left_len}) vs {right} ({right_len})")]
    LengthMismatch {
        left: &'static str,
        left_len: usize,
        right: &'static str,
        right_len: usize,
    },

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

pub type Result<T> = std::result::Result<T, EstimationError>;

pub fn check_confidence(confidence: f64) -> Result<()> {
    if confidence > 0.0 && confidence < 1.0 {
        Ok(())
    } else {
        Err(EstimationError::InvalidInput(format!(
            "confidence must be in (0, 1), got {}",
            confidence
        )))
    }
}

pub fn check_proportion(proportion: f64) -> Result<()> {
    if (0.0..=1.0).contains(&proportion) {
        Ok(())
    } else {
        Err(EstimationError::InvalidInput(format!(
            "population proportion must be in [0, 1], got {}",
            proportion
        )))
    }
}

pub fn check_lengths(left: &'static str, left_len: usize, right: &'static str, right_len: usize) -> Result<()> {
    if left_len == right_len {
        Ok(())
    } else {
        Err(EstimationError::LengthMismatch { left, left_len, right, right_len })
    }
}

/// Two-sided standard normal quantile for `confidence`.
pub fn z_score(confidence: f64) -> Result<f64> {
    check_confidence(confidence)?;
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| EstimationError::InvalidInput(e.to_string()))?;
    Ok(normal.inverse_cdf((1.0 + confidence) / 2.0))
}

/// Dense codes for a string column; nulls map to `u32::MAX`.
pub fn index_categorical(col: &StringChunked) -> (Vec<u32>, u32) {
    let mut map: HashMap<&str, u32> = HashMap::new();
    let mut next_idx = 0u32;
    let indices: Vec<u32> = col
        .iter()
        .map(|opt| match opt {
            Some(s) => *map.entry(s).or_insert_with(|| {
                let i = next_idx;
                next_idx += 1;
                i
            }),
            None => u32::MAX,
        })
        .collect();
    (indices, next_idx)
}
