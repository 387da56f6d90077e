// src/weighting/utils.rs

use std::collections::HashMap;

use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeightingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Reference distribution over {0} has no population mass")]
    DegenerateReference(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

pub type Result<T> = std::result::Result<T, WeightingError>;

/// Separator between the parts of a tuple key.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Code used for rows whose key is missing.
pub const MISSING_GROUP: u32 = u32::MAX;

/// Rows of a table mapped onto the distinct values of one or more columns.
#[derive(Debug, Clone)]
pub struct GroupIndex {
    /// Group code per row, `MISSING_GROUP` when any key part is null.
    pub codes: Vec<u32>,
    /// Rendered key per group code.
    pub labels: Vec<String>,
}

impl GroupIndex {
    pub fn n_groups(&self) -> usize {
        self.labels.len()
    }

    /// Sum `values` per group, skipping rows with a missing key.
    pub fn sum(&self, values: ArrayView1<f64>) -> Array1<f64> {
        sum_by_group(values, &self.codes, self.n_groups())
    }

    /// Broadcast one value per group back onto the rows.
    pub fn broadcast(&self, per_group: &[f64], missing: f64) -> Array1<f64> {
        self.codes
            .iter()
            .map(|&g| if g == MISSING_GROUP { missing } else { per_group[g as usize] })
            .collect()
    }
}

/// Render a whole-number float without its fractional part so that a float
/// age column keys the same way as an integer register column.
pub fn format_key_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Render every value of a column as a group key.
pub fn key_values(column: &Column) -> PolarsResult<Vec<Option<String>>> {
    match column.dtype() {
        DataType::Float32 | DataType::Float64 => {
            let casted = column.cast(&DataType::Float64)?;
            Ok(casted
                .f64()?
                .iter()
                .map(|v| v.filter(|x| !x.is_nan()).map(format_key_number))
                .collect())
        }
        _ => {
            let casted = column.cast(&DataType::String)?;
            Ok(casted.str()?.iter().map(|v| v.map(str::to_owned)).collect())
        }
    }
}

/// Render the joint key of several columns per row.
pub fn joint_key_values(df: &DataFrame, columns: &[String]) -> PolarsResult<Vec<Option<String>>> {
    if columns.is_empty() {
        return Err(PolarsError::ComputeError("at least one key column is required".into()));
    }

    let mut parts: Vec<Vec<Option<String>>> = Vec::with_capacity(columns.len());
    for name in columns {
        parts.push(key_values(df.column(name)?)?);
    }

    let keys = (0..df.height())
        .map(|row| {
            let mut key = String::new();
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    key.push(KEY_SEPARATOR);
                }
                key.push_str(part[row].as_deref()?);
            }
            Some(key)
        })
        .collect();
    Ok(keys)
}

/// Index the rows of `df` by the joint key of `columns`.
pub fn index_groups(df: &DataFrame, columns: &[String]) -> PolarsResult<GroupIndex> {
    let keys = joint_key_values(df, columns)?;

    let mut map: HashMap<String, u32> = HashMap::new();
    let mut labels = Vec::new();
    let codes = keys
        .into_iter()
        .map(|key| match key {
            Some(k) => *map.entry(k).or_insert_with_key(|k| {
                labels.push(k.clone());
                (labels.len() - 1) as u32
            }),
            None => MISSING_GROUP,
        })
        .collect();

    Ok(GroupIndex { codes, labels })
}

/// Read a column as `f64`, with nulls and NaN reported as `None`.
pub fn float_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<f64>>> {
    let casted = df.column(name)?.cast(&DataType::Float64)?;
    Ok(casted
        .f64()?
        .iter()
        .map(|v| v.filter(|x| !x.is_nan()))
        .collect())
}

/// Read a weight column; missing weights contribute nothing.
pub fn weight_values(df: &DataFrame, name: &str) -> PolarsResult<Array1<f64>> {
    Ok(float_values(df, name)?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect())
}

/// Sum weights by group for a 1D array
pub fn sum_by_group(weights: ArrayView1<f64>, codes: &[u32], n_groups: usize) -> Array1<f64> {
    let mut sums = Array1::zeros(n_groups);

    for (i, &group_id) in codes.iter().enumerate() {
        if group_id != MISSING_GROUP {
            sums[group_id as usize] += weights[i];
        }
    }

    sums
}

/// Ratio used as a multiplicative correction; anything undefined is neutral.
pub fn neutral_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        return 1.0;
    }
    let ratio = numerator / denominator;
    if ratio.is_finite() {
        ratio
    } else {
        1.0
    }
}

/// Mean absolute change between two weight vectors
pub fn mean_abs_change(current: ArrayView1<f64>, previous: ArrayView1<f64>) -> f64 {
    if current.is_empty() {
        return 0.0;
    }
    let total: f64 = current
        .iter()
        .zip(previous.iter())
        .map(|(c, p)| (c - p).abs())
        .sum();
    total / current.len() as f64
}
