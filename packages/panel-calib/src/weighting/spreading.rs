// src/weighting/spreading.rs
//! Gaussian spreading of point ages.
//!
//! Survey respondents report a single age, which makes thin age cells very
//! noisy once they are raked against a register. Spreading duplicates every
//! respondent over the neighbouring ages with Gaussian kernel weights so that
//! age margins are matched against a smooth sample distribution.
//!
//! Candidates falling outside `[min_age, max_age]` are discarded and the
//! remaining kernel mass of such a respondent is not renormalized, so
//! respondents near the bounds carry slightly less weight.

use std::collections::HashMap;

use ndarray::Array1;
use polars::prelude::*;
use tracing::debug;

use super::utils::{float_values, Result, WeightingError};

/// Kernel parameters for age spreading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadOptions {
    /// Standard deviation of the Gaussian kernel, in years
    pub age_std: f64,
    pub min_age: i64,
    pub max_age: i64,
    /// Kernel half-width as a multiple of `age_std`
    pub kernel_size_std: f64,
}

impl Default for SpreadOptions {
    fn default() -> Self {
        Self {
            age_std: 3.0,
            min_age: 18,
            max_age: 100,
            kernel_size_std: 4.0,
        }
    }
}

impl SpreadOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.age_std > 0.0) || !self.age_std.is_finite() {
            return Err(WeightingError::InvalidInput(format!(
                "age_std must be positive, got {}",
                self.age_std
            )));
        }
        if !(self.kernel_size_std >= 0.0) || !self.kernel_size_std.is_finite() {
            return Err(WeightingError::InvalidInput(format!(
                "kernel_size_std must be non-negative, got {}",
                self.kernel_size_std
            )));
        }
        if self.min_age > self.max_age {
            return Err(WeightingError::InvalidInput(format!(
                "min_age {} exceeds max_age {}",
                self.min_age, self.max_age
            )));
        }
        Ok(())
    }

    /// Number of neighbouring ages covered on each side
    pub fn radius(&self) -> i64 {
        (self.kernel_size_std * self.age_std).ceil() as i64
    }

    /// Offsets `-radius..=radius` with their unnormalized kernel weights
    pub fn kernel(&self) -> Vec<(i64, f64)> {
        let radius = self.radius();
        (-radius..=radius)
            .map(|offset| {
                let z = offset as f64 / self.age_std;
                (offset, (-0.5 * z * z).exp())
            })
            .collect()
    }
}

/// Candidate rows of an expansion before any table is built
struct Expansion {
    rows: Vec<IdxSize>,
    ages: Vec<f64>,
    kernel: Vec<f64>,
}

fn expand(ages: &[Option<f64>], options: &SpreadOptions) -> Expansion {
    let kernel = options.kernel();
    let (min_age, max_age) = (options.min_age as f64, options.max_age as f64);

    let mut expansion = Expansion {
        rows: Vec::with_capacity(ages.len() * kernel.len()),
        ages: Vec::with_capacity(ages.len() * kernel.len()),
        kernel: Vec::with_capacity(ages.len() * kernel.len()),
    };
    for (row, age) in ages.iter().enumerate() {
        let Some(age) = age else { continue };
        for &(offset, k) in &kernel {
            let candidate = age + offset as f64;
            if candidate >= min_age && candidate <= max_age {
                expansion.rows.push(row as IdxSize);
                expansion.ages.push(candidate);
                expansion.kernel.push(k);
            }
        }
    }
    expansion
}

/// Duplicate rows, rewrite the age column and scale every tracked weight.
fn build_expanded(
    df: &DataFrame,
    age_column: &str,
    weight_columns: &[&str],
    spread_column: &str,
    expansion: Expansion,
) -> Result<DataFrame> {
    let age_dtype = df.column(age_column)?.dtype().clone();
    let mut out = df.take(&IdxCa::from_vec("rows".into(), expansion.rows))?;

    let ages = Series::new(age_column.into(), expansion.ages).cast(&age_dtype)?;
    out.with_column(ages)?;

    for &name in weight_columns {
        let scaled: Vec<Option<f64>> = float_values(&out, name)?
            .into_iter()
            .zip(expansion.kernel.iter())
            .map(|(w, &k)| w.map(|w| w * k))
            .collect();
        out.with_column(Series::new(name.into(), scaled))?;
    }
    out.with_column(Series::new(spread_column.into(), expansion.kernel))?;
    Ok(out)
}

fn check_columns(df: &DataFrame, age_column: &str, weight_columns: &[&str], spread_column: &str) -> Result<()> {
    if spread_column == age_column || weight_columns.contains(&spread_column) {
        return Err(WeightingError::InvalidInput(format!(
            "spread weight column '{}' collides with the age or a weight column",
            spread_column
        )));
    }
    for name in weight_columns {
        df.column(name)?;
    }
    Ok(())
}

/// Spread every row over neighbouring ages with kernel weights normalized
/// to a mean of 1 over the retained candidates.
///
/// The returned table has one row per retained candidate. `spread_column`
/// holds the normalized kernel weight and every column in `weight_columns`
/// is multiplied by it. All other columns are copied unchanged.
pub fn spread_age(
    df: &DataFrame,
    age_column: &str,
    weight_columns: &[&str],
    spread_column: &str,
    options: &SpreadOptions,
) -> Result<DataFrame> {
    options.validate()?;
    check_columns(df, age_column, weight_columns, spread_column)?;

    let ages = float_values(df, age_column)?;
    let mut expansion = expand(&ages, options);

    let n = expansion.kernel.len();
    if n > 0 {
        let mean = expansion.kernel.iter().sum::<f64>() / n as f64;
        for k in expansion.kernel.iter_mut() {
            *k /= mean;
        }
    }
    debug!(rows = df.height(), expanded = n, radius = options.radius(), "spread ages");

    build_expanded(df, age_column, weight_columns, spread_column, expansion)
}

/// Gaussian-windowed rolling mean of the reference weight per age.
///
/// The window is centred, spans `2 * radius + 1` ages and only averages over
/// ages inside `[min_age, max_age]`, renormalizing the window weights at the
/// edges.
pub fn smoothed_age_histogram(
    ages: &[Option<f64>],
    reference: &[Option<f64>],
    options: &SpreadOptions,
) -> Result<Array1<f64>> {
    options.validate()?;
    if ages.len() != reference.len() {
        return Err(WeightingError::DimensionMismatch {
            expected: ages.len(),
            got: reference.len(),
        });
    }

    let n_bins = (options.max_age - options.min_age + 1) as usize;
    let mut histogram = vec![0.0; n_bins];
    for (age, weight) in ages.iter().zip(reference.iter()) {
        if let (Some(age), Some(weight)) = (age, weight) {
            if age.fract() != 0.0 {
                continue;
            }
            let bin = *age as i64 - options.min_age;
            if bin >= 0 && (bin as usize) < n_bins {
                histogram[bin as usize] += weight;
            }
        }
    }

    let kernel = options.kernel();
    let smoothed = (0..n_bins as i64)
        .map(|bin| {
            let mut total = 0.0;
            let mut mass = 0.0;
            for &(offset, k) in &kernel {
                let source = bin + offset;
                if source >= 0 && source < n_bins as i64 {
                    total += k * histogram[source as usize];
                    mass += k;
                }
            }
            if mass > 0.0 {
                total / mass
            } else {
                0.0
            }
        })
        .collect();
    Ok(smoothed)
}

/// Spread ages and scale the candidates so that, per destination age, the
/// spread reference weight equals a smoothed histogram of the reference
/// weight.
///
/// Candidate kernel weights are scaled per destination age by
/// `target / candidate_mass`, where `candidate_mass` is the sum of
/// `reference * kernel` landing on that age; an undefined scale yields 0.
/// `reference_weight` is scaled along with `weight_columns` if listed there.
pub fn smooth_age(
    df: &DataFrame,
    age_column: &str,
    reference_weight: &str,
    weight_columns: &[&str],
    spread_column: &str,
    options: &SpreadOptions,
) -> Result<DataFrame> {
    options.validate()?;
    check_columns(df, age_column, weight_columns, spread_column)?;

    let ages = float_values(df, age_column)?;
    let reference = float_values(df, reference_weight)?;
    let target = smoothed_age_histogram(&ages, &reference, options)?;

    let mut expansion = expand(&ages, options);

    let mut candidate_mass: HashMap<i64, f64> = HashMap::new();
    for (i, &row) in expansion.rows.iter().enumerate() {
        let w = reference[row as usize].unwrap_or(0.0);
        *candidate_mass.entry(expansion.ages[i] as i64).or_insert(0.0) += w * expansion.kernel[i];
    }

    for (age, k) in expansion.ages.iter().zip(expansion.kernel.iter_mut()) {
        let age = *age as i64;
        let mass = candidate_mass.get(&age).copied().unwrap_or(0.0);
        let scale = if age >= options.min_age && age <= options.max_age {
            target[(age - options.min_age) as usize] / mass
        } else {
            f64::NAN
        };
        *k *= if scale.is_finite() { scale } else { 0.0 };
    }
    debug!(
        rows = df.height(),
        expanded = expansion.rows.len(),
        radius = options.radius(),
        "smoothed ages"
    );

    build_expanded(df, age_column, weight_columns, spread_column, expansion)
}
