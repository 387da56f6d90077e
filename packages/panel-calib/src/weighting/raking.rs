// src/weighting/raking.rs

use ndarray::{Array1, ArrayView1, Zip};
use polars::prelude::*;
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use super::correctors::{Corrector, SampleFrame};
use super::utils::{index_groups, mean_abs_change, Result, WeightingError, MISSING_GROUP};

/// Iteration budget and bounds for one raking run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RakeOptions {
    /// Maximum number of passes over all correctors
    pub iterations: usize,
    /// Weights are clipped to `[low, high]` after each pass
    pub clip: (f64, f64),
    /// Stop once the mean absolute weight change of a pass drops below this
    pub tolerance: f64,
}

impl Default for RakeOptions {
    fn default() -> Self {
        Self {
            iterations: 100,
            clip: (0.2, 5.0),
            tolerance: 1e-7,
        }
    }
}

impl RakeOptions {
    pub fn validate(&self) -> Result<()> {
        let (low, high) = self.clip;
        if self.iterations == 0 {
            return Err(WeightingError::InvalidInput(
                "iterations must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance >= 0.0) {
            return Err(WeightingError::InvalidInput(format!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        if !(low >= 0.0) || low.is_infinite() || !(high >= low) {
            return Err(WeightingError::InvalidInput(format!(
                "invalid clip range ({}, {})",
                low, high
            )));
        }
        Ok(())
    }
}

/// Result of a raking run
#[derive(Debug, Clone)]
pub struct RakeOutcome {
    /// Final weights, mean 1, aligned with the sample rows
    pub weights: Array1<f64>,
    /// Number of passes performed
    pub iterations: usize,
    /// Whether the tolerance was reached before the budget ran out
    pub converged: bool,
    /// Mean absolute change of the last pass
    pub change: f64,
}

/// Summary of one partition raked by [`rake_by_group`]
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub key: Option<String>,
    pub rows: usize,
    pub iterations: usize,
    pub converged: bool,
    pub change: f64,
}

/// Iterative proportional fitting with arbitrary correctors.
///
/// Weights start at 1.0 for every record. Each pass applies the correctors
/// in order, each one seeing the weights left by the previous one, then
/// clips the weights to `options.clip` and divides them by their mean.
/// When `external` is given, correctors observe `external * weights`; the
/// external weights themselves are never changed and are not part of the
/// returned vector.
///
/// Running out of iterations is not an error: the last weights are returned
/// with `converged == false`.
pub fn rake(
    sample: &DataFrame,
    correctors: &[Box<dyn Corrector>],
    options: &RakeOptions,
    external: Option<ArrayView1<f64>>,
) -> Result<RakeOutcome> {
    options.validate()?;
    let n_obs = sample.height();

    let external = match external {
        Some(ext) => {
            if ext.len() != n_obs {
                return Err(WeightingError::DimensionMismatch {
                    expected: n_obs,
                    got: ext.len(),
                });
            }
            // Missing external weights contribute nothing instead of poisoning products
            Some(ext.mapv(|w| if w.is_nan() { 0.0 } else { w }))
        }
        None => None,
    };

    if n_obs == 0 {
        return Ok(RakeOutcome {
            weights: Array1::zeros(0),
            iterations: 0,
            converged: true,
            change: 0.0,
        });
    }

    let frame = SampleFrame::new(sample);
    let (low, high) = options.clip;
    let mut weights = Array1::<f64>::ones(n_obs);
    let mut change = f64::INFINITY;

    for iteration in 1..=options.iterations {
        let weights_start = weights.clone();

        for corrector in correctors {
            let factors = match &external {
                Some(ext) => corrector.factors(&frame, (ext * &weights).view())?,
                None => corrector.factors(&frame, weights.view())?,
            };
            if factors.len() != n_obs {
                return Err(WeightingError::DimensionMismatch {
                    expected: n_obs,
                    got: factors.len(),
                });
            }

            Zip::from(&mut weights).and(&factors).for_each(|w, &f| {
                if f.is_finite() {
                    *w *= f;
                }
            });
        }

        weights.mapv_inplace(|w| w.clamp(low, high));
        let mean = weights.mean().unwrap_or(0.0);
        if mean > 0.0 {
            weights /= mean;
        }

        change = mean_abs_change(weights.view(), weights_start.view());
        trace!(iteration, change, "raking pass");

        if change < options.tolerance {
            debug!(iterations = iteration, change, "raking converged");
            return Ok(RakeOutcome {
                weights,
                iterations: iteration,
                converged: true,
                change,
            });
        }
    }

    warn!(
        iterations = options.iterations,
        change,
        tolerance = options.tolerance,
        "raking did not converge"
    );
    Ok(RakeOutcome {
        weights,
        iterations: options.iterations,
        converged: false,
        change,
    })
}

/// Rake each partition of the sample independently, in parallel.
///
/// Rows are split by the joint key of `group_columns` (e.g. survey year) and
/// every partition gets its own raking run and weight buffer. Rows with a
/// missing key form one extra partition. The weights are reassembled in the
/// original row order, each partition having mean 1.
pub fn rake_by_group(
    sample: &DataFrame,
    group_columns: &[&str],
    correctors: &[Box<dyn Corrector>],
    options: &RakeOptions,
    external: Option<ArrayView1<f64>>,
) -> Result<(Array1<f64>, Vec<PartitionOutcome>)> {
    options.validate()?;
    let n_obs = sample.height();
    if let Some(ext) = &external {
        if ext.len() != n_obs {
            return Err(WeightingError::DimensionMismatch {
                expected: n_obs,
                got: ext.len(),
            });
        }
    }

    let columns: Vec<String> = group_columns.iter().map(|c| c.to_string()).collect();
    let index = index_groups(sample, &columns)?;

    let mut partitions: Vec<(Option<String>, Vec<IdxSize>)> = index
        .labels
        .iter()
        .map(|label| (Some(label.clone()), Vec::new()))
        .collect();
    let mut missing_rows: Vec<IdxSize> = Vec::new();
    for (row, &g) in index.codes.iter().enumerate() {
        if g == MISSING_GROUP {
            missing_rows.push(row as IdxSize);
        } else {
            partitions[g as usize].1.push(row as IdxSize);
        }
    }
    if !missing_rows.is_empty() {
        partitions.push((None, missing_rows));
    }
    debug!(partitions = partitions.len(), rows = n_obs, "raking partitions");

    let results: Result<Vec<(Vec<IdxSize>, RakeOutcome, PartitionOutcome)>> = partitions
        .into_par_iter()
        .map(|(key, rows)| {
            let part = sample.take(&IdxCa::from_vec("rows".into(), rows.clone()))?;
            let part_external: Option<Array1<f64>> = external
                .as_ref()
                .map(|ext| rows.iter().map(|&r| ext[r as usize]).collect());
            let outcome = rake(&part, correctors, options, part_external.as_ref().map(|e| e.view()))?;
            let summary = PartitionOutcome {
                key,
                rows: rows.len(),
                iterations: outcome.iterations,
                converged: outcome.converged,
                change: outcome.change,
            };
            Ok((rows, outcome, summary))
        })
        .collect();

    let mut weights = Array1::<f64>::zeros(n_obs);
    let mut summaries = Vec::new();
    for (rows, outcome, summary) in results? {
        for (&row, &w) in rows.iter().zip(outcome.weights.iter()) {
            weights[row as usize] = w;
        }
        summaries.push(summary);
    }

    Ok((weights, summaries))
}
