// src/weighting/poststratification.rs

use std::collections::HashMap;

use polars::prelude::*;
use tracing::debug;

use super::utils::{float_values, index_groups, weight_values, Result, WeightingError, MISSING_GROUP};

/// Parameters of a one-shot demographic post-stratification
#[derive(Debug, Clone, PartialEq)]
pub struct DemographicCorrectionOptions {
    /// Columns whose joint cells are post-stratified, present in both tables
    pub attributes: Vec<String>,
    /// Sample weight the sample cell shares are computed from
    pub sample_weight: String,
    /// Population count column of the reference table
    pub population_column: String,
    /// Weight columns multiplied by the cell multiplier
    pub weight_columns: Vec<String>,
    /// Multipliers are clipped to `[1 / acceptable_correction, acceptable_correction]`
    pub acceptable_correction: f64,
    /// Column receiving the multiplier
    pub correction_column: String,
}

impl Default for DemographicCorrectionOptions {
    fn default() -> Self {
        Self {
            attributes: vec!["age".into(), "sex".into(), "commune_size".into()],
            sample_weight: "weightc".into(),
            population_column: "population".into(),
            weight_columns: vec![
                "weightc".into(),
                "weightst".into(),
                "weightp".into(),
                "weighttot".into(),
            ],
            acceptable_correction: 5.0,
            correction_column: "weight_demographic".into(),
        }
    }
}

/// Post-stratification over the joint cells of several attributes
///
/// Each cell's share of the sample weight is compared with its share of the
/// population. Only cells with a positive share on both sides are used, and
/// both sets of shares are renormalized over those cells. The multiplier
/// `population share / sample share` is clipped to the acceptable range.
///
/// # Notes
/// Rows in cells missing from either side (or with a missing attribute) get
/// a multiplier of 0 and so drop out of every weighted estimate.
pub fn apply_demographic_correction(
    sample: &DataFrame,
    population: &DataFrame,
    options: &DemographicCorrectionOptions,
) -> Result<DataFrame> {
    if options.attributes.is_empty() {
        return Err(WeightingError::InvalidInput(
            "demographic correction needs at least one attribute".to_string(),
        ));
    }
    if !(options.acceptable_correction >= 1.0) {
        return Err(WeightingError::InvalidInput(format!(
            "acceptable correction must be at least 1, got {}",
            options.acceptable_correction
        )));
    }

    let sample_cells = index_groups(sample, &options.attributes)?;
    let sample_sums = sample_cells.sum(weight_values(sample, &options.sample_weight)?.view());

    let population_cells = index_groups(population, &options.attributes)?;
    let population_sums =
        population_cells.sum(weight_values(population, &options.population_column)?.view());
    let population_by_label: HashMap<&str, f64> = population_cells
        .labels
        .iter()
        .map(String::as_str)
        .zip(population_sums.iter().copied())
        .collect();

    // Cells observed on both sides
    let shared: Vec<(usize, f64, f64)> = sample_cells
        .labels
        .iter()
        .enumerate()
        .filter_map(|(g, label)| {
            let s = sample_sums[g];
            let p = population_by_label.get(label.as_str()).copied().unwrap_or(0.0);
            (s > 0.0 && p > 0.0).then_some((g, s, p))
        })
        .collect();

    let sample_total: f64 = shared.iter().map(|&(_, s, _)| s).sum();
    let population_total: f64 = shared.iter().map(|&(_, _, p)| p).sum();
    if shared.is_empty() || !(sample_total > 0.0) || !(population_total > 0.0) {
        return Err(WeightingError::DegenerateReference(options.attributes.join(",")));
    }

    let (low, high) = (1.0 / options.acceptable_correction, options.acceptable_correction);
    let mut per_cell = vec![0.0; sample_cells.n_groups()];
    for &(g, s, p) in &shared {
        per_cell[g] = ((p / population_total) / (s / sample_total)).clamp(low, high);
    }
    debug!(
        cells = sample_cells.n_groups(),
        shared = shared.len(),
        "demographic correction multipliers"
    );

    let multiplier: Vec<f64> = sample_cells
        .codes
        .iter()
        .map(|&g| if g == MISSING_GROUP { 0.0 } else { per_cell[g as usize] })
        .collect();

    let mut corrected = sample.clone();
    for name in &options.weight_columns {
        let scaled: Vec<Option<f64>> = float_values(sample, name)?
            .into_iter()
            .zip(multiplier.iter())
            .map(|(w, &m)| w.map(|w| w * m))
            .collect();
        corrected.with_column(Series::new(name.as_str().into(), scaled))?;
    }
    corrected.with_column(Series::new(options.correction_column.as_str().into(), multiplier))?;

    Ok(corrected)
}
