// src/estimation/uncertainty.rs

use std::collections::HashMap;

use ndarray::Array1;
use polars::prelude::*;
use tracing::debug;

use super::utils::{check_confidence, check_lengths, check_proportion, index_categorical, z_score, EstimationError, Result};
use crate::regression::{CovarianceType, InterceptFit};

// ============================================================================
// Effective Sample Size
// ============================================================================

/// Kish's effective sample size `(Σw)² / Σw²`. NaN weights are skipped; NaN
/// when every weight is zero.
pub fn kish_effective_sample_size(weights: &[f64]) -> f64 {
    let (sum_w, sum_w2) = weights
        .iter()
        .filter(|w| !w.is_nan())
        .fold((0.0, 0.0), |(s, s2), &w| (s + w, s2 + w * w));
    if sum_w2 == 0.0 {
        f64::NAN
    } else {
        sum_w * sum_w / sum_w2
    }
}

/// Effective sample size, optionally accounting for clustering.
///
/// With clusters, weights are summed per cluster first and the Kish formula
/// is applied to the cluster totals. This assumes perfect intra-cluster
/// correlation and is conservative: it may underestimate the true effective
/// size. Rows with a null cluster id count as their own cluster.
pub fn effective_sample_size(
    weights: &Float64Chunked,
    clusters: Option<&StringChunked>,
) -> Result<f64> {
    let Some(clusters) = clusters else {
        let w: Vec<f64> = weights.iter().map(|w| w.unwrap_or(f64::NAN)).collect();
        return Ok(kish_effective_sample_size(&w));
    };
    check_lengths("weights", weights.len(), "clusters", clusters.len())?;

    let (codes, n_clusters) = index_categorical(clusters);
    let mut totals = vec![0.0; n_clusters as usize];
    let mut singletons = Vec::new();
    for (w, &c) in weights.iter().zip(codes.iter()) {
        let Some(w) = w.filter(|w| !w.is_nan()) else { continue };
        if c == u32::MAX {
            singletons.push(w);
        } else {
            totals[c as usize] += w;
        }
    }
    totals.extend(singletons);
    Ok(kish_effective_sample_size(&totals))
}

// ============================================================================
// Sample Size Planning
// ============================================================================

/// Sample size required for `margin_error` at `confidence` in an infinite
/// population: `z² p (1 - p) / e²`.
pub fn infinite_population_sample_size(
    confidence: f64,
    margin_error: f64,
    population_proportion: f64,
) -> Result<f64> {
    check_confidence(confidence)?;
    if !(margin_error > 0.0 && margin_error < 1.0) {
        return Err(EstimationError::InvalidInput(format!(
            "margin of error must be in (0, 1), got {}",
            margin_error
        )));
    }
    check_proportion(population_proportion)?;

    let z = z_score(confidence)?;
    Ok(z * z * population_proportion * (1.0 - population_proportion) / (margin_error * margin_error))
}

/// Infinite-population sample size corrected for a population of
/// `population_size`: `n₀ / (1 + (n₀ - 1) / N)`.
pub fn finite_population_sample_size(
    population_size: f64,
    confidence: f64,
    margin_error: f64,
    population_proportion: f64,
) -> Result<f64> {
    if !(population_size > 0.0) {
        return Err(EstimationError::InvalidInput(format!(
            "population size must be positive, got {}",
            population_size
        )));
    }
    let n0 = infinite_population_sample_size(confidence, margin_error, population_proportion)?;
    Ok(n0 / (1.0 + (n0 - 1.0) / population_size))
}

// ============================================================================
// Classical Margins of Error
// ============================================================================

/// Scale a margin of error by `sqrt((N - n) / (N - 1))`.
///
/// A census (`n == N`) has no sampling error. When the factor is undefined
/// (e.g. `N == 1`) the margin is returned unchanged.
pub fn finite_population_correction(
    infinite_moe: f64,
    sample_size: f64,
    population_size: f64,
) -> Result<f64> {
    if sample_size > population_size {
        return Err(EstimationError::InvalidInput(format!(
            "sample size {} cannot be greater than population size {}",
            sample_size, population_size
        )));
    }
    if sample_size == population_size {
        return Ok(0.0);
    }
    let factor = ((population_size - sample_size) / (population_size - 1.0)).sqrt();
    Ok(if factor.is_finite() { infinite_moe * factor } else { infinite_moe })
}

/// `z sqrt(p (1 - p) / n)`; NaN for a non-positive sample size.
pub fn infinite_classical_error_margin(
    sample_size: f64,
    confidence: f64,
    population_proportion: f64,
) -> Result<f64> {
    if !(sample_size > 0.0) {
        return Ok(f64::NAN);
    }
    check_proportion(population_proportion)?;
    let z = z_score(confidence)?;
    Ok(z * (population_proportion * (1.0 - population_proportion) / sample_size).sqrt())
}

pub fn finite_classical_error_margin(
    sample_size: f64,
    population_size: f64,
    confidence: f64,
    population_proportion: f64,
) -> Result<f64> {
    let moe = infinite_classical_error_margin(sample_size, confidence, population_proportion)?;
    finite_population_correction(moe, sample_size, population_size)
}

// ============================================================================
// Weighted Margins of Error
// ============================================================================

fn reindex_within_subset(raw: &[u32]) -> (Vec<u32>, u32) {
    let mut map: HashMap<u32, u32> = HashMap::new();
    let mut next_idx = 0u32;
    let indices: Vec<u32> = raw
        .iter()
        .map(|&val| {
            *map.entry(val).or_insert_with(|| {
                let i = next_idx;
                next_idx += 1;
                i
            })
        })
        .collect();
    (indices, next_idx)
}

/// Robust standard error of the weighted mean of `metric`.
///
/// The metric is regressed on an intercept by weighted least squares. Rows
/// where the metric, the weight or (when given) the cluster id is missing
/// are dropped together. Without clusters the HC1 covariance is used,
/// with clusters the CR1 cluster-robust covariance.
///
/// Returns NaN when the remaining weights sum to zero, when fewer than two
/// rows remain, or when fewer than two clusters remain.
pub fn robust_standard_error(
    metric: &Float64Chunked,
    weights: &Float64Chunked,
    clusters: Option<&StringChunked>,
) -> Result<f64> {
    check_lengths("metric", metric.len(), "weights", weights.len())?;
    if let Some(c) = clusters {
        check_lengths("metric", metric.len(), "clusters", c.len())?;
    }

    let cluster_codes = clusters.map(|c| index_categorical(c).0);
    let mut y = Vec::with_capacity(metric.len());
    let mut w = Vec::with_capacity(metric.len());
    let mut kept_codes = Vec::new();
    for (i, (yi, wi)) in metric.iter().zip(weights.iter()).enumerate() {
        let (Some(yi), Some(wi)) = (yi, wi) else { continue };
        if yi.is_nan() || wi.is_nan() {
            continue;
        }
        if let Some(codes) = &cluster_codes {
            if codes[i] == u32::MAX {
                continue;
            }
            kept_codes.push(codes[i]);
        }
        y.push(yi);
        w.push(wi);
    }
    debug!(rows = metric.len(), kept = y.len(), "robust standard error");

    let fit = InterceptFit::fit(Array1::from(y).view(), Array1::from(w).view())?;
    let se = match cluster_codes {
        Some(_) => {
            let (codes, n_clusters) = reindex_within_subset(&kept_codes);
            fit.standard_error(CovarianceType::Cluster { codes: &codes, n_clusters })
        }
        None => fit.standard_error(CovarianceType::HC1),
    };
    Ok(se)
}

/// `z · SE` of the weighted mean of `metric`.
pub fn infinite_weighted_error_margin(
    metric: &Float64Chunked,
    weights: &Float64Chunked,
    clusters: Option<&StringChunked>,
    confidence: f64,
) -> Result<f64> {
    let z = z_score(confidence)?;
    Ok(z * robust_standard_error(metric, weights, clusters)?)
}

/// Weighted margin of error with a finite population correction that uses
/// the effective sample size as `n`.
pub fn finite_weighted_error_margin(
    metric: &Float64Chunked,
    weights: &Float64Chunked,
    clusters: Option<&StringChunked>,
    population_size: f64,
    confidence: f64,
) -> Result<f64> {
    if !(population_size > 0.0) {
        return Err(EstimationError::InvalidInput(format!(
            "population size must be positive, got {}",
            population_size
        )));
    }
    let moe = infinite_weighted_error_margin(metric, weights, clusters, confidence)?;
    let n_eff = effective_sample_size(weights, clusters)?;
    finite_population_correction(moe, n_eff, population_size)
}

// ============================================================================
// Error Propagation
// ============================================================================

/// Margin of error of a weighted mean of independent estimates:
/// `sqrt(Σ (w / Σw)² e²)`. Terms with an undefined weight or margin are
/// skipped; NaN when the weights sum to zero.
pub fn propagate_error_for_weighted_mean(weights: &[f64], error_margins: &[f64]) -> Result<f64> {
    check_lengths("weights", weights.len(), "error margins", error_margins.len())?;

    let sum_w: f64 = weights.iter().filter(|w| !w.is_nan()).sum();
    if sum_w == 0.0 {
        return Ok(f64::NAN);
    }
    let total: f64 = weights
        .iter()
        .zip(error_margins.iter())
        .map(|(w, e)| (w / sum_w).powi(2) * e * e)
        .filter(|term| !term.is_nan())
        .sum();
    Ok(total.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn chunked(values: &[f64]) -> Float64Chunked {
        Float64Chunked::from_slice("x".into(), values)
    }

    #[test]
    fn test_kish_uniform_and_outlier() {
        assert_relative_eq!(kish_effective_sample_size(&[1.0, 1.0, 1.0, 1.0]), 4.0, epsilon = 1e-12);
        assert_relative_eq!(
            kish_effective_sample_size(&[1.0, 1.0, 1.0, 1.0, 100.0]),
            104.0 * 104.0 / 10004.0,
            epsilon = 1e-12
        );
        assert!(kish_effective_sample_size(&[0.0, 0.0]).is_nan());
        assert!(kish_effective_sample_size(&[]).is_nan());
    }

    #[test]
    fn test_kish_never_exceeds_count() {
        let w = [0.3, 2.0, 1.1, 5.0, 0.7, 1.0];
        let n_eff = kish_effective_sample_size(&w);
        assert!(n_eff <= w.len() as f64);
        assert!(n_eff > 1.0);
    }

    #[test]
    fn test_clustered_ess() {
        let w = chunked(&[1.0, 1.0, 1.0, 1.0]);
        let clusters = StringChunked::new("c".into(), &[Some("a"), Some("a"), Some("b"), Some("b")]);
        assert_relative_eq!(effective_sample_size(&w, Some(&clusters)).unwrap(), 2.0, epsilon = 1e-12);

        // Null ids are singleton clusters: totals [2, 1, 1]
        let clusters = StringChunked::new("c".into(), &[Some("a"), Some("a"), None, None]);
        assert_relative_eq!(
            effective_sample_size(&w, Some(&clusters)).unwrap(),
            16.0 / 6.0,
            epsilon = 1e-12
        );

        assert_relative_eq!(effective_sample_size(&w, None).unwrap(), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sample_sizes() {
        let n0 = infinite_population_sample_size(0.95, 0.05, 0.5).unwrap();
        assert_relative_eq!(n0, 384.14588206941244, epsilon = 1e-4);

        let n = finite_population_sample_size(1000.0, 0.95, 0.05, 0.5).unwrap();
        assert_relative_eq!(n, n0 / (1.0 + (n0 - 1.0) / 1000.0), epsilon = 1e-9);
        assert!(n < n0);

        assert!(infinite_population_sample_size(0.95, 0.0, 0.5).is_err());
        assert!(infinite_population_sample_size(0.95, 0.05, 1.2).is_err());
        assert!(finite_population_sample_size(0.0, 0.95, 0.05, 0.5).is_err());
    }

    #[test]
    fn test_finite_population_correction() {
        assert_eq!(finite_population_correction(0.1, 50.0, 50.0).unwrap(), 0.0);
        assert!(finite_population_correction(0.1, 51.0, 50.0).is_err());
        assert_relative_eq!(
            finite_population_correction(0.1, 10.0, 101.0).unwrap(),
            0.1 * (91.0f64 / 100.0).sqrt(),
            epsilon = 1e-12
        );
        // Undefined factor leaves the margin unchanged.
        assert_relative_eq!(finite_population_correction(0.1, 0.5, 1.0).unwrap(), 0.1, epsilon = 1e-12);
        assert_relative_eq!(finite_population_correction(0.1, f64::NAN, 10.0).unwrap(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_classical_error_margins() {
        let moe = infinite_classical_error_margin(400.0, 0.95, 0.5).unwrap();
        assert_relative_eq!(moe, 1.959963984540054 * 0.025, epsilon = 1e-6);

        assert!(infinite_classical_error_margin(0.0, 0.95, 0.5).unwrap().is_nan());
        assert!(infinite_classical_error_margin(100.0, 1.5, 0.5).is_err());

        let finite = finite_classical_error_margin(400.0, 1000.0, 0.95, 0.5).unwrap();
        assert!(finite < moe);
        assert_eq!(finite_classical_error_margin(400.0, 400.0, 0.95, 0.5).unwrap(), 0.0);
    }

    #[test]
    fn test_robust_standard_error_drops_incomplete_rows() {
        let metric = Float64Chunked::new("m".into(), &[Some(1.0), Some(0.0), None, Some(1.0), Some(f64::NAN)]);
        let weights = Float64Chunked::new("w".into(), &[Some(2.0), Some(1.0), Some(5.0), Some(1.0), Some(3.0)]);

        let se = robust_standard_error(&metric, &weights, None).unwrap();

        let meat = 4.0 * 0.25f64.powi(2) + 0.75f64.powi(2) + 0.25f64.powi(2);
        assert_relative_eq!(se, (1.5 * meat / 16.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_robust_standard_error_degenerate_cases() {
        let one = robust_standard_error(&chunked(&[1.0]), &chunked(&[1.0]), None).unwrap();
        assert!(one.is_nan());

        let zero = robust_standard_error(&chunked(&[1.0, 0.0]), &chunked(&[0.0, 0.0]), None).unwrap();
        assert!(zero.is_nan());

        let clusters = StringChunked::new("c".into(), &["a", "a"]);
        let single = robust_standard_error(&chunked(&[1.0, 0.0]), &chunked(&[1.0, 1.0]), Some(&clusters)).unwrap();
        assert!(single.is_nan());

        let mismatch = robust_standard_error(&chunked(&[1.0, 0.0]), &chunked(&[1.0]), None);
        assert!(matches!(mismatch, Err(EstimationError::LengthMismatch { .. })));
    }

    #[test]
    fn test_clustered_standard_error() {
        let metric = chunked(&[1.0, 1.0, 0.0, 0.0]);
        let weights = chunked(&[1.0, 1.0, 1.0, 1.0]);
        let clusters = StringChunked::new("c".into(), &["a", "a", "b", "b"]);

        let se = robust_standard_error(&metric, &weights, Some(&clusters)).unwrap();
        assert_relative_eq!(se, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_weighted_error_margins() {
        let metric = chunked(&[1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        let weights = chunked(&[1.0, 2.0, 1.0, 0.5, 1.5, 1.0, 1.0, 2.0]);

        let se = robust_standard_error(&metric, &weights, None).unwrap();
        let moe = infinite_weighted_error_margin(&metric, &weights, None, 0.95).unwrap();
        assert_relative_eq!(moe, 1.959963984540054 * se, epsilon = 1e-6);

        let finite = finite_weighted_error_margin(&metric, &weights, None, 100.0, 0.95).unwrap();
        let n_eff = effective_sample_size(&weights, None).unwrap();
        assert_relative_eq!(finite, moe * ((100.0 - n_eff) / 99.0).sqrt(), epsilon = 1e-12);

        assert!(finite_weighted_error_margin(&metric, &weights, None, 0.0, 0.95).is_err());
        assert!(infinite_weighted_error_margin(&metric, &weights, None, 1.0).is_err());
    }

    #[test]
    fn test_propagate_error_for_weighted_mean() {
        let e = propagate_error_for_weighted_mean(&[1.0, 1.0], &[0.1, 0.1]).unwrap();
        assert_relative_eq!(e, (0.5f64 * 0.01).sqrt(), epsilon = 1e-12);

        // Undefined margin skipped, its weight still counts in Σw.
        let e = propagate_error_for_weighted_mean(&[1.0, 1.0], &[0.2, f64::NAN]).unwrap();
        assert_relative_eq!(e, 0.1, epsilon = 1e-12);

        assert!(propagate_error_for_weighted_mean(&[1.0], &[0.1, 0.2]).is_err());
        assert!(propagate_error_for_weighted_mean(&[0.0, 0.0], &[0.1, 0.2]).unwrap().is_nan());
    }
}
