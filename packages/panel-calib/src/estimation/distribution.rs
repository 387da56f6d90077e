// src/estimation/distribution.rs
//! Comparing categorical distributions, e.g. a weighted sample against the
//! register it was raked to.

use std::collections::{HashMap, HashSet};

use polars::prelude::*;

use super::utils::{EstimationError, Result};

/// Name of the category column produced by [`merge_proportional`]
pub const KEY_COLUMN: &str = "key";

/// Sum values per key, keeping first-appearance order.
fn collapse<K: AsRef<str>>(distribution: &[(K, f64)]) -> (Vec<String>, HashMap<String, f64>) {
    let mut order = Vec::new();
    let mut totals: HashMap<String, f64> = HashMap::new();
    for (key, value) in distribution {
        let key = key.as_ref();
        match totals.get_mut(key) {
            Some(total) => *total += value,
            None => {
                order.push(key.to_string());
                totals.insert(key.to_string(), *value);
            }
        }
    }
    (order, totals)
}

/// Normalize each distribution to sum to one and align them on their keys.
///
/// Distributions summing to zero (or less) are left out. A key missing from
/// a distribution is null in its column. Empty names become `dist_{i}`.
pub fn merge_proportional<K: AsRef<str>>(distributions: &[(&str, &[(K, f64)])]) -> Result<DataFrame> {
    let mut keys: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut columns: Vec<(String, HashMap<String, f64>)> = Vec::new();

    for (i, (name, distribution)) in distributions.iter().enumerate() {
        let name = if name.is_empty() { format!("dist_{}", i) } else { name.to_string() };
        if name == KEY_COLUMN || columns.iter().any(|(n, _)| *n == name) {
            return Err(EstimationError::InvalidInput(format!(
                "duplicate distribution name '{}'",
                name
            )));
        }

        let (order, totals) = collapse(distribution);
        let sum: f64 = totals.values().sum();
        if !(sum > 0.0) {
            continue;
        }
        for key in order {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        let shares = totals.into_iter().map(|(k, v)| (k, v / sum)).collect();
        columns.push((name, shares));
    }

    let mut series: Vec<Column> = Vec::with_capacity(columns.len() + 1);
    series.push(Column::new(KEY_COLUMN.into(), &keys));
    for (name, shares) in &columns {
        let values: Vec<Option<f64>> = keys.iter().map(|k| shares.get(k).copied()).collect();
        series.push(Column::new(name.as_str().into(), values));
    }
    Ok(DataFrame::new(series)?)
}

/// Total variation distance `½ Σ |a/Σa - b/Σb|` over the union of keys.
/// NaN when either distribution sums to zero.
pub fn total_variation_distance<A: AsRef<str>, B: AsRef<str>>(a: &[(A, f64)], b: &[(B, f64)]) -> f64 {
    let (order_a, totals_a) = collapse(a);
    let (order_b, totals_b) = collapse(b);
    let sum_a: f64 = totals_a.values().sum();
    let sum_b: f64 = totals_b.values().sum();
    if sum_a == 0.0 || sum_b == 0.0 {
        return f64::NAN;
    }

    let mut distance = 0.0;
    for key in &order_a {
        let pa = totals_a[key] / sum_a;
        let pb = totals_b.get(key).copied().unwrap_or(0.0) / sum_b;
        distance += (pa - pb).abs();
    }
    for key in order_b.iter().filter(|k| !totals_a.contains_key(*k)) {
        distance += totals_b[key] / sum_b;
    }
    0.5 * distance
}

/// Distance of every numeric column of `df` to the `reference` column, rows
/// being categories. `key_column` (if present) is ignored. Nulls count as 0.
///
/// Every distance is NaN when the reference column is missing or sums to 0.
pub fn column_total_variation_distance(
    df: &DataFrame,
    key_column: &str,
    reference: &str,
) -> Result<Vec<(String, f64)>> {
    let others: Vec<String> = df
        .get_column_names()
        .into_iter()
        .filter(|n| n.as_str() != key_column && n.as_str() != reference)
        .map(|n| n.to_string())
        .collect();

    let values = |name: &str| -> Result<Vec<(String, f64)>> {
        let column = df.column(name)?.cast(&DataType::Float64)?;
        Ok(column
            .f64()?
            .iter()
            .enumerate()
            .map(|(row, v)| (row.to_string(), v.filter(|v| !v.is_nan()).unwrap_or(0.0)))
            .collect())
    };

    let reference_values = match df.column(reference) {
        Ok(_) => values(reference)?,
        Err(_) => Vec::new(),
    };
    let reference_sum: f64 = reference_values.iter().map(|(_, v)| v).sum();
    if reference_sum == 0.0 {
        return Ok(others.into_iter().map(|n| (n, f64::NAN)).collect());
    }

    others
        .into_iter()
        .map(|name| {
            let column_values = values(&name)?;
            let distance = total_variation_distance(&column_values, &reference_values);
            Ok((name, distance))
        })
        .collect()
}
