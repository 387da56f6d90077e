// src/weighting/correctors.rs
//! Correction factors for raking.
//!
//! A corrector looks at the sample under the current weights and returns one
//! multiplicative factor per record. Correctors own an immutable reference
//! (a population distribution or a set of target rates) and keep no state
//! between calls, so the same corrector can drive any number of raking runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use ndarray::{Array1, ArrayView1};
use polars::prelude::*;

use super::utils::{
    float_values, index_groups, neutral_ratio, GroupIndex, Result, WeightingError, KEY_SEPARATOR,
    MISSING_GROUP,
};

/// Read-only view of a sample handed to correctors.
///
/// Group indices and numeric columns are computed on first use and reused by
/// every later iteration of the same raking run.
pub struct SampleFrame<'a> {
    df: &'a DataFrame,
    groups: RefCell<HashMap<Vec<String>, Rc<GroupIndex>>>,
    numeric: RefCell<HashMap<String, Rc<Vec<Option<f64>>>>>,
}

impl<'a> SampleFrame<'a> {
    pub fn new(df: &'a DataFrame) -> Self {
        Self {
            df,
            groups: RefCell::new(HashMap::new()),
            numeric: RefCell::new(HashMap::new()),
        }
    }

    pub fn frame(&self) -> &DataFrame {
        self.df
    }

    pub fn height(&self) -> usize {
        self.df.height()
    }

    /// Weights handed to a corrector must be aligned with the rows.
    pub fn check_weights(&self, weights: ArrayView1<f64>) -> Result<()> {
        if weights.len() != self.height() {
            return Err(WeightingError::DimensionMismatch {
                expected: self.height(),
                got: weights.len(),
            });
        }
        Ok(())
    }

    pub fn groups(&self, columns: &[String]) -> Result<Rc<GroupIndex>> {
        if let Some(index) = self.groups.borrow().get(columns) {
            return Ok(Rc::clone(index));
        }
        let index = Rc::new(index_groups(self.df, columns)?);
        self.groups
            .borrow_mut()
            .insert(columns.to_vec(), Rc::clone(&index));
        Ok(index)
    }

    pub fn numeric(&self, column: &str) -> Result<Rc<Vec<Option<f64>>>> {
        if let Some(values) = self.numeric.borrow().get(column) {
            return Ok(Rc::clone(values));
        }
        let values = Rc::new(float_values(self.df, column)?);
        self.numeric
            .borrow_mut()
            .insert(column.to_string(), Rc::clone(&values));
        Ok(values)
    }
}

/// Computes per-record correction factors for the current sample state.
///
/// The returned vector must be aligned with the rows of the sample. NaN
/// entries are allowed and are treated as a neutral factor by the raking
/// engine.
pub trait Corrector: Send + Sync {
    fn factors(&self, sample: &SampleFrame<'_>, weights: ArrayView1<f64>) -> Result<Array1<f64>>;
}

/// Population totals keyed by one or more categorical columns.
#[derive(Debug, Clone)]
pub struct PopulationDistribution {
    name: String,
    totals: HashMap<String, f64>,
    total: f64,
}

impl PopulationDistribution {
    /// Sum `value_column` of a population table per joint key of `key_columns`.
    pub fn from_frame(df: &DataFrame, key_columns: &[&str], value_column: &str) -> Result<Self> {
        let columns: Vec<String> = key_columns.iter().map(|c| c.to_string()).collect();
        let index = index_groups(df, &columns)?;
        let values: Array1<f64> = float_values(df, value_column)?
            .into_iter()
            .map(|v| v.unwrap_or(0.0))
            .collect();

        if values.iter().any(|&v| v < 0.0) {
            return Err(WeightingError::InvalidInput(format!(
                "population column '{}' contains negative totals",
                value_column
            )));
        }

        let sums = index.sum(values.view());
        let totals = index.labels.iter().cloned().zip(sums.iter().copied()).collect();
        Self::from_totals(columns.join(","), totals)
    }

    /// Build from already aggregated totals. Tuple keys join their parts with
    /// [`KEY_SEPARATOR`].
    pub fn from_totals(name: impl Into<String>, totals: HashMap<String, f64>) -> Result<Self> {
        let name = name.into();
        if totals.values().any(|&v| v < 0.0 || v.is_nan()) {
            return Err(WeightingError::InvalidInput(format!(
                "reference distribution over {} has negative or undefined totals",
                name
            )));
        }
        let total: f64 = totals.values().sum();
        if !(total > 0.0) || !total.is_finite() {
            return Err(WeightingError::DegenerateReference(name));
        }
        Ok(Self { name, totals, total })
    }

    pub fn from_pairs<K: ToString>(
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (K, f64)>,
    ) -> Result<Self> {
        let mut totals = HashMap::new();
        for (key, value) in pairs {
            *totals.entry(key.to_string()).or_insert(0.0) += value;
        }
        Self::from_totals(name, totals)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.totals.get(key).copied()
    }

    pub fn share(&self, key: &str) -> Option<f64> {
        self.get(key).map(|v| v / self.total)
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.totals.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

/// Join the parts of a tuple key the way group labels are rendered.
pub fn tuple_key<S: AsRef<str>>(parts: &[S]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part.as_ref());
    }
    key
}

/// Rakes one marginal: category shares of the weighted sample are pulled
/// toward the category shares of the population.
#[derive(Debug, Clone)]
pub struct MarginalCorrector {
    sample_columns: Vec<String>,
    distribution: Arc<PopulationDistribution>,
    population_total: f64,
}

impl MarginalCorrector {
    pub fn new(sample_columns: &[&str], distribution: PopulationDistribution) -> Result<Self> {
        if sample_columns.is_empty() {
            return Err(WeightingError::InvalidInput(
                "marginal corrector needs at least one sample column".to_string(),
            ));
        }
        let population_total = distribution.total();
        Ok(Self {
            sample_columns: sample_columns.iter().map(|c| c.to_string()).collect(),
            distribution: Arc::new(distribution),
            population_total,
        })
    }

    /// Marginal on a single sample column.
    pub fn on(sample_column: &str, distribution: PopulationDistribution) -> Result<Self> {
        Self::new(&[sample_column], distribution)
    }

    /// Override the population weight total the category shares are taken of.
    pub fn with_total(mut self, population_total: f64) -> Result<Self> {
        if !(population_total > 0.0) || !population_total.is_finite() {
            return Err(WeightingError::DegenerateReference(
                self.distribution.name().to_string(),
            ));
        }
        self.population_total = population_total;
        Ok(self)
    }

    pub fn distribution(&self) -> &PopulationDistribution {
        &self.distribution
    }
}

impl Corrector for MarginalCorrector {
    fn factors(&self, sample: &SampleFrame<'_>, weights: ArrayView1<f64>) -> Result<Array1<f64>> {
        sample.check_weights(weights)?;
        let index = sample.groups(&self.sample_columns)?;
        let current = index.sum(weights);
        let weight_total: f64 = weights.sum();

        let per_group: Vec<f64> = index
            .labels
            .iter()
            .zip(current.iter())
            .map(|(label, &current_sum)| match self.distribution.get(label) {
                Some(target) => {
                    let scaled_target = target / self.population_total * weight_total;
                    neutral_ratio(scaled_target, current_sum)
                }
                None => 1.0,
            })
            .collect();

        Ok(index.broadcast(&per_group, 1.0))
    }
}

/// Rakes a weighted average: per group, the weighted mean of `rate_column`
/// is pulled toward a target rate.
#[derive(Debug, Clone)]
pub struct RateCorrector {
    grouping_columns: Vec<String>,
    rate_column: String,
    target_rates: Arc<HashMap<String, f64>>,
}

impl RateCorrector {
    pub fn new(
        grouping_columns: &[&str],
        rate_column: &str,
        target_rates: HashMap<String, f64>,
    ) -> Result<Self> {
        if grouping_columns.is_empty() {
            return Err(WeightingError::InvalidInput(
                "rate corrector needs at least one grouping column".to_string(),
            ));
        }
        Ok(Self {
            grouping_columns: grouping_columns.iter().map(|c| c.to_string()).collect(),
            rate_column: rate_column.to_string(),
            target_rates: Arc::new(target_rates),
        })
    }
}

impl Corrector for RateCorrector {
    fn factors(&self, sample: &SampleFrame<'_>, weights: ArrayView1<f64>) -> Result<Array1<f64>> {
        sample.check_weights(weights)?;
        let index = sample.groups(&self.grouping_columns)?;
        let rates = sample.numeric(&self.rate_column)?;

        let n_groups = index.n_groups();
        let mut weighted_rate = vec![0.0; n_groups];
        let mut weight_sum = vec![0.0; n_groups];
        for ((&g, rate), &w) in index.codes.iter().zip(rates.iter()).zip(weights.iter()) {
            if g == MISSING_GROUP {
                continue;
            }
            if let Some(r) = rate {
                weighted_rate[g as usize] += w * r;
                weight_sum[g as usize] += w;
            }
        }

        let per_group: Vec<f64> = index
            .labels
            .iter()
            .enumerate()
            .map(|(g, label)| {
                let observed = if weight_sum[g] > 0.0 {
                    weighted_rate[g] / weight_sum[g]
                } else {
                    f64::NAN
                };
                match self.target_rates.get(label) {
                    Some(&target) if observed.is_finite() => neutral_ratio(target, observed),
                    _ => 1.0,
                }
            })
            .collect();

        Ok(index.broadcast(&per_group, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn sex_distribution() -> PopulationDistribution {
        PopulationDistribution::from_pairs("sex", [("M", 30.0), ("F", 70.0)]).unwrap()
    }

    #[test]
    fn test_marginal_factors_match_shares() {
        let df = df!("sex" => ["M", "M", "F", "F"]).unwrap();
        let sample = SampleFrame::new(&df);
        let corrector = MarginalCorrector::on("sex", sex_distribution()).unwrap();

        let factors = corrector.factors(&sample, array![1.0, 1.0, 1.0, 1.0].view()).unwrap();

        // M: 0.3 * 4 / 2, F: 0.7 * 4 / 2
        assert_relative_eq!(factors[0], 0.6, epsilon = 1e-12);
        assert_relative_eq!(factors[1], 0.6, epsilon = 1e-12);
        assert_relative_eq!(factors[2], 1.4, epsilon = 1e-12);
        assert_relative_eq!(factors[3], 1.4, epsilon = 1e-12);
    }

    #[test]
    fn test_marginal_unknown_category_is_neutral() {
        let df = df!("sex" => [Some("M"), Some("X"), None, Some("F")]).unwrap();
        let sample = SampleFrame::new(&df);
        let corrector = MarginalCorrector::on("sex", sex_distribution()).unwrap();

        let factors = corrector.factors(&sample, array![1.0, 1.0, 1.0, 1.0].view()).unwrap();

        assert_eq!(factors[1], 1.0);
        assert_eq!(factors[2], 1.0);
        assert_relative_eq!(factors[0], 0.3 * 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_marginal_zero_current_sum_is_neutral() {
        let df = df!("sex" => ["M", "F"]).unwrap();
        let sample = SampleFrame::new(&df);
        let corrector = MarginalCorrector::on("sex", sex_distribution()).unwrap();

        let factors = corrector.factors(&sample, array![0.0, 2.0].view()).unwrap();

        assert_eq!(factors[0], 1.0);
        assert_relative_eq!(factors[1], 0.7, epsilon = 1e-12);
    }

    #[test]
    fn test_marginal_with_explicit_total() {
        let df = df!("sex" => ["M", "F"]).unwrap();
        let sample = SampleFrame::new(&df);
        let corrector = MarginalCorrector::on("sex", sex_distribution())
            .unwrap()
            .with_total(200.0)
            .unwrap();

        let factors = corrector.factors(&sample, array![1.0, 1.0].view()).unwrap();

        assert_relative_eq!(factors[0], 30.0 / 200.0 * 2.0, epsilon = 1e-12);
        assert!(MarginalCorrector::on("sex", sex_distribution())
            .unwrap()
            .with_total(0.0)
            .is_err());
    }

    #[test]
    fn test_zero_mass_reference_is_rejected() {
        let result = PopulationDistribution::from_pairs("age", [("20", 0.0), ("60", 0.0)]);
        assert!(matches!(result, Err(WeightingError::DegenerateReference(_))));

        let empty = PopulationDistribution::from_pairs::<&str>("age", []);
        assert!(matches!(empty, Err(WeightingError::DegenerateReference(_))));
    }

    #[test]
    fn test_distribution_from_frame_tuple_keys() {
        let population = df!(
            "sex" => ["M", "F", "M", "F"],
            "canton" => [1i64, 1, 2, 2],
            "population" => [10u32, 20, 30, 40],
        )
        .unwrap();

        let dist =
            PopulationDistribution::from_frame(&population, &["sex", "canton"], "population").unwrap();

        assert_eq!(dist.len(), 4);
        assert_relative_eq!(dist.total(), 100.0);
        assert_eq!(dist.get(&tuple_key(&["F", "2"])), Some(40.0));
    }

    #[test]
    fn test_rate_corrector() {
        let df = df!(
            "canton" => ["A", "A", "B", "B"],
            "voted" => [Some(1.0), Some(0.0), Some(0.0), None],
        )
        .unwrap();
        let sample = SampleFrame::new(&df);
        let targets = HashMap::from([("A".to_string(), 0.25), ("B".to_string(), 0.4)]);
        let corrector = RateCorrector::new(&["canton"], "voted", targets).unwrap();

        let factors = corrector.factors(&sample, array![1.0, 1.0, 1.0, 1.0].view()).unwrap();

        // A observes 0.5 -> 0.25 / 0.5; B observes 0 -> neutral.
        assert_relative_eq!(factors[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(factors[1], 0.5, epsilon = 1e-12);
        assert_eq!(factors[2], 1.0);
        assert_eq!(factors[3], 1.0);
    }

    #[test]
    fn test_rate_corrector_zero_group_weight_is_neutral() {
        let df = df!("g" => ["A", "A"], "r" => [1.0, 0.0]).unwrap();
        let sample = SampleFrame::new(&df);
        let targets = HashMap::from([("A".to_string(), 0.5)]);
        let corrector = RateCorrector::new(&["g"], "r", targets).unwrap();

        let factors = corrector.factors(&sample, array![0.0, 0.0].view()).unwrap();
        assert!(factors.iter().all(|&f| f == 1.0));
    }

    #[test]
    fn test_misaligned_weights_are_rejected() {
        let df = df!("sex" => ["M", "F"], "r" => [1.0, 0.0]).unwrap();
        let sample = SampleFrame::new(&df);
        let short = array![1.0];

        let marginal = MarginalCorrector::on("sex", sex_distribution()).unwrap();
        let result = marginal.factors(&sample, short.view());
        assert!(matches!(
            result,
            Err(WeightingError::DimensionMismatch { expected: 2, got: 1 })
        ));

        let targets = HashMap::from([("M".to_string(), 0.5)]);
        let rate = RateCorrector::new(&["sex"], "r", targets).unwrap();
        let result = rate.factors(&sample, short.view());
        assert!(matches!(
            result,
            Err(WeightingError::DimensionMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_sample_frame_memoizes_groups() {
        let df = df!("sex" => ["M", "F"]).unwrap();
        let sample = SampleFrame::new(&df);
        let columns = vec!["sex".to_string()];

        let first = sample.groups(&columns).unwrap();
        let second = sample.groups(&columns).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }
}
