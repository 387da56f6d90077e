// src/weighting/pipeline.rs

use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use tracing::{debug, warn};

use super::correctors::{Corrector, MarginalCorrector, PopulationDistribution};
use super::raking::{rake, RakeOutcome};
use super::spreading::{smooth_age, spread_age};
use super::utils::{weight_values, Result, WeightingError};
use crate::config::PipelineConfig;

fn margin_correctors(
    electorate: &DataFrame,
    config: &PipelineConfig,
) -> Result<Vec<Box<dyn Corrector>>> {
    config
        .margins
        .iter()
        .map(|margin| -> Result<Box<dyn Corrector>> {
            let distribution = PopulationDistribution::from_frame(
                electorate,
                &[margin.population_column.as_str()],
                &config.population_column,
            )
            .inspect_err(|e| {
                warn!(
                    sample_column = %margin.sample_column,
                    population_column = %margin.population_column,
                    error = %e,
                    "unusable electorate margin"
                )
            })?;
            let corrector = MarginalCorrector::on(&margin.sample_column, distribution)?;
            Ok(Box::new(corrector))
        })
        .collect()
}

/// Rake one survey year against the electorate margins.
///
/// The total-weight column of the returned table holds `external * raked`,
/// or the raked weights alone when no external weight is given.
pub fn correct_year_weights(
    sample: &DataFrame,
    electorate: &DataFrame,
    config: &PipelineConfig,
    external: Option<ArrayView1<f64>>,
) -> Result<(DataFrame, RakeOutcome)> {
    config
        .validate()
        .map_err(|e| WeightingError::InvalidInput(e.to_string()))?;

    let correctors = margin_correctors(electorate, config)?;
    let outcome = rake(sample, &correctors, &config.rake_options(), external)?;
    debug!(
        iterations = outcome.iterations,
        converged = outcome.converged,
        "year weights raked"
    );

    // Missing external weights drop the row, as in raking.
    let total: Array1<f64> = match external {
        Some(ext) => ext.mapv(|w| if w.is_nan() { 0.0 } else { w }) * &outcome.weights,
        None => outcome.weights.clone(),
    };
    let mut corrected = sample.clone();
    corrected.with_column(Series::new(
        config.total_weight_column.as_str().into(),
        total.to_vec(),
    ))?;

    Ok((corrected, outcome))
}

/// Spread ages, then rake the spread table against the electorate using
/// its own (spread) total weight as the external weight.
pub fn post_process(
    sample: &DataFrame,
    electorate: &DataFrame,
    config: &PipelineConfig,
) -> Result<(DataFrame, RakeOutcome)> {
    config
        .validate()
        .map_err(|e| WeightingError::InvalidInput(e.to_string()))?;

    let tracked = config.tracked_weights();
    let spread_options = config.spread.options();
    let spread = match &config.spread.reference_weight {
        Some(reference) => smooth_age(
            sample,
            &config.age_column,
            reference,
            &tracked,
            &config.spread_weight_column,
            &spread_options,
        )?,
        None => spread_age(
            sample,
            &config.age_column,
            &tracked,
            &config.spread_weight_column,
            &spread_options,
        )?,
    };
    debug!(rows = sample.height(), spread = spread.height(), "post-processing survey year");

    let external = weight_values(&spread, &config.total_weight_column)?;
    correct_year_weights(&spread, electorate, config, Some(external.view()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarginConfig;
    use crate::weighting::utils::float_values;
    use approx::assert_relative_eq;

    fn electorate() -> DataFrame {
        let mut age = Vec::new();
        let mut sex = Vec::new();
        let mut canton = Vec::new();
        let mut population = Vec::new();
        for a in 18i64..=100 {
            for s in ["M", "F"] {
                for c in [1i64, 2] {
                    age.push(a);
                    sex.push(s);
                    canton.push(c);
                    population.push(10i64);
                }
            }
        }
        df!(
            "age" => age,
            "sex" => sex,
            "canton" => canton,
            "population" => population,
        )
        .unwrap()
    }

    fn survey() -> DataFrame {
        df!(
            "age" => [30i64, 35, 40, 45, 50, 55, 60, 65],
            "sex" => ["M", "M", "M", "M", "M", "M", "F", "F"],
            "sg3" => [1i64, 2, 1, 2, 1, 2, 1, 2],
            "weighttot" => [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
        )
        .unwrap()
    }

    fn sex_only() -> PipelineConfig {
        PipelineConfig {
            margins: vec![MarginConfig::new("sex", "sex")],
            ..Default::default()
        }
    }

    fn weighted_share(df: &DataFrame, column: &str, value: &str, weight: &str) -> f64 {
        let keys = df.column(column).unwrap().str().unwrap();
        let weights = float_values(df, weight).unwrap();
        let mut part = 0.0;
        let mut total = 0.0;
        for (k, w) in keys.into_iter().zip(weights) {
            let w = w.unwrap_or(0.0);
            total += w;
            if k == Some(value) {
                part += w;
            }
        }
        part / total
    }

    #[test]
    fn test_post_process_matches_sex_margin() {
        let (out, outcome) = post_process(&survey(), &electorate(), &sex_only()).unwrap();

        assert!(outcome.converged);
        assert!(out.height() > survey().height());
        assert!(out.column("weight_age").is_ok());
        assert_relative_eq!(
            weighted_share(&out, "sex", "M", "weighttot"),
            0.5,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_total_weight_is_external_times_raked() {
        let sample = survey();
        let external = ndarray::array![2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 1.0, 1.0];

        let (out, outcome) =
            correct_year_weights(&sample, &electorate(), &sex_only(), Some(external.view()))
                .unwrap();

        let total = weight_values(&out, "weighttot").unwrap();
        for i in 0..sample.height() {
            assert_relative_eq!(total[i], external[i] * outcome.weights[i], epsilon = 1e-12);
        }
        // Input table keeps its weights.
        assert_eq!(float_values(&sample, "weighttot").unwrap()[0], Some(1.0));
    }

    #[test]
    fn test_missing_external_weight_zeroes_total() {
        let external = ndarray::array![1.0, 1.0, f64::NAN, 1.0, 1.0, 1.0, 1.0, 1.0];

        let (out, outcome) =
            correct_year_weights(&survey(), &electorate(), &sex_only(), Some(external.view()))
                .unwrap();

        let total = weight_values(&out, "weighttot").unwrap();
        assert!(total.iter().all(|w| w.is_finite()));
        assert_eq!(total[2], 0.0);
        assert_relative_eq!(total[0], outcome.weights[0], epsilon = 1e-12);
        assert_relative_eq!(
            weighted_share(&out, "sex", "M", "weighttot"),
            0.5,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_unconverged_year_still_returns_weights() {
        let config = PipelineConfig { iterations: 1, ..sex_only() };

        let (out, outcome) = correct_year_weights(&survey(), &electorate(), &config, None).unwrap();

        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 1);
        let total = weight_values(&out, "weighttot").unwrap();
        assert_eq!(total.len(), 8);
        assert!(total.iter().all(|w| w.is_finite() && *w > 0.0));
    }

    #[test]
    fn test_balanced_sample_keeps_weights() {
        let sample = df!(
            "age" => [30i64, 30],
            "sex" => ["M", "F"],
            "sg3" => [1i64, 1],
            "weighttot" => [1.0, 1.0],
        )
        .unwrap();

        let (out, outcome) = correct_year_weights(&sample, &electorate(), &sex_only(), None).unwrap();

        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 1);
        let total = weight_values(&out, "weighttot").unwrap();
        assert_relative_eq!(total[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(total[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_default_margins_run_end_to_end() {
        let (out, outcome) =
            post_process(&survey(), &electorate(), &PipelineConfig::default()).unwrap();

        assert_eq!(outcome.weights.len(), out.height());
        let total = weight_values(&out, "weighttot").unwrap();
        assert!(total.iter().all(|w| w.is_finite() && *w >= 0.0));
        assert!(total.sum() > 0.0);
    }

    #[test]
    fn test_smoothing_reference_weight() {
        let mut config = sex_only();
        config.spread.reference_weight = Some("weighttot".into());

        let (out, _) = post_process(&survey(), &electorate(), &config).unwrap();
        assert_relative_eq!(
            weighted_share(&out, "sex", "M", "weighttot"),
            0.5,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_empty_electorate_is_degenerate() {
        let electorate = df!(
            "sex" => ["M", "F"],
            "population" => [0i64, 0],
        )
        .unwrap();

        let result = correct_year_weights(&survey(), &electorate, &sex_only(), None);
        assert!(matches!(result, Err(WeightingError::DegenerateReference(_))));
    }

    #[test]
    fn test_missing_columns_are_errors() {
        let mut config = sex_only();
        config.population_column = "inhabitants".into();
        assert!(correct_year_weights(&survey(), &electorate(), &config, None).is_err());

        let mut config = sex_only();
        config.margins = vec![MarginConfig::new("sex", "gender")];
        assert!(correct_year_weights(&survey(), &electorate(), &config, None).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PipelineConfig { acceptable_correction: 0.5, ..sex_only() };
        let result = post_process(&survey(), &electorate(), &config);
        assert!(matches!(result, Err(WeightingError::InvalidInput(_))));
    }
}
