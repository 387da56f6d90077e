// src/config.rs

//! Configuration surface for calibration runs
//!
//! Every parameter is explicit; nothing is read from the environment. The
//! structs deserialize from TOML so that a batch of survey years can share
//! one file.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::estimation::uncertainty::{
    finite_classical_error_margin, finite_population_sample_size, infinite_classical_error_margin,
    infinite_population_sample_size,
};
use crate::estimation::EstimationError;
use crate::weighting::raking::RakeOptions;
use crate::weighting::spreading::SpreadOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parameters of a standalone raking run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RakingConfig {
    pub iterations: usize,
    pub clip_low: f64,
    pub clip_high: f64,
    pub tolerance: f64,
}

impl Default for RakingConfig {
    fn default() -> Self {
        let options = RakeOptions::default();
        Self {
            iterations: options.iterations,
            clip_low: options.clip.0,
            clip_high: options.clip.1,
            tolerance: options.tolerance,
        }
    }
}

impl RakingConfig {
    pub fn options(&self) -> RakeOptions {
        RakeOptions {
            iterations: self.iterations,
            clip: (self.clip_low, self.clip_high),
            tolerance: self.tolerance,
        }
    }
}

/// Age spreading kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadConfig {
    pub age_std: f64,
    pub min_age: i64,
    pub max_age: i64,
    pub kernel_size_std: f64,
    /// When set, spread candidates are scaled to a smoothed histogram of
    /// this weight column instead of a global mean of 1.
    pub reference_weight: Option<String>,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        let options = SpreadOptions::default();
        Self {
            age_std: options.age_std,
            min_age: options.min_age,
            max_age: options.max_age,
            kernel_size_std: options.kernel_size_std,
            reference_weight: None,
        }
    }
}

impl SpreadConfig {
    pub fn options(&self) -> SpreadOptions {
        SpreadOptions {
            age_std: self.age_std,
            min_age: self.min_age,
            max_age: self.max_age,
            kernel_size_std: self.kernel_size_std,
        }
    }
}

/// Targets used when sizing samples and reporting margins of error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    pub confidence: f64,
    pub margin_error: f64,
    pub population_proportion: f64,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            confidence: 0.95,
            margin_error: 0.05,
            population_proportion: 0.5,
        }
    }
}

impl UncertaintyConfig {
    /// Respondents needed to reach `margin_error`, corrected for the
    /// population size when one is given.
    pub fn sample_size(&self, population_size: Option<f64>) -> Result<f64, EstimationError> {
        match population_size {
            Some(n) => finite_population_sample_size(
                n,
                self.confidence,
                self.margin_error,
                self.population_proportion,
            ),
            None => infinite_population_sample_size(
                self.confidence,
                self.margin_error,
                self.population_proportion,
            ),
        }
    }

    /// Classical margin of error achieved with `sample_size` respondents
    pub fn error_margin(
        &self,
        sample_size: f64,
        population_size: Option<f64>,
    ) -> Result<f64, EstimationError> {
        match population_size {
            Some(n) => finite_classical_error_margin(
                sample_size,
                n,
                self.confidence,
                self.population_proportion,
            ),
            None => infinite_classical_error_margin(
                sample_size,
                self.confidence,
                self.population_proportion,
            ),
        }
    }
}

/// One raked margin: a sample column matched to a population column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginConfig {
    pub sample_column: String,
    pub population_column: String,
}

impl MarginConfig {
    pub fn new(sample_column: &str, population_column: &str) -> Self {
        Self {
            sample_column: sample_column.to_string(),
            population_column: population_column.to_string(),
        }
    }
}

/// Demographic post-processing of one survey table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub age_column: String,
    /// Weight column replaced by the raked result
    pub total_weight_column: String,
    /// Additional weight columns scaled by age spreading
    pub weight_columns: Vec<String>,
    /// Column receiving the spread kernel weight
    pub spread_weight_column: String,
    /// Population count column of the electorate table
    pub population_column: String,
    pub margins: Vec<MarginConfig>,
    /// Largest allowed over- or under-weighting
    pub acceptable_correction: f64,
    pub iterations: usize,
    pub tolerance: f64,
    pub spread: SpreadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            age_column: "age".into(),
            total_weight_column: "weighttot".into(),
            weight_columns: Vec::new(),
            spread_weight_column: "weight_age".into(),
            population_column: "population".into(),
            margins: vec![
                MarginConfig::new("age", "age"),
                MarginConfig::new("sex", "sex"),
                MarginConfig::new("sg3", "canton"),
            ],
            acceptable_correction: 5.0,
            iterations: 1000,
            tolerance: 1e-7,
            spread: SpreadConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn rake_options(&self) -> RakeOptions {
        RakeOptions {
            iterations: self.iterations,
            clip: (1.0 / self.acceptable_correction, self.acceptable_correction),
            tolerance: self.tolerance,
        }
    }

    /// Weight columns tracked through age spreading, total weight first
    pub fn tracked_weights(&self) -> Vec<&str> {
        let mut columns = vec![self.total_weight_column.as_str()];
        for name in &self.weight_columns {
            if !columns.contains(&name.as_str()) {
                columns.push(name);
            }
        }
        columns
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.margins.is_empty() {
            return Err(ConfigError::Invalid("at least one margin is required".into()));
        }
        if !(self.acceptable_correction >= 1.0) || !self.acceptable_correction.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "acceptable_correction must be a finite value >= 1, got {}",
                self.acceptable_correction
            )));
        }
        self.rake_options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.spread
            .options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub raking: RakingConfig,
    pub uncertainty: UncertaintyConfig,
    pub pipeline: PipelineConfig,
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.raking
            .options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let u = &self.uncertainty;
        if !(u.confidence > 0.0 && u.confidence < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "confidence must be in (0, 1), got {}",
                u.confidence
            )));
        }
        if !(u.margin_error > 0.0 && u.margin_error < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "margin_error must be in (0, 1), got {}",
                u.margin_error
            )));
        }
        if !(0.0..=1.0).contains(&u.population_proportion) {
            return Err(ConfigError::Invalid(format!(
                "population_proportion must be in [0, 1], got {}",
                u.population_proportion
            )));
        }

        self.pipeline.validate()
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
