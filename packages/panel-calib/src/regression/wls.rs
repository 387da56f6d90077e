// src/regression/wls.rs
//! Weighted least squares on a constant regressor.
//!
//! Regressing a 0/1 (or any numeric) metric on an intercept with weights
//! `w` gives the weighted mean as coefficient. Only the sandwich standard
//! errors are of interest here, so the design matrix is never built.

use ndarray::{Array1, ArrayView1};

use crate::estimation::utils::{check_lengths, Result};

/// Covariance estimator of the coefficient
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CovarianceType<'a> {
    /// Heteroskedasticity-consistent, small-sample scaled by `n / (n - 1)`
    HC1,
    /// Cluster-robust, scaled by `G / (G - 1)`; codes are dense cluster ids
    Cluster { codes: &'a [u32], n_clusters: u32 },
}

#[derive(Debug, Clone)]
pub struct InterceptFit {
    /// Weighted mean of the response
    pub coefficient: f64,
    pub n_obs: usize,
    /// Residual degrees of freedom, `n_obs - 1`
    pub df_resid: f64,
    pub sum_weights: f64,
    /// `w_i * (y_i - coefficient)`
    weighted_residuals: Array1<f64>,
}

impl InterceptFit {
    pub fn fit(y: ArrayView1<f64>, weights: ArrayView1<f64>) -> Result<Self> {
        check_lengths("response", y.len(), "weights", weights.len())?;

        let n_obs = y.len();
        let sum_weights = weights.sum();
        let coefficient = if sum_weights != 0.0 {
            y.iter().zip(weights.iter()).map(|(y, w)| y * w).sum::<f64>() / sum_weights
        } else {
            f64::NAN
        };
        let weighted_residuals = y
            .iter()
            .zip(weights.iter())
            .map(|(y, w)| w * (y - coefficient))
            .collect();

        Ok(Self {
            coefficient,
            n_obs,
            df_resid: n_obs as f64 - 1.0,
            sum_weights,
            weighted_residuals,
        })
    }

    /// Sandwich variance of the coefficient, NaN when undefined.
    pub fn variance(&self, cov_type: CovarianceType<'_>) -> f64 {
        if self.sum_weights == 0.0 || !self.coefficient.is_finite() || self.df_resid <= 0.0 {
            return f64::NAN;
        }
        let bread = self.sum_weights * self.sum_weights;

        match cov_type {
            CovarianceType::HC1 => {
                let meat: f64 = self.weighted_residuals.iter().map(|u| u * u).sum();
                let n = self.n_obs as f64;
                (n / self.df_resid) * meat / bread
            }
            CovarianceType::Cluster { codes, n_clusters } => {
                if n_clusters < 2 || codes.len() != self.n_obs {
                    return f64::NAN;
                }
                let mut cluster_totals = vec![0.0; n_clusters as usize];
                for (u, &c) in self.weighted_residuals.iter().zip(codes.iter()) {
                    if c != u32::MAX {
                        cluster_totals[c as usize] += u;
                    }
                }
                let meat: f64 = cluster_totals.iter().map(|t| t * t).sum();
                let g = n_clusters as f64;
                (g / (g - 1.0)) * meat / bread
            }
        }
    }

    pub fn standard_error(&self, cov_type: CovarianceType<'_>) -> f64 {
        self.variance(cov_type).sqrt()
    }
}
