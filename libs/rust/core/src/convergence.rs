//! Singular-value based early-stopping estimate.
//!
//! Every parameter tensor is viewed as an `m x 1` matrix, whose only singular value is its L2
//! norm. The mean of those values is the round's global drift `delta_g`, which is fed through
//!
//! ```text
//! lambda = 1 - n*mu*(1 + 3*bar_rho/8)
//! x      = 4*L*(n*C + D) / (mu*(8 + 3*bar_rho))
//! t      = log_lambda((delta_g - x) / ((L/mu)*A1 - 1))
//! ```
//!
//! Whenever the logarithm is undefined the estimate is the sentinel [`NO_ESTIMATE`], which
//! never recommends stopping.

use serde::{Serialize, Deserialize};
use tracing::{debug, warn};
use crate::error::ConvergenceDomainError;
use crate::weights::WeightStore;

pub const NO_ESTIMATE: f64 = -1.0;

/// Fixed coefficients of the estimate. Configuration, not learned.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConstants {
    pub n: f64,
    pub mu: f64,
    pub bar_rho: f64,
    pub l: f64,
    pub c: f64,
    pub d: f64,
    pub a1: f64,
}

impl Default for ConvergenceConstants {
    fn default() -> Self { Self { n: 0.04, mu: 0.3, bar_rho: 1.0, l: 1.0, c: 0.2, d: 0.1, a1: 18.0 } }
}

impl ConvergenceConstants {
    pub fn lambda(&self) -> f64 { 1.0 - self.n * self.mu * (1.0 + 3.0 * self.bar_rho / 8.0) }
    pub fn x(&self) -> f64 { 4.0 * self.l * (self.n * self.c + self.d) / (self.mu * (8.0 + 3.0 * self.bar_rho)) }
    pub fn denominator(&self) -> f64 { (self.l / self.mu) * self.a1 - 1.0 }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ConvergenceEstimate {
    pub round: u64,
    /// `None` when the model has no scalar parameters.
    pub drift: Option<f64>,
    pub stopping_round: f64,
    pub stop_recommended: bool,
}

impl ConvergenceEstimate {
    pub fn is_valid(&self) -> bool { self.stopping_round >= 0.0 }
}

#[derive(Clone, Debug, Default)]
pub struct ConvergenceEstimator { constants: ConvergenceConstants }

impl ConvergenceEstimator {
    pub fn new(constants: ConvergenceConstants) -> Self { Self { constants } }
    pub fn constants(&self) -> &ConvergenceConstants { &self.constants }

    /// Mean singular value across parameters. Zero-sized tensors have no singular values.
    pub fn global_drift(weights: &WeightStore) -> Result<f64, ConvergenceDomainError> {
        let singular: Vec<f64> = weights.iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(_, t)| t.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt())
            .collect();
        if singular.is_empty() { return Err(ConvergenceDomainError::EmptyModel); }
        Ok(singular.iter().sum::<f64>() / singular.len() as f64)
    }

    pub fn stopping_round(&self, delta_g: f64) -> Result<f64, ConvergenceDomainError> {
        let k = &self.constants;
        let lambda = k.lambda();
        let numerator = delta_g - k.x();
        let denominator = k.denominator();
        if !(numerator > 0.0 && denominator > 0.0) {
            return Err(ConvergenceDomainError::Argument { numerator, denominator });
        }
        if !(lambda > 0.0) || lambda == 1.0 { return Err(ConvergenceDomainError::Base(lambda)); }
        let t = (numerator / denominator).ln() / lambda.ln();
        if !t.is_finite() { return Err(ConvergenceDomainError::NonFinite); }
        Ok(t)
    }

    /// Never fails: domain problems are logged and collapse to [`NO_ESTIMATE`].
    pub fn estimate(&self, weights: &WeightStore, round: u64) -> ConvergenceEstimate {
        let drift = Self::global_drift(weights);
        let stopping_round = match drift.clone().and_then(|d| self.stopping_round(d)) {
            Ok(t) => t,
            Err(e) => {
                warn!(round, error = %e, "convergence_estimate_unavailable");
                NO_ESTIMATE
            }
        };
        let stop_recommended = stopping_round >= 0.0 && stopping_round >= round as f64;
        debug!(round, stopping_round, stop_recommended, "convergence_estimated");
        ConvergenceEstimate { round, drift: drift.ok(), stopping_round, stop_recommended }
    }
}
