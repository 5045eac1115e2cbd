//! Allocation objectives.
//!
//! Every objective reduces to a convex quadratic `½wᵀPw + qᵀw` so the
//! optimizer can hand it to the same conic solver regardless of the
//! constraints in force.

use crate::error::{BacktestError, Result};
use crate::numeric::mat_vec;

use super::problem::QuadraticObjective;

/// Forecast data an objective may draw on. Units are per period.
#[derive(Debug, Clone, Copy)]
pub struct ObjectiveInputs<'a> {
    pub expected_returns: &'a [f64],
    pub covariance: &'a [Vec<f64>],
    pub risk_free_rate: f64,
}

/// A portfolio objective, expressed as a quadratic to minimize.
pub trait AllocationObjective: Send + Sync {
    fn objective(&self, inputs: &ObjectiveInputs<'_>) -> Result<QuadraticObjective>;

    fn name(&self) -> &str {
        "Custom"
    }
}

/// Markowitz utility: maximize `μᵀw - (λ/2) wᵀΣw`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanVariance {
    pub risk_aversion: f64,
}

impl MeanVariance {
    pub fn new(risk_aversion: f64) -> Self {
        Self { risk_aversion }
    }
}

impl AllocationObjective for MeanVariance {
    fn objective(&self, inputs: &ObjectiveInputs<'_>) -> Result<QuadraticObjective> {
        if !(self.risk_aversion > 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "risk aversion must be positive, got {}",
                self.risk_aversion
            )));
        }
        Ok(QuadraticObjective::new(
            scale_matrix(inputs.covariance, self.risk_aversion),
            inputs.expected_returns.iter().map(|m| -m).collect(),
        ))
    }

    fn name(&self) -> &str {
        "Mean-Variance"
    }
}

/// Fractional Kelly sizing under a Gaussian return model.
///
/// The growth-optimal portfolio maximizes `(μ - r_f)ᵀw - ½wᵀΣw`; a fraction
/// `f` of it solves the same problem with the quadratic term scaled by `1/f`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kelly {
    pub fraction: f64,
}

impl Kelly {
    pub fn new(fraction: f64) -> Self {
        Self { fraction }
    }
}

impl AllocationObjective for Kelly {
    fn objective(&self, inputs: &ObjectiveInputs<'_>) -> Result<QuadraticObjective> {
        if !(self.fraction > 0.0 && self.fraction <= 1.0) {
            return Err(BacktestError::ConfigError(format!(
                "Kelly fraction must be in (0, 1], got {}",
                self.fraction
            )));
        }
        Ok(QuadraticObjective::new(
            scale_matrix(inputs.covariance, 1.0 / self.fraction),
            inputs
                .expected_returns
                .iter()
                .map(|m| -(m - inputs.risk_free_rate))
                .collect(),
        ))
    }

    fn name(&self) -> &str {
        "Kelly"
    }
}

/// Equal risk contribution, or contributions proportional to `budgets`.
///
/// The unconstrained risk-parity portfolio is found first; the optimizer then
/// finds the feasible portfolio closest to it in the covariance metric,
/// `½(w - w_rp)ᵀΣ(w - w_rp)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RiskParity {
    pub budgets: Option<Vec<f64>>,
}

impl RiskParity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budgets(budgets: Vec<f64>) -> Self {
        Self {
            budgets: Some(budgets),
        }
    }
}

impl AllocationObjective for RiskParity {
    fn objective(&self, inputs: &ObjectiveInputs<'_>) -> Result<QuadraticObjective> {
        let target = risk_parity_weights(inputs.covariance, self.budgets.as_deref())?;
        let pull = mat_vec(inputs.covariance, &target);
        Ok(QuadraticObjective::new(
            inputs.covariance.to_vec(),
            pull.iter().map(|v| -v).collect(),
        ))
    }

    fn name(&self) -> &str {
        "Risk Parity"
    }
}

const RISK_PARITY_MAX_SWEEPS: usize = 1_000;
const RISK_PARITY_TOLERANCE: f64 = 1e-12;

/// Long-only weights summing to one whose risk contributions
/// `wᵢ(Σw)ᵢ / wᵀΣw` match `budgets` (equal when `None`).
///
/// Cyclical coordinate descent on `½yᵀΣy - Σ bᵢ ln yᵢ`, whose minimizer is
/// proportional to the risk-budgeting portfolio.
pub fn risk_parity_weights(covariance: &[Vec<f64>], budgets: Option<&[f64]>) -> Result<Vec<f64>> {
    let n = covariance.len();
    if n == 0 {
        return Err(BacktestError::InvalidInput("empty covariance".to_string()));
    }
    let budgets: Vec<f64> = match budgets {
        Some(b) if b.len() == n && b.iter().all(|v| *v > 0.0) => {
            let total: f64 = b.iter().sum();
            b.iter().map(|v| v / total).collect()
        }
        Some(_) => {
            return Err(BacktestError::InvalidInput(format!(
                "risk budgets must be {} positive values",
                n
            )))
        }
        None => vec![1.0 / n as f64; n],
    };
    for i in 0..n {
        if !(covariance[i][i] > 0.0) {
            return Err(BacktestError::NumericalInstability {
                timestamp: None,
                detail: format!("risk parity needs positive variances (asset {})", i),
            });
        }
    }

    let mut y: Vec<f64> = (0..n).map(|i| 1.0 / covariance[i][i].sqrt()).collect();
    for _ in 0..RISK_PARITY_MAX_SWEEPS {
        let mut max_change: f64 = 0.0;
        for i in 0..n {
            let a = covariance[i][i];
            let cross: f64 = (0..n)
                .filter(|&j| j != i)
                .map(|j| covariance[i][j] * y[j])
                .sum();
            let updated = (-cross + (cross * cross + 4.0 * a * budgets[i]).sqrt()) / (2.0 * a);
            max_change = max_change.max((updated - y[i]).abs() / updated.abs().max(1e-300));
            y[i] = updated;
        }
        if max_change < RISK_PARITY_TOLERANCE {
            break;
        }
    }

    let total: f64 = y.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(BacktestError::NumericalInstability {
            timestamp: None,
            detail: "risk parity iteration diverged".to_string(),
        });
    }
    Ok(y.into_iter().map(|v| v / total).collect())
}

fn scale_matrix(m: &[Vec<f64>], factor: f64) -> Vec<Vec<f64>> {
    m.iter()
        .map(|row| row.iter().map(|v| v * factor).collect())
        .collect()
}
