//! Core data types for the rebalancing engine.
//!
//! Per-asset vectors are aligned with the engine's universe: position `i` in
//! every vector refers to the `i`-th [`Asset`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::constraints::ConstraintResidual;

/// A tradable asset in the universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    /// Static market beta, used when a snapshot carries no betas.
    pub beta: Option<f64>,
}

impl Asset {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            beta: None,
        }
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = Some(beta);
        self
    }
}

/// Immutable view of the market for one period.
///
/// `returns[i]` is the return of asset `i` over the period ending at
/// `timestamp`. A `None` entry marks a missing observation. Forecasts are in
/// per-period units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    pub returns: Vec<Option<f64>>,
    pub prices: Option<Vec<f64>>,
    pub benchmark_return: Option<f64>,
    pub betas: Option<Vec<f64>>,
    pub expected_returns: Option<Vec<f64>>,
    pub covariance: Option<Vec<Vec<f64>>>,
}

impl MarketSnapshot {
    /// Snapshot with every return observed and no forecasts.
    pub fn new(timestamp: DateTime<Utc>, returns: Vec<f64>) -> Self {
        Self {
            timestamp,
            returns: returns.into_iter().map(Some).collect(),
            prices: None,
            benchmark_return: None,
            betas: None,
            expected_returns: None,
            covariance: None,
        }
    }

    /// Snapshot whose returns may contain gaps.
    pub fn with_partial_returns(timestamp: DateTime<Utc>, returns: Vec<Option<f64>>) -> Self {
        Self {
            returns,
            ..Self::new(timestamp, Vec::new())
        }
    }

    pub fn with_forecasts(mut self, expected_returns: Vec<f64>, covariance: Vec<Vec<f64>>) -> Self {
        self.expected_returns = Some(expected_returns);
        self.covariance = Some(covariance);
        self
    }

    pub fn with_betas(mut self, betas: Vec<f64>) -> Self {
        self.betas = Some(betas);
        self
    }

    pub fn with_benchmark(mut self, benchmark_return: f64) -> Self {
        self.benchmark_return = Some(benchmark_return);
        self
    }

    pub fn with_prices(mut self, prices: Vec<f64>) -> Self {
        self.prices = Some(prices);
        self
    }

    /// All returns, if every one of the `n` assets was observed with a
    /// finite value.
    pub fn complete_returns(&self, n: usize) -> Option<Vec<f64>> {
        if self.returns.len() != n {
            return None;
        }
        self.returns
            .iter()
            .map(|r| r.filter(|v| v.is_finite()))
            .collect()
    }

    /// Identifiers of assets whose return is missing or non-finite.
    pub fn missing_returns(&self, assets: &[Asset]) -> Vec<String> {
        assets
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                !matches!(self.returns.get(*i), Some(Some(v)) if v.is_finite())
            })
            .map(|(_, a)| format!("return:{}", a.id))
            .collect()
    }

    /// Whether the snapshot carries a complete forecast for `n` assets.
    pub fn has_forecasts(&self, n: usize) -> bool {
        matches!(
            (&self.expected_returns, &self.covariance),
            (Some(mu), Some(cov)) if mu.len() == n && cov.len() == n && cov.iter().all(|row| row.len() == n)
        )
    }
}

/// Why a rebalance happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReason {
    Scheduled,
    DriftThreshold,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Scheduled => write!(f, "SCHEDULED"),
            TriggerReason::DriftThreshold => write!(f, "DRIFT"),
        }
    }
}

/// Outcome of an optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverStatus {
    Optimal,
    /// Feasible only after relaxing inequality constraints.
    Degraded,
    Infeasible,
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverStatus::Optimal => write!(f, "OPTIMAL"),
            SolverStatus::Degraded => write!(f, "DEGRADED"),
            SolverStatus::Infeasible => write!(f, "INFEASIBLE"),
        }
    }
}

/// Holdings of a running portfolio. Weights not held in assets sit in cash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    /// Current weights, drifted by realized returns since the last rebalance.
    pub weights: Vec<f64>,
    /// Weights committed at the last rebalance.
    pub target_weights: Vec<f64>,
    pub last_rebalance_step: Option<usize>,
    pub last_rebalance: Option<DateTime<Utc>>,
    pub exposure_scale: f64,
}

impl PortfolioState {
    /// All-cash portfolio over `n` assets.
    pub fn cash(n: usize) -> Self {
        Self {
            weights: vec![0.0; n],
            target_weights: vec![0.0; n],
            last_rebalance_step: None,
            last_rebalance: None,
            exposure_scale: 1.0,
        }
    }

    pub fn gross_exposure(&self) -> f64 {
        self.weights.iter().map(|w| w.abs()).sum()
    }

    pub fn net_exposure(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Weight left in cash.
    pub fn cash_weight(&self) -> f64 {
        1.0 - self.net_exposure()
    }

    /// L1 distance between the drifted and the target weights.
    pub fn drift(&self) -> f64 {
        self.weights
            .iter()
            .zip(&self.target_weights)
            .map(|(w, t)| (w - t).abs())
            .sum()
    }

    /// Weights keyed by asset id.
    pub fn as_map(&self, assets: &[Asset]) -> BTreeMap<String, f64> {
        assets
            .iter()
            .zip(&self.weights)
            .map(|(a, w)| (a.id.clone(), *w))
            .collect()
    }

    /// Revalue holdings after one period of asset returns.
    ///
    /// Returns the portfolio return. Cash earns zero.
    pub(crate) fn drift_with(&mut self, returns: &[f64]) -> f64 {
        let portfolio_return: f64 = self
            .weights
            .iter()
            .zip(returns)
            .map(|(w, r)| w * r)
            .sum();
        let growth = 1.0 + portfolio_return;
        if growth > 0.0 {
            for (w, r) in self.weights.iter_mut().zip(returns) {
                *w = *w * (1.0 + r) / growth;
            }
        }
        portfolio_return
    }
}

/// One point of the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub peak: f64,
    /// `1 - value / peak`, in `[0, 1)`.
    pub drawdown: f64,
    /// Return over the period ending at this point, costs included.
    pub period_return: f64,
    pub benchmark_return: Option<f64>,
}

/// Record of one executed rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub reason: TriggerReason,
    pub pre_weights: Vec<f64>,
    pub post_weights: Vec<f64>,
    pub turnover: f64,
    /// Cost as a fraction of portfolio value.
    pub cost: f64,
    pub status: SolverStatus,
    /// Residuals of the constraints the solution violates. Empty unless the
    /// status is `Degraded`.
    pub violations: Vec<ConstraintResidual>,
    pub exposure_scale: f64,
    pub volatility_scale: f64,
    pub drawdown_factor: f64,
    /// Annualized volatility forecast used for targeting.
    pub forecast_volatility: f64,
    pub covariance_shrunk: bool,
}

/// What the engine did about missing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapAction {
    /// Missing returns: the period was skipped and weights held.
    SkippedPeriod,
    /// Missing forecasts or betas: the due rebalance moved to a later period.
    DeferredRebalance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGapRecord {
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub missing: Vec<String>,
    pub action: GapAction,
}
