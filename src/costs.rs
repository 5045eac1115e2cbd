//! Transaction cost models.
//!
//! Costs are expressed as a fraction of portfolio value and charged at the
//! moment of rebalancing.

use serde::{Deserialize, Serialize};

use crate::constraints::turnover;
use crate::error::{BacktestError, Result};
use crate::types::MarketSnapshot;

/// Market state a cost model may price a trade with.
#[derive(Debug, Clone, Copy)]
pub struct CostContext<'a> {
    pub snapshot: &'a MarketSnapshot,
    /// Per-period asset volatility from the covariance the rebalance was
    /// optimized with.
    pub asset_volatility: Option<&'a [f64]>,
}

impl<'a> CostContext<'a> {
    pub fn new(snapshot: &'a MarketSnapshot) -> Self {
        Self {
            snapshot,
            asset_volatility: None,
        }
    }

    pub fn with_volatility(mut self, asset_volatility: &'a [f64]) -> Self {
        self.asset_volatility = Some(asset_volatility);
        self
    }

    /// Volatility of asset `i`: the optimizer's, else the snapshot
    /// covariance diagonal.
    fn volatility(&self, i: usize) -> Option<f64> {
        match self.asset_volatility {
            Some(vol) => vol.get(i).copied(),
            None => self
                .snapshot
                .covariance
                .as_ref()
                .and_then(|cov| cov.get(i))
                .and_then(|row| row.get(i))
                .map(|v| v.max(0.0).sqrt()),
        }
    }
}

/// Cost of moving from one weight vector to another.
pub trait CostModel: Send + Sync {
    fn cost(&self, previous: &[f64], new: &[f64], ctx: &CostContext<'_>) -> f64;

    fn name(&self) -> &str {
        "Custom"
    }
}

/// Proportional cost: `turnover * cost_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearCostModel {
    pub cost_rate: f64,
}

impl LinearCostModel {
    pub fn new(cost_rate: f64) -> Self {
        Self { cost_rate }
    }

    /// Commission and slippage quoted separately, both per unit traded.
    pub fn from_commission_and_slippage(commission: f64, slippage: f64) -> Self {
        Self {
            cost_rate: commission + slippage,
        }
    }
}

impl Default for LinearCostModel {
    fn default() -> Self {
        Self { cost_rate: 0.001 }
    }
}

impl CostModel for LinearCostModel {
    fn cost(&self, previous: &[f64], new: &[f64], _ctx: &CostContext<'_>) -> f64 {
        turnover(previous, new) * self.cost_rate
    }

    fn name(&self) -> &str {
        "Linear"
    }
}

/// Linear cost plus square-root market impact.
///
/// Each trade of size `|Δw|` pays `cost_rate |Δw| + η σ |Δw|^1.5`, with σ the
/// per-period volatility of the asset. Assets without a volatility pay only
/// the linear part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SquareRootImpactModel {
    pub cost_rate: f64,
    pub impact_coefficient: f64,
}

impl SquareRootImpactModel {
    pub fn new(cost_rate: f64, impact_coefficient: f64) -> Self {
        Self {
            cost_rate,
            impact_coefficient,
        }
    }
}

impl CostModel for SquareRootImpactModel {
    fn cost(&self, previous: &[f64], new: &[f64], ctx: &CostContext<'_>) -> f64 {
        let linear = turnover(previous, new) * self.cost_rate;
        let impact: f64 = previous
            .iter()
            .zip(new)
            .enumerate()
            .map(|(i, (p, n))| {
                let sigma = ctx.volatility(i).unwrap_or(0.0);
                self.impact_coefficient * sigma * (n - p).abs().powf(1.5)
            })
            .sum();
        linear + impact
    }

    fn name(&self) -> &str {
        "Square-Root Impact"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostModelKind {
    #[default]
    Linear,
    SquareRootImpact,
}

/// Cost settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostConfig {
    #[serde(default)]
    pub model: CostModelKind,
    /// Cost per unit of turnover.
    #[serde(default = "default_cost_rate")]
    pub cost_rate: f64,
    #[serde(default)]
    pub impact_coefficient: f64,
}

fn default_cost_rate() -> f64 { 0.001 }

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            model: CostModelKind::Linear,
            cost_rate: default_cost_rate(),
            impact_coefficient: 0.0,
        }
    }
}

impl CostConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.cost_rate >= 0.0 && self.cost_rate < 1.0) {
            return Err(BacktestError::ConfigError(format!(
                "cost_rate must be in [0, 1), got {}",
                self.cost_rate
            )));
        }
        if !(self.impact_coefficient >= 0.0 && self.impact_coefficient.is_finite()) {
            return Err(BacktestError::ConfigError(format!(
                "impact_coefficient must be non-negative, got {}",
                self.impact_coefficient
            )));
        }
        Ok(())
    }

    pub fn build(&self) -> Box<dyn CostModel> {
        match self.model {
            CostModelKind::Linear => Box::new(LinearCostModel::new(self.cost_rate)),
            CostModelKind::SquareRootImpact => Box::new(SquareRootImpactModel::new(
                self.cost_rate,
                self.impact_coefficient,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(), vec![0.0, 0.0])
    }

    #[test]
    fn test_linear_cost() {
        let model = LinearCostModel::new(0.001);
        let cost = model.cost(&[0.5, 0.5], &[0.2, 0.8], &CostContext::new(&snapshot()));
        assert!((cost - 0.0006).abs() < 1e-15);
    }

    #[test]
    fn test_no_trade_no_cost() {
        let model = LinearCostModel::new(0.01);
        assert_eq!(model.cost(&[0.3, 0.7], &[0.3, 0.7], &CostContext::new(&snapshot())), 0.0);
    }

    #[test]
    fn test_commission_and_slippage() {
        let model = LinearCostModel::from_commission_and_slippage(0.0007, 0.0003);
        assert!((model.cost_rate - 0.001).abs() < 1e-15);
    }

    #[test]
    fn test_impact_without_covariance_is_linear() {
        let model = SquareRootImpactModel::new(0.001, 0.5);
        let cost = model.cost(&[0.0, 0.0], &[1.0, 0.0], &CostContext::new(&snapshot()));
        assert!((cost - 0.001).abs() < 1e-15);
    }

    #[test]
    fn test_impact_grows_faster_than_linear() {
        let snap = snapshot().with_forecasts(vec![0.0, 0.0], vec![vec![0.0004, 0.0], vec![0.0, 0.0004]]);
        let model = SquareRootImpactModel::new(0.0, 1.0);
        let ctx = CostContext::new(&snap);
        let small = model.cost(&[0.0, 0.0], &[0.1, 0.0], &ctx);
        let large = model.cost(&[0.0, 0.0], &[0.4, 0.0], &ctx);
        // 4x the trade costs 8x the impact
        assert!((large / small - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_impact_prefers_optimizer_volatility() {
        // The snapshot says 2% volatility; the estimator in use says 5%.
        let snap = snapshot().with_forecasts(vec![0.0, 0.0], vec![vec![0.0004, 0.0], vec![0.0, 0.0004]]);
        let model = SquareRootImpactModel::new(0.0, 1.0);
        let vol = [0.05, 0.05];
        let cost = model.cost(&[0.0, 0.0], &[0.25, 0.0], &CostContext::new(&snap).with_volatility(&vol));
        assert!((cost - 0.05 * 0.125).abs() < 1e-15);

        let bare = snapshot();
        let estimated_only = CostContext::new(&bare).with_volatility(&vol);
        assert!((model.cost(&[0.0, 0.0], &[0.25, 0.0], &estimated_only) - 0.05 * 0.125).abs() < 1e-15);
    }

    #[test]
    fn test_config_builds_model() {
        let config = CostConfig {
            model: CostModelKind::SquareRootImpact,
            cost_rate: 0.002,
            impact_coefficient: 0.1,
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.build().name(), "Square-Root Impact");

        let bad = CostConfig {
            cost_rate: -0.1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
