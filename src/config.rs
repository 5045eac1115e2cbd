//! Configuration file support.
//!
//! A run is fully described by a [`BacktestConfig`], loadable from TOML for
//! reproducibility. Every field has a default, so a file only needs the
//! settings it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::constraints::TailRiskMetric;
use crate::costs::CostConfig;
use crate::error::{BacktestError, Result};
use crate::estimation::EstimationConfig;
use crate::optimizer::OptimizerConfig;
use crate::risk::RiskConfig;
use crate::scheduler::ScheduleConfig;

/// What to do when a snapshot lacks required data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataGapPolicy {
    /// Skip the period (or defer the rebalance) and record the gap.
    #[default]
    Hold,
    /// Stop the run.
    Abort,
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default)]
    pub backtest: BacktestSettings,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub constraints: ConstraintSettings,
    #[serde(default)]
    pub estimation: EstimationConfig,
}

/// General run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    /// Periods per year, for annualization.
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
    /// Annual risk-free rate.
    #[serde(default)]
    pub risk_free_rate: f64,
    #[serde(default)]
    pub data_gap_policy: DataGapPolicy,
}

fn default_capital() -> f64 { 1_000_000.0 }
fn default_periods_per_year() -> f64 { 252.0 }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_capital(),
            periods_per_year: default_periods_per_year(),
            risk_free_rate: 0.0,
            data_gap_policy: DataGapPolicy::Hold,
        }
    }
}

/// Constraint settings. Absent options leave the constraint out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSettings {
    #[serde(default)]
    pub dollar_neutral: bool,
    #[serde(default)]
    pub beta_neutral: bool,
    /// Net exposure `Σw` when not dollar neutral (1.0 if unset).
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub min_weight: Option<f64>,
    #[serde(default)]
    pub max_weight: Option<f64>,
    #[serde(default)]
    pub gross_exposure_cap: Option<f64>,
    #[serde(default)]
    pub tail_risk_metric: TailRiskMetric,
    #[serde(default = "default_tail_risk_confidence")]
    pub tail_risk_confidence: f64,
    /// Per-period cap on the tail metric; enables the tail-risk constraint.
    #[serde(default)]
    pub tail_risk_threshold: Option<f64>,
}

fn default_tail_risk_confidence() -> f64 { 0.95 }

impl Default for ConstraintSettings {
    fn default() -> Self {
        Self {
            dollar_neutral: false,
            beta_neutral: false,
            budget: None,
            min_weight: None,
            max_weight: None,
            gross_exposure_cap: None,
            tail_risk_metric: TailRiskMetric::Cvar,
            tail_risk_confidence: default_tail_risk_confidence(),
            tail_risk_threshold: None,
        }
    }
}

impl BacktestConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BacktestConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        let b = &self.backtest;
        if !(b.initial_capital > 0.0 && b.initial_capital.is_finite()) {
            return Err(BacktestError::ConfigError(format!(
                "initial_capital must be positive, got {}",
                b.initial_capital
            )));
        }
        if !(b.periods_per_year > 0.0 && b.periods_per_year.is_finite()) {
            return Err(BacktestError::ConfigError(format!(
                "periods_per_year must be positive, got {}",
                b.periods_per_year
            )));
        }
        if !b.risk_free_rate.is_finite() {
            return Err(BacktestError::ConfigError("risk_free_rate must be finite".to_string()));
        }
        let c = &self.constraints;
        if let (Some(min), Some(max)) = (c.min_weight, c.max_weight) {
            if min > max {
                return Err(BacktestError::ConfigError(format!(
                    "min_weight {} exceeds max_weight {}",
                    min, max
                )));
            }
        }
        self.schedule.validate()?;
        self.risk.validate()?;
        self.optimizer.validate()?;
        self.costs.validate()?;
        self.estimation.validate()
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Rebalancing backtest configuration

[backtest]
initial_capital = 1000000.0
periods_per_year = 252.0
risk_free_rate = 0.02
data_gap_policy = "hold"     # "hold" or "abort"

[schedule]
rebalance_period = 21        # periods between rebalances
calendar = "periods"         # "periods", "weekly", "monthly", "quarterly", "yearly"
anchor = "start"             # "start", "mid", "end", or { on = "Fri" } with "weekly"
drift_threshold = 0.10       # L1 drift that forces a rebalance

[risk]
target_vol = 0.10
vol_half_life = 20.0
min_scale = 0.1
max_scale = 1.0
vol_forecast = "ex_ante"     # "ex_ante" or "realized"
drawdown_threshold = 0.15
drawdown_max = 0.30
drawdown_floor_scale = 0.3
rerisk_threshold = 0.10
rerisk_step = 0.1

[optimizer]
objective = "mean_variance"  # "mean_variance", "risk_parity", "kelly"
risk_aversion = 4.0
kelly_fraction = 0.5
turnover_penalty = 1e-7
shrinkage = 0.1

[costs]
model = "linear"             # "linear" or "square_root_impact"
cost_rate = 0.001

[constraints]
min_weight = 0.0
max_weight = 0.4
gross_exposure_cap = 1.0
tail_risk_confidence = 0.95
# tail_risk_threshold = 0.03
# dollar_neutral = true
# beta_neutral = true

[estimation]
method = "sample"            # "none", "sample", "ewma"
window = 60
"#
        .to_string()
    }
}
