//! Risk controller: volatility targeting and drawdown de-risking.
//!
//! The controller itself is stateless configuration. Its path-dependent state
//! lives in [`RiskState`], which the engine threads through the simulation
//! loop, so the scale at every step is a function of (config, state, inputs).

use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};

/// Where the volatility forecast for targeting comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolForecast {
    /// Volatility of the unit-scale optimized portfolio under the forecast
    /// covariance.
    #[default]
    ExAnte,
    /// EWMA of realized unit-scale portfolio returns, ex-ante until warmed up.
    Realized,
}

/// Risk controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Annualized volatility target.
    #[serde(default = "default_target_vol")]
    pub target_vol: f64,
    /// Half-life, in periods, of the realized-volatility EWMA.
    #[serde(default = "default_vol_half_life")]
    pub vol_half_life: f64,
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
    #[serde(default = "default_max_scale")]
    pub max_scale: f64,
    #[serde(default)]
    pub vol_forecast: VolForecast,
    /// Drawdown at which de-risking starts.
    #[serde(default = "default_drawdown_threshold")]
    pub drawdown_threshold: f64,
    /// Drawdown at which the factor reaches its floor.
    #[serde(default = "default_drawdown_max")]
    pub drawdown_max: f64,
    #[serde(default = "default_drawdown_floor_scale")]
    pub drawdown_floor_scale: f64,
    /// Drawdown below which exposure may recover.
    #[serde(default = "default_rerisk_threshold")]
    pub rerisk_threshold: f64,
    /// Per-period recovery of the drawdown factor once re-risking.
    #[serde(default = "default_rerisk_step")]
    pub rerisk_step: f64,
}

fn default_target_vol() -> f64 { 0.10 }
fn default_vol_half_life() -> f64 { 20.0 }
fn default_min_scale() -> f64 { 0.1 }
fn default_max_scale() -> f64 { 1.0 }
fn default_drawdown_threshold() -> f64 { 0.15 }
fn default_drawdown_max() -> f64 { 0.30 }
fn default_drawdown_floor_scale() -> f64 { 0.3 }
fn default_rerisk_threshold() -> f64 { 0.10 }
fn default_rerisk_step() -> f64 { 0.1 }

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            target_vol: default_target_vol(),
            vol_half_life: default_vol_half_life(),
            min_scale: default_min_scale(),
            max_scale: default_max_scale(),
            vol_forecast: VolForecast::ExAnte,
            drawdown_threshold: default_drawdown_threshold(),
            drawdown_max: default_drawdown_max(),
            drawdown_floor_scale: default_drawdown_floor_scale(),
            rerisk_threshold: default_rerisk_threshold(),
            rerisk_step: default_rerisk_step(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(BacktestError::ConfigError(msg));
        if !(self.target_vol > 0.0 && self.target_vol.is_finite()) {
            return err(format!("target_vol must be positive, got {}", self.target_vol));
        }
        if !(self.vol_half_life > 0.0 && self.vol_half_life.is_finite()) {
            return err(format!("vol_half_life must be positive, got {}", self.vol_half_life));
        }
        if !(self.min_scale > 0.0 && self.min_scale <= self.max_scale && self.max_scale <= 1.0) {
            return err(format!(
                "scale bounds must satisfy 0 < min_scale <= max_scale <= 1, got [{}, {}]",
                self.min_scale, self.max_scale
            ));
        }
        if !(self.drawdown_threshold > 0.0
            && self.drawdown_threshold < self.drawdown_max
            && self.drawdown_max < 1.0)
        {
            return err(format!(
                "drawdown thresholds must satisfy 0 < threshold < max < 1, got {} and {}",
                self.drawdown_threshold, self.drawdown_max
            ));
        }
        if !(self.rerisk_threshold >= 0.0 && self.rerisk_threshold < self.drawdown_threshold) {
            return err(format!(
                "rerisk_threshold must be in [0, drawdown_threshold), got {}",
                self.rerisk_threshold
            ));
        }
        if !(self.drawdown_floor_scale > 0.0 && self.drawdown_floor_scale <= 1.0) {
            return err(format!(
                "drawdown_floor_scale must be in (0, 1], got {}",
                self.drawdown_floor_scale
            ));
        }
        if !(self.rerisk_step > 0.0 && self.rerisk_step <= 1.0) {
            return err(format!("rerisk_step must be in (0, 1], got {}", self.rerisk_step));
        }
        Ok(())
    }

    /// EWMA decay per period.
    pub fn decay(&self) -> f64 {
        0.5_f64.powf(1.0 / self.vol_half_life)
    }
}

/// Path-dependent risk state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    /// EWMA of squared per-period returns of the unit-scale portfolio.
    pub ewma_variance: f64,
    pub observations: usize,
    /// Set while drawdown has not yet retreated below the re-risk threshold.
    pub derisking: bool,
    pub drawdown_factor: f64,
    pub drawdown: f64,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            ewma_variance: 0.0,
            observations: 0,
            derisking: false,
            drawdown_factor: 1.0,
            drawdown: 0.0,
        }
    }
}

impl RiskState {
    /// Annualized EWMA volatility.
    pub fn realized_volatility(&self, periods_per_year: f64) -> f64 {
        (self.ewma_variance * periods_per_year).max(0.0).sqrt()
    }
}

/// Exposure scale and its parts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureDecision {
    pub volatility_scale: f64,
    pub drawdown_factor: f64,
    /// Product of the two, in `(0, 1]`.
    pub scale: f64,
    pub forecast_volatility: f64,
}

/// Volatility targeting and drawdown control.
#[derive(Debug, Clone)]
pub struct RiskController {
    config: RiskConfig,
    periods_per_year: f64,
}

impl RiskController {
    pub fn new(config: RiskConfig, periods_per_year: f64) -> Self {
        Self {
            config,
            periods_per_year,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Advance the state by one period.
    ///
    /// `unit_return` is the period return of the held portfolio divided by
    /// the exposure scale it was sized with, so the EWMA tracks the
    /// unit-scale portfolio that targeting rescales. `None` while nothing was
    /// held: such periods say nothing about volatility.
    pub fn observe(&self, state: &mut RiskState, unit_return: Option<f64>, drawdown: f64) {
        if let Some(r) = unit_return.filter(|r| r.is_finite()) {
            let squared = r * r;
            if state.observations == 0 {
                state.ewma_variance = squared;
            } else {
                let lambda = self.config.decay();
                state.ewma_variance = lambda * state.ewma_variance + (1.0 - lambda) * squared;
            }
            state.observations += 1;
        }
        self.update_drawdown(state, drawdown);
    }

    /// Apply the drawdown ramp with hysteresis.
    pub fn update_drawdown(&self, state: &mut RiskState, drawdown: f64) {
        state.drawdown = drawdown;
        let target = self.drawdown_ramp(drawdown);

        if drawdown > self.config.drawdown_threshold {
            state.derisking = true;
        }
        if state.derisking {
            if drawdown < self.config.rerisk_threshold {
                state.derisking = false;
                state.drawdown_factor = (state.drawdown_factor + self.config.rerisk_step).min(1.0);
            } else {
                state.drawdown_factor = state.drawdown_factor.min(target);
            }
        } else if state.drawdown_factor < 1.0 {
            state.drawdown_factor = (state.drawdown_factor + self.config.rerisk_step).min(1.0);
        }
    }

    /// Piecewise-linear factor: 1 up to the threshold, the floor at and past
    /// `drawdown_max`.
    pub fn drawdown_ramp(&self, drawdown: f64) -> f64 {
        let c = &self.config;
        if drawdown <= c.drawdown_threshold {
            1.0
        } else if drawdown >= c.drawdown_max {
            c.drawdown_floor_scale
        } else {
            let progress = (drawdown - c.drawdown_threshold) / (c.drawdown_max - c.drawdown_threshold);
            1.0 - progress * (1.0 - c.drawdown_floor_scale)
        }
    }

    /// `target_vol / forecast`, clamped. A vanishing forecast gets the
    /// maximum scale.
    pub fn volatility_scale(&self, forecast_volatility: f64) -> f64 {
        let c = &self.config;
        if !(forecast_volatility > 1e-12) || !forecast_volatility.is_finite() {
            return c.max_scale;
        }
        (c.target_vol / forecast_volatility).clamp(c.min_scale, c.max_scale)
    }

    /// Annualized forecast for targeting, given the per-period ex-ante
    /// volatility of the candidate portfolio.
    pub fn forecast_volatility(&self, state: &RiskState, ex_ante_per_period: f64) -> f64 {
        let ex_ante = ex_ante_per_period * self.periods_per_year.sqrt();
        match self.config.vol_forecast {
            VolForecast::ExAnte => ex_ante,
            VolForecast::Realized => {
                let realized = state.realized_volatility(self.periods_per_year);
                if (state.observations as f64) >= self.config.vol_half_life && realized > 1e-12 {
                    realized
                } else {
                    ex_ante
                }
            }
        }
    }

    /// Exposure scale for a rebalance.
    pub fn exposure(&self, state: &RiskState, ex_ante_per_period: f64) -> ExposureDecision {
        let forecast_volatility = self.forecast_volatility(state, ex_ante_per_period);
        let volatility_scale = self.volatility_scale(forecast_volatility);
        let drawdown_factor = state.drawdown_factor;
        ExposureDecision {
            volatility_scale,
            drawdown_factor,
            scale: (volatility_scale * drawdown_factor).clamp(f64::MIN_POSITIVE, 1.0),
            forecast_volatility,
        }
    }
}
