//! Backtest execution engine.
//!
//! The [`Engine`] is built once from a configuration and a universe and is
//! immutable afterwards; every run owns a fresh simulation state, so one
//! engine can serve many runs, including concurrent ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analytics::{PerformanceSummary, TradingActivity};
use crate::config::{BacktestConfig, DataGapPolicy};
use crate::constraints::{turnover, ConstraintSet};
use crate::costs::{CostContext, CostModel};
use crate::error::{BacktestError, Result};
use crate::estimation::{ForecastEstimator, ReturnHistory};
use crate::metadata::{equity_curve_digest, RunMetadata};
use crate::optimizer::{AllocationObjective, OptimizationInputs, Optimizer};
use crate::risk::{RiskController, RiskState};
use crate::scheduler::RebalanceScheduler;
use crate::types::{
    Asset, DataGapRecord, EquityPoint, GapAction, MarketSnapshot, PortfolioState, RebalanceEvent,
    SolverStatus, TriggerReason,
};

/// Shared flag for stopping a run between steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    /// Stopped by a cancellation token before processing `step`.
    Cancelled { step: usize },
    /// A fatal error at `step`; the result holds the last valid state.
    Aborted { step: usize },
}

/// Results from a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub metadata: RunMetadata,
    /// Asset identifiers, in weight order.
    pub assets: Vec<String>,
    pub initial_capital: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub events: Vec<RebalanceEvent>,
    pub data_gaps: Vec<DataGapRecord>,
    /// Degraded rebalances and other non-fatal conditions.
    pub warnings: Vec<String>,
    pub final_state: PortfolioState,
    pub risk_state: RiskState,
    pub summary: PerformanceSummary,
    pub activity: TradingActivity,
    pub outcome: RunOutcome,
}

impl BacktestResult {
    pub fn final_value(&self) -> f64 {
        self.summary.final_value
    }

    /// SHA256 digest of the equity curve.
    pub fn curve_digest(&self) -> String {
        equity_curve_digest(&self.equity_curve)
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// Events whose solve had to relax constraints.
    pub fn degraded_events(&self) -> impl Iterator<Item = &RebalanceEvent> {
        self.events
            .iter()
            .filter(|e| e.status == SolverStatus::Degraded)
    }
}

/// The rebalancing backtest engine.
pub struct Engine {
    config: BacktestConfig,
    assets: Vec<Asset>,
    constraints: ConstraintSet,
    optimizer: Optimizer,
    controller: RiskController,
    cost_model: Box<dyn CostModel>,
    estimator: Option<Box<dyn ForecastEstimator>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("assets", &self.assets)
            .field("constraints", &self.constraints)
            .field("optimizer", &self.optimizer)
            .field("cost_model", &self.cost_model.name())
            .field("estimator", &self.estimator.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

impl Engine {
    /// Build an engine for `assets` from a validated configuration.
    pub fn new(config: BacktestConfig, assets: Vec<Asset>) -> Result<Self> {
        config.validate()?;
        if assets.is_empty() {
            return Err(BacktestError::InvalidInput(
                "universe must hold at least one asset".to_string(),
            ));
        }
        for (i, asset) in assets.iter().enumerate() {
            if assets[..i].iter().any(|a| a.id == asset.id) {
                return Err(BacktestError::InvalidInput(format!(
                    "duplicate asset id: {}",
                    asset.id
                )));
            }
        }

        let constraints = ConstraintSet::from_settings(&config.constraints, assets.len())?;
        let optimizer = Optimizer::new(config.optimizer.clone());
        let controller = RiskController::new(config.risk.clone(), config.backtest.periods_per_year);
        let cost_model = config.costs.build();
        let estimator = config.estimation.build()?;

        Ok(Self {
            config,
            assets,
            constraints,
            optimizer,
            controller,
            cost_model,
            estimator,
        })
    }

    /// Replace the constraints built from configuration.
    pub fn with_constraints(mut self, constraints: ConstraintSet) -> Result<Self> {
        if constraints.num_assets() != self.assets.len() {
            return Err(BacktestError::InvalidInput(format!(
                "constraint set covers {} assets, universe has {}",
                constraints.num_assets(),
                self.assets.len()
            )));
        }
        self.constraints = constraints;
        Ok(self)
    }

    pub fn with_objective(mut self, objective: Box<dyn AllocationObjective>) -> Self {
        self.optimizer = Optimizer::with_objective(self.config.optimizer.clone(), objective);
        self
    }

    pub fn with_cost_model(mut self, cost_model: Box<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    pub fn with_estimator(mut self, estimator: Box<dyn ForecastEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    /// Run the backtest over `snapshots`.
    pub fn run(&self, snapshots: &[MarketSnapshot]) -> Result<BacktestResult> {
        self.run_with_cancel(snapshots, &CancellationToken::new())
    }

    /// Run the backtest, checking `cancel` before each step.
    ///
    /// Invalid input fails before the first step. A fatal error during the
    /// run is returned as [`BacktestError::RunAborted`] carrying the partial
    /// result; cancellation returns `Ok` with [`RunOutcome::Cancelled`].
    pub fn run_with_cancel(
        &self,
        snapshots: &[MarketSnapshot],
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        self.validate_snapshots(snapshots)?;

        info!(
            "Starting backtest: {} assets, {} periods, objective {}",
            self.assets.len(),
            snapshots.len(),
            self.optimizer.objective_name()
        );

        let mut sim = Simulation::new(self);
        for (step, snapshot) in snapshots.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Backtest cancelled before step {}", step);
                return Ok(sim.finish(self, RunOutcome::Cancelled { step }));
            }
            if let Err(e) = sim.step(self, step, snapshot) {
                warn!("Backtest aborted at step {}: {}", step, e);
                let partial = sim.finish(self, RunOutcome::Aborted { step });
                return Err(BacktestError::RunAborted {
                    step,
                    source: Box::new(e),
                    partial: Box::new(partial),
                });
            }
        }

        let result = sim.finish(self, RunOutcome::Completed);
        info!(
            "Backtest complete: final value {:.2}, {} rebalances, Sharpe {:.2}",
            result.summary.final_value,
            result.events.len(),
            result.summary.sharpe_ratio
        );
        Ok(result)
    }

    fn validate_snapshots(&self, snapshots: &[MarketSnapshot]) -> Result<()> {
        let n = self.assets.len();
        let mut previous: Option<DateTime<Utc>> = None;
        for (step, snap) in snapshots.iter().enumerate() {
            if let Some(prev) = previous {
                if snap.timestamp <= prev {
                    return Err(BacktestError::InvalidInput(format!(
                        "timestamps must be strictly increasing: step {} at {} follows {}",
                        step, snap.timestamp, prev
                    )));
                }
            }
            previous = Some(snap.timestamp);

            if snap.returns.len() != n {
                return Err(BacktestError::InvalidInput(format!(
                    "snapshot at {} has {} returns for {} assets",
                    snap.timestamp,
                    snap.returns.len(),
                    n
                )));
            }
            let forecast_shape_ok = match (&snap.expected_returns, &snap.covariance) {
                (None, None) => true,
                (Some(_), Some(_)) => snap.has_forecasts(n),
                _ => false,
            };
            if !forecast_shape_ok {
                return Err(BacktestError::InvalidInput(format!(
                    "snapshot at {} carries incomplete forecasts",
                    snap.timestamp
                )));
            }
            if snap.betas.as_ref().map_or(false, |b| b.len() != n) {
                return Err(BacktestError::InvalidInput(format!(
                    "snapshot at {} has betas of the wrong length",
                    snap.timestamp
                )));
            }
            if let Some(prices) = &snap.prices {
                if prices.len() != n || prices.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
                    return Err(BacktestError::InvalidInput(format!(
                        "snapshot at {} has invalid prices",
                        snap.timestamp
                    )));
                }
            }
        }
        Ok(())
    }

    /// Per-period forecasts for a rebalance, or the names of what is missing.
    fn resolve_forecasts(
        &self,
        snapshot: &MarketSnapshot,
        history: &ReturnHistory,
    ) -> std::result::Result<(Vec<f64>, Vec<Vec<f64>>), Vec<String>> {
        if let (Some(mu), Some(cov)) = (&snapshot.expected_returns, &snapshot.covariance) {
            return Ok((mu.clone(), cov.clone()));
        }
        match self.estimator.as_ref().and_then(|e| e.estimate(history)) {
            Some(forecast) => Ok((forecast.expected_returns, forecast.covariance)),
            None => Err(vec![
                "forecast:expected_returns".to_string(),
                "forecast:covariance".to_string(),
            ]),
        }
    }

    /// Betas for a rebalance: the snapshot's, else the static asset betas.
    fn resolve_betas(&self, snapshot: &MarketSnapshot) -> std::result::Result<Option<Vec<f64>>, Vec<String>> {
        if !self.constraints.needs_betas() {
            return Ok(None);
        }
        if let Some(betas) = &snapshot.betas {
            return Ok(Some(betas.clone()));
        }
        let missing: Vec<String> = self
            .assets
            .iter()
            .filter(|a| a.beta.map_or(true, |b| !b.is_finite()))
            .map(|a| format!("beta:{}", a.id))
            .collect();
        if missing.is_empty() {
            Ok(Some(self.assets.iter().filter_map(|a| a.beta).collect()))
        } else {
            Err(missing)
        }
    }

    fn metadata(&self) -> RunMetadata {
        RunMetadata::new(
            &(&self.config, self.constraints.constraints(), &self.assets),
            self.optimizer.objective_name(),
            self.cost_model.name(),
        )
    }
}

/// Mutable state of one run.
struct Simulation {
    state: PortfolioState,
    risk: RiskState,
    scheduler: RebalanceScheduler,
    history: ReturnHistory,
    value: f64,
    peak: f64,
    equity_curve: Vec<EquityPoint>,
    events: Vec<RebalanceEvent>,
    data_gaps: Vec<DataGapRecord>,
    warnings: Vec<String>,
}

impl Simulation {
    fn new(engine: &Engine) -> Self {
        let capacity = engine.estimator.as_ref().map_or(0, |e| e.warmup());
        let capital = engine.config.backtest.initial_capital;
        Self {
            state: PortfolioState::cash(engine.assets.len()),
            risk: RiskState::default(),
            scheduler: RebalanceScheduler::new(engine.config.schedule.clone()),
            history: ReturnHistory::new(capacity),
            value: capital,
            peak: capital,
            equity_curve: Vec::new(),
            events: Vec::new(),
            data_gaps: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Advance one period. A failed step leaves holdings, value and risk
    /// state as they were after the previous step.
    fn step(&mut self, engine: &Engine, step: usize, snapshot: &MarketSnapshot) -> Result<()> {
        let state = self.state.clone();
        let risk = self.risk.clone();
        let (value, peak) = (self.value, self.peak);

        let outcome = self.advance(engine, step, snapshot);
        if outcome.is_err() {
            self.state = state;
            self.risk = risk;
            self.value = value;
            self.peak = peak;
        }
        outcome
    }

    fn advance(&mut self, engine: &Engine, step: usize, snapshot: &MarketSnapshot) -> Result<()> {
        let n = engine.assets.len();
        let ts = snapshot.timestamp;

        let Some(returns) = snapshot.complete_returns(n) else {
            let missing = snapshot.missing_returns(&engine.assets);
            return self.record_gap(engine, step, ts, missing, GapAction::SkippedPeriod);
        };

        // Realize the period with the weights held since the last step.
        let prev_value = self.value;
        let invested = self.state.weights.iter().any(|w| *w != 0.0);
        let exposure_scale = self.state.exposure_scale;
        let portfolio_return = self.state.drift_with(&returns);
        self.value *= 1.0 + portfolio_return;
        if !(self.value > 0.0) {
            return Err(BacktestError::PortfolioExhausted {
                timestamp: ts,
                value: self.value,
            });
        }
        self.peak = self.peak.max(self.value);
        let drawdown = 1.0 - self.value / self.peak;
        let unit_return = invested.then(|| portfolio_return / exposure_scale);
        engine.controller.observe(&mut self.risk, unit_return, drawdown);
        self.history.push(returns);

        if let Some(reason) = self.scheduler.poll(ts, self.state.drift())? {
            debug!("Rebalance due at {} ({})", ts, reason);
            let reason = self.scheduler.begin()?;
            self.rebalance(engine, step, snapshot, reason)?;
        }

        self.peak = self.peak.max(self.value);
        self.equity_curve.push(EquityPoint {
            step,
            timestamp: ts,
            value: self.value,
            peak: self.peak,
            drawdown: 1.0 - self.value / self.peak,
            period_return: self.value / prev_value - 1.0,
            benchmark_return: snapshot.benchmark_return,
        });
        Ok(())
    }

    fn rebalance(
        &mut self,
        engine: &Engine,
        step: usize,
        snapshot: &MarketSnapshot,
        reason: TriggerReason,
    ) -> Result<()> {
        let ts = snapshot.timestamp;
        let resolved = engine
            .resolve_forecasts(snapshot, &self.history)
            .and_then(|f| engine.resolve_betas(snapshot).map(|b| (f, b)));
        let ((mu, cov), betas) = match resolved {
            Ok(inputs) => inputs,
            Err(missing) => {
                self.scheduler.defer()?;
                return self.record_gap(engine, step, ts, missing, GapAction::DeferredRebalance);
            }
        };

        // Unit-scale equivalent of current holdings, for the turnover tie-break.
        let previous_unit: Vec<f64> = self
            .state
            .weights
            .iter()
            .map(|w| w / self.state.exposure_scale)
            .collect();
        let mut inputs = OptimizationInputs::new(&mu, &cov).with_previous(&previous_unit);
        inputs.risk_free_rate = engine.config.backtest.risk_free_rate / engine.config.backtest.periods_per_year;
        if let Some(b) = betas.as_deref() {
            inputs = inputs.with_betas(b);
        }

        let raw = engine
            .optimizer
            .solve_unit(&inputs, &engine.constraints)
            .map_err(|e| e.at(ts))?;
        if raw.status == SolverStatus::Infeasible {
            return Err(BacktestError::InfeasibleConstraint {
                timestamp: Some(ts),
                violated: raw.violated,
                residuals: raw.residuals,
            });
        }

        let decision = engine.controller.exposure(&self.risk, raw.ex_ante_volatility);
        let result = raw.scaled(decision.scale);

        let cost_ctx = CostContext::new(snapshot).with_volatility(&result.asset_volatility);
        let cost = engine.cost_model.cost(&self.state.weights, &result.weights, &cost_ctx);
        if !cost.is_finite() || cost < 0.0 {
            return Err(BacktestError::NumericalInstability {
                timestamp: Some(ts),
                detail: format!("cost model {} returned {}", engine.cost_model.name(), cost),
            });
        }
        if cost >= 1.0 {
            return Err(BacktestError::PortfolioExhausted {
                timestamp: ts,
                value: self.value * (1.0 - cost),
            });
        }
        self.value *= 1.0 - cost;

        let violations = if result.status == SolverStatus::Degraded {
            let violations = result.violations();
            let message = format!(
                "{}: degraded allocation violates {:?}",
                ts,
                violations.iter().map(|v| v.tag).collect::<Vec<_>>()
            );
            warn!("{}", message);
            self.warnings.push(message);
            violations
        } else {
            Vec::new()
        };

        let pre_weights = std::mem::replace(&mut self.state.weights, result.weights.clone());
        let event = RebalanceEvent {
            step,
            timestamp: ts,
            reason,
            turnover: turnover(&pre_weights, &result.weights),
            pre_weights,
            post_weights: result.weights.clone(),
            cost,
            status: result.status,
            violations,
            exposure_scale: decision.scale,
            volatility_scale: decision.volatility_scale,
            drawdown_factor: decision.drawdown_factor,
            forecast_volatility: decision.forecast_volatility,
            covariance_shrunk: result.covariance_shrunk,
        };
        debug!(
            "Rebalanced at {}: turnover {:.4}, cost {:.6}, scale {:.3} ({})",
            ts, event.turnover, cost, decision.scale, event.status
        );

        self.state.target_weights = result.weights;
        self.state.last_rebalance_step = Some(step);
        self.state.last_rebalance = Some(ts);
        self.state.exposure_scale = decision.scale;
        self.events.push(event);
        self.scheduler.complete(ts)
    }

    fn record_gap(
        &mut self,
        engine: &Engine,
        step: usize,
        timestamp: DateTime<Utc>,
        missing: Vec<String>,
        action: GapAction,
    ) -> Result<()> {
        if engine.config.backtest.data_gap_policy == DataGapPolicy::Abort {
            return Err(BacktestError::DataGap {
                step,
                timestamp,
                missing,
            });
        }
        warn!("Data gap at {} (step {}): missing {:?}, {:?}", timestamp, step, missing, action);
        self.data_gaps.push(DataGapRecord {
            step,
            timestamp,
            missing,
            action,
        });
        Ok(())
    }

    fn finish(self, engine: &Engine, outcome: RunOutcome) -> BacktestResult {
        let settings = &engine.config.backtest;
        let summary = PerformanceSummary::from_equity_curve(
            &self.equity_curve,
            settings.initial_capital,
            settings.periods_per_year,
            settings.risk_free_rate,
        );
        let mut metadata = engine.metadata();
        metadata.start = self.equity_curve.first().map(|p| p.timestamp);
        metadata.end = self.equity_curve.last().map(|p| p.timestamp);

        BacktestResult {
            metadata,
            assets: engine.assets.iter().map(|a| a.id.clone()).collect(),
            initial_capital: settings.initial_capital,
            activity: TradingActivity::from_events(&self.events),
            equity_curve: self.equity_curve,
            events: self.events,
            data_gaps: self.data_gaps,
            warnings: self.warnings,
            final_state: self.state,
            risk_state: self.risk,
            summary,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConstraintSettings;
    use crate::costs::{CostConfig, CostModelKind};
    use crate::estimation::EstimationMethod;
    use chrono::{Duration, TimeZone};

    fn day(i: usize) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(i as i64)
    }

    fn assets() -> Vec<Asset> {
        vec![Asset::new("A"), Asset::new("B")]
    }

    fn cov() -> Vec<Vec<f64>> {
        vec![vec![0.0004, 0.0], vec![0.0, 0.0001]]
    }

    fn snapshots(n: usize) -> Vec<MarketSnapshot> {
        (0..n)
            .map(|i| {
                let r = if i % 2 == 0 { 0.01 } else { -0.005 };
                MarketSnapshot::new(day(i), vec![r, 0.002]).with_forecasts(vec![0.001, 0.0005], cov())
            })
            .collect()
    }

    fn config() -> BacktestConfig {
        let mut config = BacktestConfig::default();
        config.schedule.rebalance_period = 5;
        config.constraints = ConstraintSettings {
            min_weight: Some(0.0),
            max_weight: Some(1.0),
            ..Default::default()
        };
        config
    }

    #[test]
    fn test_first_step_rebalances_from_cash() {
        let engine = Engine::new(config(), assets()).unwrap();
        let result = engine.run(&snapshots(10)).unwrap();

        assert_eq!(result.equity_curve.len(), 10);
        assert_eq!(result.events[0].step, 0);
        // Cash earns nothing during the first period; only the cost applies.
        let expected = 1_000_000.0 * (1.0 - result.events[0].cost);
        assert!((result.equity_curve[0].value - expected).abs() < 1e-6);
        assert!(result.events[0].pre_weights.iter().all(|w| *w == 0.0));
        assert!(result.is_complete());
    }

    #[test]
    fn test_rebalances_follow_schedule() {
        let engine = Engine::new(config(), assets()).unwrap();
        let result = engine.run(&snapshots(12)).unwrap();
        let steps: Vec<usize> = result.events.iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![0, 5, 10]);
        assert_eq!(result.activity.rebalances, 3);
    }

    #[test]
    fn test_costs_reduce_value() {
        let mut free = config();
        free.costs.cost_rate = 0.0;
        let mut costly = config();
        costly.costs.cost_rate = 0.01;

        let a = Engine::new(free, assets()).unwrap().run(&snapshots(8)).unwrap();
        let b = Engine::new(costly, assets()).unwrap().run(&snapshots(8)).unwrap();
        assert!(b.final_value() < a.final_value());
        assert!(b.activity.total_cost > 0.0);
    }

    #[test]
    fn test_non_increasing_timestamps_rejected() {
        let engine = Engine::new(config(), assets()).unwrap();
        let mut snaps = snapshots(3);
        snaps[2].timestamp = snaps[1].timestamp;
        assert!(matches!(engine.run(&snaps), Err(BacktestError::InvalidInput(_))));
    }

    #[test]
    fn test_wrong_return_count_rejected() {
        let engine = Engine::new(config(), assets()).unwrap();
        let snaps = vec![MarketSnapshot::new(day(0), vec![0.01])];
        assert!(matches!(engine.run(&snaps), Err(BacktestError::InvalidInput(_))));
    }

    #[test]
    fn test_bad_prices_rejected() {
        let engine = Engine::new(config(), assets()).unwrap();
        let mut snaps = snapshots(3);
        snaps[1] = snaps[1].clone().with_prices(vec![100.0, 50.0]);
        assert!(engine.run(&snaps).is_ok());
        snaps[2] = snaps[2].clone().with_prices(vec![100.0, -1.0]);
        assert!(matches!(engine.run(&snaps), Err(BacktestError::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_assets_rejected() {
        let err = Engine::new(config(), vec![Asset::new("A"), Asset::new("A")]).unwrap_err();
        assert!(matches!(err, BacktestError::InvalidInput(_)));
    }

    #[test]
    fn test_empty_input() {
        let engine = Engine::new(config(), assets()).unwrap();
        let result = engine.run(&[]).unwrap();
        assert!(result.equity_curve.is_empty());
        assert_eq!(result.final_value(), 1_000_000.0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let engine = Engine::new(config(), assets()).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let result = engine.run_with_cancel(&snapshots(5), &token).unwrap();
        assert_eq!(result.outcome, RunOutcome::Cancelled { step: 0 });
        assert!(result.equity_curve.is_empty());
    }

    #[test]
    fn test_missing_forecast_defers_rebalance() {
        let engine = Engine::new(config(), assets()).unwrap();
        let mut snaps = snapshots(4);
        snaps[0].expected_returns = None;
        snaps[0].covariance = None;

        let result = engine.run(&snaps).unwrap();
        assert_eq!(result.data_gaps.len(), 1);
        assert_eq!(result.data_gaps[0].action, GapAction::DeferredRebalance);
        // The due rebalance happens at the next period with forecasts.
        assert_eq!(result.events[0].step, 1);
    }

    #[test]
    fn test_exhausting_cost_aborts() {
        struct Ruinous;
        impl CostModel for Ruinous {
            fn cost(&self, _: &[f64], _: &[f64], _: &CostContext<'_>) -> f64 {
                1.0
            }
        }
        let engine = Engine::new(config(), assets()).unwrap().with_cost_model(Box::new(Ruinous));
        let err = engine.run(&snapshots(3)).unwrap_err();
        assert!(matches!(err.root_cause(), BacktestError::PortfolioExhausted { .. }));
        let partial = err.partial_result().unwrap();
        assert_eq!(partial.outcome, RunOutcome::Aborted { step: 0 });
        assert!(partial.equity_curve.is_empty());
    }

    #[test]
    fn test_impact_cost_uses_estimated_covariance() {
        let mut config = config();
        config.costs = CostConfig {
            model: CostModelKind::SquareRootImpact,
            cost_rate: 0.0,
            impact_coefficient: 1.0,
        };
        config.estimation.method = EstimationMethod::Sample;
        config.estimation.window = 3;
        let snaps: Vec<MarketSnapshot> = (0..6)
            .map(|i| {
                let a = [0.01, -0.005, 0.004][i % 3];
                let b = [0.002, 0.006, -0.004][i % 3];
                MarketSnapshot::new(day(i), vec![a, b])
            })
            .collect();

        let result = Engine::new(config, assets()).unwrap().run(&snaps).unwrap();
        let event = &result.events[0];
        assert_eq!(event.step, 2);
        // No snapshot covariance: the impact is priced from the estimate.
        assert!(event.cost > 0.0);
    }

    #[test]
    fn test_metadata_is_stable() {
        let a = Engine::new(config(), assets()).unwrap().run(&snapshots(3)).unwrap();
        let b = Engine::new(config(), assets()).unwrap().run(&snapshots(3)).unwrap();
        assert_eq!(a.metadata.run_id, b.metadata.run_id);
        assert_eq!(a.metadata.start, Some(day(0)));
        assert_eq!(a.metadata.objective, "Mean-Variance");
        assert_eq!(a.curve_digest(), b.curve_digest());
    }
}
