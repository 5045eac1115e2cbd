//! Mantis Rebalance - constrained portfolio optimization and scheduled
//! rebalancing backtests.
//!
//! # Overview
//!
//! The engine replays a sequence of market snapshots. At every rebalance it
//! solves a convex allocation problem under a set of constraints, scales the
//! result with a risk controller, charges transaction costs and records what
//! happened:
//!
//! - **Constraints**: dollar and beta neutrality, per-asset bounds, gross
//!   exposure caps and parametric tail-risk caps
//! - **Objectives**: mean-variance, risk parity and fractional Kelly
//! - **Risk control**: volatility targeting and drawdown de-risking with
//!   hysteresis
//! - **Scheduling**: calendar and drift triggers
//! - **Reproducibility**: deterministic runs, configuration hashes and equity
//!   curve digests
//!
//! # Quick Start
//!
//! ```no_run
//! use mantis_rebalance::{Asset, BacktestConfig, Engine, MarketSnapshot};
//! use chrono::{TimeZone, Utc};
//!
//! let assets = vec![Asset::new("SPY"), Asset::new("TLT")];
//! let cov = vec![vec![0.0001, 0.0], vec![0.0, 0.00005]];
//! let snapshots = vec![MarketSnapshot::new(
//!     Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
//!     vec![0.001, -0.002],
//! )
//! .with_forecasts(vec![0.0004, 0.0002], cov)];
//!
//! let engine = Engine::new(BacktestConfig::default(), assets).unwrap();
//! let result = engine.run(&snapshots).unwrap();
//! println!("Sharpe: {:.2}", result.summary.sharpe_ratio);
//! ```
//!
//! # Modules
//!
//! - [`types`]: snapshots, portfolio state, equity points and events
//! - [`constraints`]: constraint set, residuals and projection
//! - [`optimizer`]: objectives and the constrained solver
//! - [`risk`]: volatility targeting and drawdown control
//! - [`scheduler`]: rebalance state machine
//! - [`costs`]: transaction cost models
//! - [`estimation`]: forecasts from observed returns
//! - [`engine`]: the backtest loop
//! - [`analytics`]: performance metrics
//! - [`sweep`]: parallel runs over configurations
//! - [`config`]: TOML configuration
//! - [`metadata`]: run identity and digests

pub mod analytics;
pub mod config;
pub mod constraints;
pub mod costs;
pub mod engine;
pub mod error;
pub mod estimation;
pub mod metadata;
pub mod numeric;
pub mod optimizer;
pub mod risk;
pub mod scheduler;
pub mod sweep;
pub mod types;

pub use analytics::{BenchmarkMetrics, PerformanceSummary, TradingActivity};
pub use config::{BacktestConfig, ConstraintSettings, DataGapPolicy};
pub use constraints::{Constraint, ConstraintResidual, ConstraintSet, ConstraintTag, TailRiskMetric};
pub use costs::{CostContext, CostModel, LinearCostModel, SquareRootImpactModel};
pub use engine::{BacktestResult, CancellationToken, Engine, RunOutcome};
pub use error::{BacktestError, Result};
pub use estimation::{EwmaEstimator, ForecastEstimator, SampleEstimator};
pub use metadata::{equity_curve_digest, RunMetadata};
pub use optimizer::{
    AllocationObjective, Kelly, MeanVariance, ObjectiveKind, OptimizationInputs,
    OptimizationResult, Optimizer, OptimizerConfig, RiskParity,
};
pub use risk::{RiskConfig, RiskController, RiskState, VolForecast};
pub use scheduler::{CalendarAnchor, CalendarRule, RebalanceScheduler, ScheduleConfig};
pub use sweep::{run_sweep, SweepJob, SweepOutcome};
pub use types::{
    Asset, DataGapRecord, EquityPoint, GapAction, MarketSnapshot, PortfolioState, RebalanceEvent,
    SolverStatus, TriggerReason,
};
