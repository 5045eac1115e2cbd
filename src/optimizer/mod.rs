//! Constrained portfolio optimizer.
//!
//! Each rebalance solves a convex problem at unit exposure: a quadratic
//! objective from an [`AllocationObjective`] under the active
//! [`ConstraintSet`]. The engine scales the unit solution afterwards, so the
//! volatility forecast can be read off the unscaled portfolio.
//!
//! Failure handling:
//! - covariance that is not positive semidefinite is shrunk toward the scaled
//!   identity once; if it still fails, the solve errors out
//! - infeasible problems are retried with penalized slack on the inequality
//!   constraints, producing a `Degraded` result that names what it violates
//! - if even the relaxed problem is infeasible the result is `Infeasible`

pub mod objective;
pub(crate) mod problem;

pub use objective::{
    risk_parity_weights, AllocationObjective, Kelly, MeanVariance, ObjectiveInputs, RiskParity,
};
pub use problem::QuadraticObjective;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constraints::{ConstraintContext, ConstraintResidual, ConstraintSet, ConstraintTag, EQUALITY_TOLERANCE};
use crate::error::{BacktestError, Result};
use crate::numeric::{cholesky_psd, is_square_finite, quad_form, shrink_to_identity, symmetrize, Matrix};
use crate::types::SolverStatus;
use problem::{AllocationProblem, ProblemMode, QpBuilder, QpOutcome};

/// Which objective the optimizer builds from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    #[default]
    MeanVariance,
    RiskParity,
    Kelly,
}

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub objective: ObjectiveKind,
    /// Mean-variance risk aversion λ.
    #[serde(default = "default_risk_aversion")]
    pub risk_aversion: f64,
    /// Fraction of the full Kelly portfolio.
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    /// Linear charge on `|w - w_prev|` that picks the lowest-turnover
    /// solution among near-equal optima.
    #[serde(default = "default_turnover_penalty")]
    pub turnover_penalty: f64,
    /// Shrinkage intensity applied when the covariance is not PSD.
    #[serde(default = "default_shrinkage")]
    pub shrinkage: f64,
    /// Per-unit charge on constraint slack in the relaxed problem.
    #[serde(default = "default_relaxation_penalty")]
    pub relaxation_penalty: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
}

fn default_risk_aversion() -> f64 { 4.0 }
fn default_kelly_fraction() -> f64 { 0.5 }
fn default_turnover_penalty() -> f64 { 1e-7 }
fn default_shrinkage() -> f64 { 0.1 }
fn default_relaxation_penalty() -> f64 { 1e3 }
fn default_max_iter() -> u32 { problem::DEFAULT_MAX_ITER }

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            objective: ObjectiveKind::MeanVariance,
            risk_aversion: default_risk_aversion(),
            kelly_fraction: default_kelly_fraction(),
            turnover_penalty: default_turnover_penalty(),
            shrinkage: default_shrinkage(),
            relaxation_penalty: default_relaxation_penalty(),
            max_iter: default_max_iter(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.risk_aversion > 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "risk_aversion must be positive, got {}",
                self.risk_aversion
            )));
        }
        if !(self.kelly_fraction > 0.0 && self.kelly_fraction <= 1.0) {
            return Err(BacktestError::ConfigError(format!(
                "kelly_fraction must be in (0, 1], got {}",
                self.kelly_fraction
            )));
        }
        if !(self.turnover_penalty >= 0.0 && self.turnover_penalty.is_finite()) {
            return Err(BacktestError::ConfigError(format!(
                "turnover_penalty must be non-negative, got {}",
                self.turnover_penalty
            )));
        }
        if !(self.shrinkage > 0.0 && self.shrinkage <= 1.0) {
            return Err(BacktestError::ConfigError(format!(
                "shrinkage must be in (0, 1], got {}",
                self.shrinkage
            )));
        }
        if !(self.relaxation_penalty > 0.0 && self.relaxation_penalty.is_finite()) {
            return Err(BacktestError::ConfigError(format!(
                "relaxation_penalty must be positive, got {}",
                self.relaxation_penalty
            )));
        }
        if self.max_iter == 0 {
            return Err(BacktestError::ConfigError("max_iter must be positive".to_string()));
        }
        Ok(())
    }

    /// Objective named by `objective`.
    pub fn build_objective(&self) -> Box<dyn AllocationObjective> {
        match self.objective {
            ObjectiveKind::MeanVariance => Box::new(MeanVariance::new(self.risk_aversion)),
            ObjectiveKind::RiskParity => Box::new(RiskParity::new()),
            ObjectiveKind::Kelly => Box::new(Kelly::new(self.kelly_fraction)),
        }
    }
}

/// Forecasts and state for one solve. Units are per period.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationInputs<'a> {
    pub expected_returns: &'a [f64],
    pub covariance: &'a [Vec<f64>],
    pub betas: Option<&'a [f64]>,
    /// Holdings before the rebalance, for the turnover tie-break.
    pub previous_weights: Option<&'a [f64]>,
    pub risk_free_rate: f64,
}

impl<'a> OptimizationInputs<'a> {
    pub fn new(expected_returns: &'a [f64], covariance: &'a [Vec<f64>]) -> Self {
        Self {
            expected_returns,
            covariance,
            betas: None,
            previous_weights: None,
            risk_free_rate: 0.0,
        }
    }

    pub fn with_betas(mut self, betas: &'a [f64]) -> Self {
        self.betas = Some(betas);
        self
    }

    pub fn with_previous(mut self, previous: &'a [f64]) -> Self {
        self.previous_weights = Some(previous);
        self
    }
}

/// Outcome of one optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: Vec<f64>,
    /// Whether every constraint holds at unit scale.
    pub feasible: bool,
    /// Residuals at unit scale for every constraint.
    pub residuals: Vec<ConstraintResidual>,
    pub violated: Vec<ConstraintTag>,
    pub status: SolverStatus,
    pub exposure_scale: f64,
    /// Per-period volatility of the unit-scale portfolio.
    pub ex_ante_volatility: f64,
    /// Per-period volatility of each asset under the covariance the solve
    /// used, after any shrinkage.
    pub asset_volatility: Vec<f64>,
    pub covariance_shrunk: bool,
}

impl OptimizationResult {
    /// Multiply the weights by `scale`; the remainder sits in cash.
    pub fn scaled(mut self, scale: f64) -> Self {
        for w in &mut self.weights {
            *w *= scale;
        }
        self.exposure_scale *= scale;
        self
    }

    /// Residuals of violated constraints.
    pub fn violations(&self) -> Vec<ConstraintResidual> {
        self.residuals.iter().filter(|r| !r.satisfied).copied().collect()
    }
}

/// Constraints that must hold exactly in every usable allocation.
pub(crate) fn is_equality(tag: ConstraintTag) -> bool {
    matches!(
        tag,
        ConstraintTag::DollarNeutral | ConstraintTag::BetaNeutral | ConstraintTag::Budget
    )
}

/// Covariance ready for optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedCovariance {
    pub matrix: Matrix,
    /// Lower Cholesky factor of `matrix`.
    pub factor: Matrix,
    pub shrunk: bool,
}

impl ConditionedCovariance {
    pub fn asset_volatility(&self) -> Vec<f64> {
        self.matrix
            .iter()
            .enumerate()
            .map(|(i, row)| row[i].max(0.0).sqrt())
            .collect()
    }
}

/// Symmetrize the covariance and confirm it is PSD, shrinking toward the
/// scaled identity once if it is not.
pub fn condition_covariance(covariance: &[Vec<f64>], shrinkage: f64) -> Result<ConditionedCovariance> {
    let n = covariance.len();
    if !is_square_finite(covariance, n) {
        return Err(BacktestError::NumericalInstability {
            timestamp: None,
            detail: "covariance must be a square matrix of finite values".to_string(),
        });
    }
    let (matrix, asymmetry) = symmetrize(covariance);
    if asymmetry > 1e-10 {
        debug!("Symmetrized covariance (max asymmetry {:.3e})", asymmetry);
    }

    match cholesky_psd(&matrix) {
        Ok(factor) => Ok(ConditionedCovariance {
            matrix,
            factor,
            shrunk: false,
        }),
        Err(first) => {
            let shrunk = shrink_to_identity(&matrix, shrinkage);
            match cholesky_psd(&shrunk) {
                Ok(factor) => {
                    warn!(
                        "Covariance not PSD (pivot {:.3e} at {}), applied shrinkage {}",
                        first.pivot, first.index, shrinkage
                    );
                    Ok(ConditionedCovariance {
                        matrix: shrunk,
                        factor,
                        shrunk: true,
                    })
                }
                Err(second) => Err(BacktestError::NumericalInstability {
                    timestamp: None,
                    detail: format!(
                        "covariance not PSD after shrinkage {} (pivot {:.3e} at index {})",
                        shrinkage, second.pivot, second.index
                    ),
                }),
            }
        }
    }
}

/// Portfolio optimizer with a pluggable objective.
pub struct Optimizer {
    config: OptimizerConfig,
    objective: Box<dyn AllocationObjective>,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("config", &self.config)
            .field("objective", &self.objective.name())
            .finish()
    }
}

impl Optimizer {
    /// Optimizer using the objective named in the configuration.
    pub fn new(config: OptimizerConfig) -> Self {
        let objective = config.build_objective();
        Self { config, objective }
    }

    pub fn with_objective(config: OptimizerConfig, objective: Box<dyn AllocationObjective>) -> Self {
        Self { config, objective }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn objective_name(&self) -> &str {
        self.objective.name()
    }

    /// Solve and scale the result by `exposure_scale`, which must lie in
    /// `(0, 1]`.
    pub fn solve(
        &self,
        inputs: &OptimizationInputs<'_>,
        constraints: &ConstraintSet,
        exposure_scale: f64,
    ) -> Result<OptimizationResult> {
        if !(exposure_scale > 0.0 && exposure_scale <= 1.0) {
            return Err(BacktestError::InvalidInput(format!(
                "exposure scale must be in (0, 1], got {}",
                exposure_scale
            )));
        }
        Ok(self.solve_unit(inputs, constraints)?.scaled(exposure_scale))
    }

    /// Solve at unit exposure.
    pub fn solve_unit(
        &self,
        inputs: &OptimizationInputs<'_>,
        constraints: &ConstraintSet,
    ) -> Result<OptimizationResult> {
        let n = constraints.num_assets();
        self.check_inputs(inputs, n)?;

        let covariance = condition_covariance(inputs.covariance, self.config.shrinkage)?;
        let objective = self.objective.objective(&ObjectiveInputs {
            expected_returns: inputs.expected_returns,
            covariance: &covariance.matrix,
            risk_free_rate: inputs.risk_free_rate,
        })?;
        if objective.p.len() != n || objective.q.len() != n || !objective.is_finite() {
            return Err(BacktestError::NumericalInstability {
                timestamp: None,
                detail: format!("{} objective produced invalid terms", self.objective.name()),
            });
        }

        let ctx = ConstraintContext {
            betas: inputs.betas,
            expected_returns: Some(inputs.expected_returns),
            covariance: Some(&covariance.matrix),
        };
        let previous = inputs.previous_weights;

        let mut problem = AllocationProblem {
            constraints,
            context: &ctx,
            cholesky: Some(&covariance.factor),
            objective: &objective,
            previous,
            turnover_penalty: self.config.turnover_penalty,
            mode: ProblemMode::Strict,
            max_iter: self.config.max_iter,
        };

        if let QpOutcome::Solved(weights) = problem::solve(&problem)? {
            let result = self.finish(weights, SolverStatus::Optimal, constraints, &ctx, &covariance)?;
            if result.violated.iter().all(|tag| !is_equality(*tag)) {
                return Ok(result);
            }
        }

        debug!("Strict problem infeasible, relaxing inequality constraints");
        problem.mode = ProblemMode::Elastic {
            penalty: self.config.relaxation_penalty,
        };
        if let QpOutcome::Solved(weights) = problem::solve(&problem)? {
            let result = self.finish(weights, SolverStatus::Degraded, constraints, &ctx, &covariance)?;
            if result.violated.iter().all(|tag| !is_equality(*tag)) {
                return Ok(result);
            }
            warn!("Elastic solution misses equality constraints: {:?}", result.violated);
        }

        self.infeasible(constraints, &ctx, previous, &covariance)
    }

    fn infeasible(
        &self,
        constraints: &ConstraintSet,
        ctx: &ConstraintContext<'_>,
        previous: Option<&[f64]>,
        covariance: &ConditionedCovariance,
    ) -> Result<OptimizationResult> {
        let n = constraints.num_assets();
        let residuals = self.equality_diagnostics(constraints, ctx)?;
        let mut violated: Vec<ConstraintTag> = residuals
            .iter()
            .filter(|r| !r.satisfied)
            .map(|r| r.tag)
            .collect();
        if violated.is_empty() {
            violated = residuals.iter().map(|r| r.tag).collect();
        }
        if constraints.contains(ConstraintTag::BoundBox) {
            violated.push(ConstraintTag::BoundBox);
        }

        Ok(OptimizationResult {
            weights: previous.map(|p| p.to_vec()).unwrap_or_else(|| vec![0.0; n]),
            feasible: false,
            residuals,
            violated,
            status: SolverStatus::Infeasible,
            exposure_scale: 1.0,
            ex_ante_volatility: 0.0,
            asset_volatility: covariance.asset_volatility(),
            covariance_shrunk: covariance.shrunk,
        })
    }

    fn check_inputs(&self, inputs: &OptimizationInputs<'_>, n: usize) -> Result<()> {
        if inputs.expected_returns.len() != n || inputs.covariance.len() != n {
            return Err(BacktestError::InvalidInput(format!(
                "forecasts cover {} assets, constraints cover {}",
                inputs.expected_returns.len(),
                n
            )));
        }
        if inputs.expected_returns.iter().any(|m| !m.is_finite()) || !inputs.risk_free_rate.is_finite() {
            return Err(BacktestError::NumericalInstability {
                timestamp: None,
                detail: "expected returns must be finite".to_string(),
            });
        }
        if let Some(prev) = inputs.previous_weights {
            if prev.len() != n || prev.iter().any(|w| !w.is_finite()) {
                return Err(BacktestError::InvalidInput(
                    "previous weights must hold one finite value per asset".to_string(),
                ));
            }
        }
        if let Some(betas) = inputs.betas {
            if betas.len() != n || betas.iter().any(|b| !b.is_finite()) {
                return Err(BacktestError::InvalidInput(
                    "betas must hold one finite value per asset".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn finish(
        &self,
        mut weights: Vec<f64>,
        status: SolverStatus,
        constraints: &ConstraintSet,
        ctx: &ConstraintContext<'_>,
        covariance: &ConditionedCovariance,
    ) -> Result<OptimizationResult> {
        // Clip solver noise off the box, unless the weights sit outside it on
        // purpose (elastic slack) and clipping would move the equalities.
        let mut clipped = weights.clone();
        constraints.clip_to_bounds(&mut clipped);
        let equalities_hold = constraints
            .evaluate(&clipped, ctx)?
            .iter()
            .all(|r| r.satisfied || !is_equality(r.tag));
        if equalities_hold {
            weights = clipped;
        }
        let residuals = constraints.evaluate(&weights, ctx)?;
        let violated: Vec<ConstraintTag> = residuals
            .iter()
            .filter(|r| !r.satisfied)
            .map(|r| r.tag)
            .collect();

        let status = match (status, violated.is_empty()) {
            (SolverStatus::Optimal, false) | (SolverStatus::Degraded, false) => SolverStatus::Degraded,
            (_, true) => SolverStatus::Optimal,
            (other, false) => other,
        };
        if status == SolverStatus::Degraded {
            warn!("Allocation degraded, violated constraints: {:?}", violated);
        }

        Ok(OptimizationResult {
            ex_ante_volatility: quad_form(&covariance.matrix, &weights).max(0.0).sqrt(),
            weights,
            feasible: violated.is_empty(),
            residuals,
            violated,
            status,
            exposure_scale: 1.0,
            asset_volatility: covariance.asset_volatility(),
            covariance_shrunk: covariance.shrunk,
        })
    }

    /// Least-squares residuals of the equality constraints under the sign
    /// restrictions of the bound box: how far apart the equalities are.
    fn equality_diagnostics(
        &self,
        constraints: &ConstraintSet,
        ctx: &ConstraintContext<'_>,
    ) -> Result<Vec<ConstraintResidual>> {
        let n = constraints.num_assets();
        let rows = problem::equality_rows(constraints, ctx)?;

        let mut gram = vec![vec![0.0; n]; n];
        let mut qp = QpBuilder::new(n);
        for (_, a, b) in &rows {
            for i in 0..n {
                qp.add_linear(i, -a[i] * b);
                for j in 0..n {
                    gram[i][j] += a[i] * a[j];
                }
            }
        }
        qp.add_quadratic(&gram);
        let (lower, upper) = constraints.bounds();
        problem::add_sign_restrictions(&mut qp, &lower, &upper);

        let x = match qp.solve(self.config.max_iter) {
            Ok(QpOutcome::Solved(x)) => x,
            Ok(QpOutcome::Infeasible) | Err(_) => vec![0.0; n],
        };
        Ok(rows
            .iter()
            .map(|(tag, a, b)| {
                let residual = (crate::numeric::dot(a, &x[..n]) - b).abs();
                ConstraintResidual {
                    tag: *tag,
                    residual,
                    satisfied: residual <= EQUALITY_TOLERANCE,
                }
            })
            .collect())
    }
}
