//! Portfolio constraints.
//!
//! A [`ConstraintSet`] is an ordered, duplicate-free collection of
//! [`Constraint`]s. Every set carries a net-exposure normalization: either
//! dollar neutrality (`Σw = 0`), an explicit [`Constraint::Budget`], or the
//! implicit fully-invested budget `Σw = 1`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConstraintSettings;
use crate::error::{BacktestError, Result};
use crate::numeric::{cholesky_psd, dot, normal_pdf, normal_quantile, quad_form};
use crate::optimizer::problem::{self, AllocationProblem, ProblemMode, QpOutcome, QuadraticObjective};
use crate::types::MarketSnapshot;

/// Tolerance for equality and cap constraints.
pub const EQUALITY_TOLERANCE: f64 = 1e-6;

/// Net exposure implied when a set names neither dollar neutrality nor a
/// budget.
pub const DEFAULT_BUDGET: f64 = 1.0;

/// Identifies a constraint kind. A set holds at most one constraint per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConstraintTag {
    DollarNeutral,
    BetaNeutral,
    BoundBox,
    TailRiskCap,
    GrossExposureCap,
    Budget,
}

impl fmt::Display for ConstraintTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintTag::DollarNeutral => "dollar_neutral",
            ConstraintTag::BetaNeutral => "beta_neutral",
            ConstraintTag::BoundBox => "bound_box",
            ConstraintTag::TailRiskCap => "tail_risk_cap",
            ConstraintTag::GrossExposureCap => "gross_exposure_cap",
            ConstraintTag::Budget => "budget",
        };
        write!(f, "{}", name)
    }
}

/// Parametric tail-risk measure of the portfolio loss `-wᵀr`, with
/// `r ~ N(μ, Σ)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailRiskMetric {
    /// Expected shortfall beyond the `confidence` quantile.
    #[default]
    Cvar,
    /// Loss quantile at `confidence`.
    Var,
}

impl TailRiskMetric {
    /// Multiplier `k` such that the metric equals `-μᵀw + k σ(w)`.
    pub fn multiplier(self, confidence: f64) -> f64 {
        let z = normal_quantile(confidence);
        match self {
            TailRiskMetric::Cvar => normal_pdf(z) / (1.0 - confidence),
            TailRiskMetric::Var => z,
        }
    }

    /// Tail risk of `weights` in per-period return units.
    pub fn evaluate(self, confidence: f64, weights: &[f64], mu: &[f64], cov: &[Vec<f64>]) -> f64 {
        let sigma = quad_form(cov, weights).max(0.0).sqrt();
        -dot(mu, weights) + self.multiplier(confidence) * sigma
    }
}

/// A single portfolio constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// `Σw = 0`.
    DollarNeutral,
    /// `Σ βᵢ wᵢ = 0`, betas taken from the market snapshot.
    BetaNeutral,
    /// Per-asset `lower[i] <= w[i] <= upper[i]`. Infinite bounds are allowed.
    BoundBox { lower: Vec<f64>, upper: Vec<f64> },
    /// Parametric tail risk of the portfolio at most `threshold`.
    TailRiskCap {
        metric: TailRiskMetric,
        confidence: f64,
        threshold: f64,
    },
    /// `Σ|w| <= cap`.
    GrossExposureCap(f64),
    /// `Σw = net`.
    Budget(f64),
}

impl Constraint {
    pub fn tag(&self) -> ConstraintTag {
        match self {
            Constraint::DollarNeutral => ConstraintTag::DollarNeutral,
            Constraint::BetaNeutral => ConstraintTag::BetaNeutral,
            Constraint::BoundBox { .. } => ConstraintTag::BoundBox,
            Constraint::TailRiskCap { .. } => ConstraintTag::TailRiskCap,
            Constraint::GrossExposureCap(_) => ConstraintTag::GrossExposureCap,
            Constraint::Budget(_) => ConstraintTag::Budget,
        }
    }

    /// Same bounds for every asset.
    pub fn uniform_bounds(num_assets: usize, min: f64, max: f64) -> Self {
        Constraint::BoundBox {
            lower: vec![min; num_assets],
            upper: vec![max; num_assets],
        }
    }

    /// Long-only box `[0, max]`.
    pub fn long_only(num_assets: usize, max: f64) -> Self {
        Self::uniform_bounds(num_assets, 0.0, max)
    }

    pub fn tail_risk_cvar(confidence: f64, threshold: f64) -> Self {
        Constraint::TailRiskCap {
            metric: TailRiskMetric::Cvar,
            confidence,
            threshold,
        }
    }
}

/// How far a weight vector is from satisfying one constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstraintResidual {
    pub tag: ConstraintTag,
    /// Absolute equality error, or the excess over an inequality (0 when met).
    pub residual: f64,
    pub satisfied: bool,
}

impl ConstraintResidual {
    fn equality(tag: ConstraintTag, residual: f64) -> Self {
        Self {
            tag,
            residual,
            satisfied: residual <= EQUALITY_TOLERANCE,
        }
    }
}

/// Market data a constraint may need to evaluate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintContext<'a> {
    pub betas: Option<&'a [f64]>,
    pub expected_returns: Option<&'a [f64]>,
    pub covariance: Option<&'a [Vec<f64>]>,
}

impl<'a> ConstraintContext<'a> {
    pub fn from_snapshot(snapshot: &'a MarketSnapshot) -> Self {
        Self {
            betas: snapshot.betas.as_deref(),
            expected_returns: snapshot.expected_returns.as_deref(),
            covariance: snapshot.covariance.as_deref(),
        }
    }

    pub(crate) fn require_betas(&self, n: usize) -> Result<&'a [f64]> {
        match self.betas {
            Some(b) if b.len() == n => Ok(b),
            Some(b) => Err(BacktestError::InvalidInput(format!(
                "expected {} betas, got {}",
                n,
                b.len()
            ))),
            None => Err(BacktestError::InvalidInput(
                "beta-neutral constraint requires betas".to_string(),
            )),
        }
    }

    pub(crate) fn require_forecasts(&self, n: usize) -> Result<(&'a [f64], &'a [Vec<f64>])> {
        match (self.expected_returns, self.covariance) {
            (Some(mu), Some(cov)) if mu.len() == n && cov.len() == n => Ok((mu, cov)),
            _ => Err(BacktestError::InvalidInput(
                "tail-risk constraint requires expected returns and covariance".to_string(),
            )),
        }
    }
}

/// Ordered collection of active constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    num_assets: usize,
    constraints: Vec<Constraint>,
}

impl ConstraintSet {
    /// Build a set, rejecting duplicates, malformed parameters, and
    /// combinations that cannot admit a non-trivial portfolio.
    pub fn new(num_assets: usize, constraints: Vec<Constraint>) -> Result<Self> {
        if num_assets == 0 {
            return Err(BacktestError::InvalidInput(
                "constraint set needs at least one asset".to_string(),
            ));
        }

        let mut seen: Vec<ConstraintTag> = Vec::new();
        for c in &constraints {
            let tag = c.tag();
            if seen.contains(&tag) {
                return Err(BacktestError::ConfigError(format!(
                    "duplicate constraint: {}",
                    tag
                )));
            }
            seen.push(tag);
            validate_parameters(c, num_assets)?;
        }

        let set = Self {
            num_assets,
            constraints,
        };
        if let (true, Some(Constraint::Budget(b))) = (
            set.contains(ConstraintTag::DollarNeutral),
            set.get(ConstraintTag::Budget),
        ) {
            if *b != 0.0 {
                return Err(BacktestError::ConfigError(format!(
                    "budget {} contradicts dollar neutrality",
                    b
                )));
            }
        }
        set.check_static_feasibility()?;
        Ok(set)
    }

    /// Only the implicit fully-invested budget.
    pub fn unconstrained(num_assets: usize) -> Self {
        Self {
            num_assets,
            constraints: Vec::new(),
        }
    }

    /// Build from the `[constraints]` configuration section.
    pub fn from_settings(settings: &ConstraintSettings, num_assets: usize) -> Result<Self> {
        let mut constraints = Vec::new();
        if settings.dollar_neutral {
            constraints.push(Constraint::DollarNeutral);
        }
        if let Some(budget) = settings.budget {
            constraints.push(Constraint::Budget(budget));
        }
        if settings.beta_neutral {
            constraints.push(Constraint::BetaNeutral);
        }
        if settings.min_weight.is_some() || settings.max_weight.is_some() {
            constraints.push(Constraint::uniform_bounds(
                num_assets,
                settings.min_weight.unwrap_or(f64::NEG_INFINITY),
                settings.max_weight.unwrap_or(f64::INFINITY),
            ));
        }
        if let Some(cap) = settings.gross_exposure_cap {
            constraints.push(Constraint::GrossExposureCap(cap));
        }
        if let Some(threshold) = settings.tail_risk_threshold {
            constraints.push(Constraint::TailRiskCap {
                metric: settings.tail_risk_metric,
                confidence: settings.tail_risk_confidence,
                threshold,
            });
        }
        Self::new(num_assets, constraints)
    }

    pub fn num_assets(&self) -> usize {
        self.num_assets
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn contains(&self, tag: ConstraintTag) -> bool {
        self.constraints.iter().any(|c| c.tag() == tag)
    }

    pub fn get(&self, tag: ConstraintTag) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.tag() == tag)
    }

    /// Whether solving requires betas from the snapshot.
    pub fn needs_betas(&self) -> bool {
        self.contains(ConstraintTag::BetaNeutral)
    }

    /// Required net exposure `Σw` at unit scale.
    pub fn net_exposure_target(&self) -> f64 {
        if self.contains(ConstraintTag::DollarNeutral) {
            return 0.0;
        }
        match self.get(ConstraintTag::Budget) {
            Some(Constraint::Budget(b)) => *b,
            _ => DEFAULT_BUDGET,
        }
    }

    /// Tag reported for the net-exposure normalization.
    pub(crate) fn net_exposure_tag(&self) -> ConstraintTag {
        if self.contains(ConstraintTag::DollarNeutral) {
            ConstraintTag::DollarNeutral
        } else {
            ConstraintTag::Budget
        }
    }

    /// Per-asset bounds, infinite where unconstrained.
    pub fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        match self.get(ConstraintTag::BoundBox) {
            Some(Constraint::BoundBox { lower, upper }) => (lower.clone(), upper.clone()),
            _ => (
                vec![f64::NEG_INFINITY; self.num_assets],
                vec![f64::INFINITY; self.num_assets],
            ),
        }
    }

    /// Clip weights into the bound box.
    pub fn clip_to_bounds(&self, weights: &mut [f64]) {
        if let Some(Constraint::BoundBox { lower, upper }) = self.get(ConstraintTag::BoundBox) {
            for ((w, lo), hi) in weights.iter_mut().zip(lower).zip(upper) {
                *w = w.clamp(*lo, *hi);
            }
        }
    }

    /// Residual of every constraint (including the net-exposure
    /// normalization) for the given weights.
    pub fn apply(&self, weights: &[f64], snapshot: &MarketSnapshot) -> Result<Vec<ConstraintResidual>> {
        self.evaluate(weights, &ConstraintContext::from_snapshot(snapshot))
    }

    pub fn evaluate(&self, weights: &[f64], ctx: &ConstraintContext<'_>) -> Result<Vec<ConstraintResidual>> {
        let n = self.num_assets;
        if weights.len() != n {
            return Err(BacktestError::InvalidInput(format!(
                "expected {} weights, got {}",
                n,
                weights.len()
            )));
        }

        let net: f64 = weights.iter().sum();
        let mut residuals = Vec::with_capacity(self.constraints.len() + 1);
        if !self.contains(ConstraintTag::DollarNeutral) && !self.contains(ConstraintTag::Budget) {
            residuals.push(ConstraintResidual::equality(
                ConstraintTag::Budget,
                (net - DEFAULT_BUDGET).abs(),
            ));
        }

        for c in &self.constraints {
            let residual = match c {
                Constraint::DollarNeutral => ConstraintResidual::equality(c.tag(), net.abs()),
                Constraint::Budget(b) => ConstraintResidual::equality(c.tag(), (net - b).abs()),
                Constraint::BetaNeutral => {
                    let betas = ctx.require_betas(n)?;
                    ConstraintResidual::equality(c.tag(), dot(betas, weights).abs())
                }
                Constraint::BoundBox { lower, upper } => {
                    let excess: f64 = weights
                        .iter()
                        .zip(lower.iter().zip(upper))
                        .map(|(w, (lo, hi))| (w - hi).max(lo - w).max(0.0))
                        .sum();
                    ConstraintResidual {
                        tag: c.tag(),
                        residual: excess,
                        satisfied: excess <= 0.0,
                    }
                }
                Constraint::GrossExposureCap(cap) => {
                    let gross: f64 = weights.iter().map(|w| w.abs()).sum();
                    ConstraintResidual::equality(c.tag(), (gross - cap).max(0.0))
                }
                Constraint::TailRiskCap {
                    metric,
                    confidence,
                    threshold,
                } => {
                    let (mu, cov) = ctx.require_forecasts(n)?;
                    let risk = metric.evaluate(*confidence, weights, mu, cov);
                    ConstraintResidual::equality(c.tag(), (risk - threshold).max(0.0))
                }
            };
            residuals.push(residual);
        }
        Ok(residuals)
    }

    /// Residuals of the constraints that `weights` violate.
    pub fn violations(&self, weights: &[f64], ctx: &ConstraintContext<'_>) -> Result<Vec<ConstraintResidual>> {
        Ok(self
            .evaluate(weights, ctx)?
            .into_iter()
            .filter(|r| !r.satisfied)
            .collect())
    }

    /// Euclidean projection of `candidate` onto the feasible set, or `None`
    /// if the constraints have no common point.
    pub fn project(&self, candidate: &[f64], snapshot: &MarketSnapshot) -> Result<Option<Vec<f64>>> {
        self.project_with(candidate, &ConstraintContext::from_snapshot(snapshot))
    }

    pub fn project_with(&self, candidate: &[f64], ctx: &ConstraintContext<'_>) -> Result<Option<Vec<f64>>> {
        let n = self.num_assets;
        if candidate.len() != n || candidate.iter().any(|v| !v.is_finite()) {
            return Err(BacktestError::InvalidInput(
                "projection candidate must hold one finite weight per asset".to_string(),
            ));
        }

        let factor = if self.contains(ConstraintTag::TailRiskCap) {
            let (_, cov) = ctx.require_forecasts(n)?;
            Some(cholesky_psd(cov).map_err(|e| BacktestError::NumericalInstability {
                timestamp: None,
                detail: format!(
                    "covariance not positive semidefinite (pivot {} at {})",
                    e.pivot, e.index
                ),
            })?)
        } else {
            None
        };

        let objective = QuadraticObjective::projection(candidate);
        let outcome = problem::solve(&AllocationProblem {
            constraints: self,
            context: ctx,
            cholesky: factor.as_ref(),
            objective: &objective,
            previous: None,
            turnover_penalty: 0.0,
            mode: ProblemMode::Strict,
            max_iter: problem::DEFAULT_MAX_ITER,
        })?;

        Ok(match outcome {
            QpOutcome::Solved(mut weights) => {
                self.clip_to_bounds(&mut weights);
                Some(weights)
            }
            QpOutcome::Infeasible => None,
        })
    }

    fn check_static_feasibility(&self) -> Result<()> {
        let net = self.net_exposure_target();
        let net_tag = self.net_exposure_tag();
        let (lower, upper) = self.bounds();

        let infeasible = |tags: Vec<ConstraintTag>, residual: f64| BacktestError::InfeasibleConstraint {
            timestamp: None,
            residuals: tags
                .iter()
                .map(|&tag| ConstraintResidual {
                    tag,
                    residual,
                    satisfied: false,
                })
                .collect(),
            violated: tags,
        };

        if self.contains(ConstraintTag::BoundBox) {
            let min_net: f64 = lower.iter().sum();
            let max_net: f64 = upper.iter().sum();
            if min_net > net + EQUALITY_TOLERANCE {
                return Err(infeasible(vec![net_tag, ConstraintTag::BoundBox], min_net - net));
            }
            if max_net < net - EQUALITY_TOLERANCE {
                return Err(infeasible(vec![net_tag, ConstraintTag::BoundBox], net - max_net));
            }
            // With zero net exposure a non-zero portfolio needs a long leg and a short leg.
            if net == 0.0 {
                let can_long = upper.iter().any(|&u| u > 0.0);
                let can_short = lower.iter().any(|&l| l < 0.0);
                if !(can_long && can_short) {
                    return Err(infeasible(vec![net_tag, ConstraintTag::BoundBox], 0.0));
                }
            }
        }

        if let Some(Constraint::GrossExposureCap(cap)) = self.get(ConstraintTag::GrossExposureCap) {
            if *cap < net.abs() - EQUALITY_TOLERANCE {
                return Err(infeasible(
                    vec![net_tag, ConstraintTag::GrossExposureCap],
                    net.abs() - cap,
                ));
            }
            let forced: f64 = lower
                .iter()
                .zip(&upper)
                .map(|(lo, hi)| lo.max(-hi).max(0.0))
                .sum();
            if forced > cap + EQUALITY_TOLERANCE {
                return Err(infeasible(
                    vec![ConstraintTag::BoundBox, ConstraintTag::GrossExposureCap],
                    forced - cap,
                ));
            }
        }
        Ok(())
    }
}

fn validate_parameters(c: &Constraint, n: usize) -> Result<()> {
    match c {
        Constraint::DollarNeutral | Constraint::BetaNeutral => Ok(()),
        Constraint::Budget(b) => {
            if !b.is_finite() {
                return Err(BacktestError::ConfigError(format!("budget must be finite, got {}", b)));
            }
            Ok(())
        }
        Constraint::BoundBox { lower, upper } => {
            if lower.len() != n || upper.len() != n {
                return Err(BacktestError::ConfigError(format!(
                    "bound box needs {} lower and upper bounds, got {} and {}",
                    n,
                    lower.len(),
                    upper.len()
                )));
            }
            for (i, (lo, hi)) in lower.iter().zip(upper).enumerate() {
                if lo.is_nan() || hi.is_nan() || lo > hi {
                    return Err(BacktestError::ConfigError(format!(
                        "invalid bounds for asset {}: [{}, {}]",
                        i, lo, hi
                    )));
                }
            }
            Ok(())
        }
        Constraint::GrossExposureCap(cap) => {
            if !cap.is_finite() || *cap <= 0.0 {
                return Err(BacktestError::ConfigError(format!(
                    "gross exposure cap must be positive, got {}",
                    cap
                )));
            }
            Ok(())
        }
        Constraint::TailRiskCap {
            confidence,
            threshold,
            ..
        } => {
            if !(*confidence > 0.5 && *confidence < 1.0) {
                return Err(BacktestError::ConfigError(format!(
                    "tail risk confidence must be in (0.5, 1), got {}",
                    confidence
                )));
            }
            if !threshold.is_finite() {
                return Err(BacktestError::ConfigError(format!(
                    "tail risk threshold must be finite, got {}",
                    threshold
                )));
            }
            Ok(())
        }
    }
}

/// Turnover between two weight vectors, `Σ|new - prev|`.
pub fn turnover(previous: &[f64], new: &[f64]) -> f64 {
    previous.iter().zip(new).map(|(p, n)| (n - p).abs()).sum()
}
