//! Conic problem assembly for clarabel.
//!
//! Problems have the form `min ½xᵀPx + qᵀx` subject to `Ax + s = b`,
//! `s ∈ K`, where `K` stacks a zero cone (equalities), a non-negative cone
//! (`Ax <= b`) and second-order cones. The first `n` variables are always the
//! asset weights; auxiliary variables follow.

use crate::constraints::{Constraint, ConstraintContext, ConstraintSet, ConstraintTag, DEFAULT_BUDGET};
use crate::error::{BacktestError, Result};
use crate::numeric::Matrix;

pub(crate) const DEFAULT_MAX_ITER: u32 = 200;

/// Quadratic objective `½wᵀPw + qᵀw` over the weight vector.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadraticObjective {
    pub p: Matrix,
    pub q: Vec<f64>,
}

impl QuadraticObjective {
    pub fn new(p: Matrix, q: Vec<f64>) -> Self {
        Self { p, q }
    }

    /// `½‖w - target‖²`, up to a constant.
    pub fn projection(target: &[f64]) -> Self {
        let n = target.len();
        let mut p = vec![vec![0.0; n]; n];
        for (i, row) in p.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            p,
            q: target.iter().map(|t| -t).collect(),
        }
    }

    pub fn value(&self, w: &[f64]) -> f64 {
        0.5 * crate::numeric::quad_form(&self.p, w) + crate::numeric::dot(&self.q, w)
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.q.iter().all(|v| v.is_finite()) && self.p.iter().flatten().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ProblemMode {
    Strict,
    /// Inequalities get non-negative slack charged at `penalty` per unit.
    /// Equalities and the sign restrictions implied by the bound box stay hard.
    Elastic { penalty: f64 },
}

pub(crate) struct AllocationProblem<'a> {
    pub constraints: &'a ConstraintSet,
    pub context: &'a ConstraintContext<'a>,
    /// Lower Cholesky factor of the covariance; required for tail-risk caps.
    pub cholesky: Option<&'a Matrix>,
    pub objective: &'a QuadraticObjective,
    pub previous: Option<&'a [f64]>,
    pub turnover_penalty: f64,
    pub mode: ProblemMode,
    pub max_iter: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QpOutcome {
    Solved(Vec<f64>),
    Infeasible,
}

/// One row of `Ax + s = b`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Row {
    pub coeffs: Vec<(usize, f64)>,
    pub rhs: f64,
}

impl Row {
    pub fn new(coeffs: Vec<(usize, f64)>, rhs: f64) -> Self {
        Self { coeffs, rhs }
    }
}

#[derive(Debug, Default)]
pub(crate) struct QpBuilder {
    num_vars: usize,
    p: Vec<(usize, usize, f64)>,
    q: Vec<f64>,
    zero: Vec<Row>,
    nonneg: Vec<Row>,
    soc: Vec<Vec<Row>>,
}

impl QpBuilder {
    pub fn new(num_vars: usize) -> Self {
        Self {
            num_vars,
            q: vec![0.0; num_vars],
            ..Default::default()
        }
    }

    /// Append `k` variables, returning the index of the first.
    pub fn add_vars(&mut self, k: usize) -> usize {
        let start = self.num_vars;
        self.num_vars += k;
        self.q.resize(self.num_vars, 0.0);
        start
    }

    /// Add a symmetric matrix to the leading block of `P`.
    pub fn add_quadratic(&mut self, m: &[Vec<f64>]) {
        for (i, row) in m.iter().enumerate() {
            for (j, &v) in row.iter().enumerate().skip(i) {
                if v != 0.0 {
                    self.p.push((i, j, v));
                }
            }
        }
    }

    pub fn add_linear(&mut self, index: usize, value: f64) {
        self.q[index] += value;
    }

    /// `coeffs · x = rhs`.
    pub fn equality(&mut self, coeffs: Vec<(usize, f64)>, rhs: f64) {
        self.zero.push(Row::new(coeffs, rhs));
    }

    /// `coeffs · x <= rhs`.
    pub fn less_equal(&mut self, coeffs: Vec<(usize, f64)>, rhs: f64) {
        self.nonneg.push(Row::new(coeffs, rhs));
    }

    /// `(b₀ - a₀·x, …, bₖ - aₖ·x)` in the second-order cone.
    pub fn second_order_cone(&mut self, rows: Vec<Row>) {
        if !rows.is_empty() {
            self.soc.push(rows);
        }
    }

    /// clarabel needs at least one constraint row; add the vacuous `0 <= 1`.
    fn ensure_rows(&mut self) {
        if self.zero.is_empty() && self.nonneg.is_empty() && self.soc.is_empty() {
            self.nonneg.push(Row::new(Vec::new(), 1.0));
        }
    }

    pub fn solve(mut self, max_iter: u32) -> Result<QpOutcome> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        self.ensure_rows();

        let n = self.num_vars;
        let p = csc_from_triplets(n, std::mem::take(&mut self.p));
        let p = CscMatrix::new(n, n, p.colptr, p.rowval, p.nzval);

        let mut triplets = Vec::new();
        let mut b = Vec::new();
        let mut cones = Vec::new();

        if !self.zero.is_empty() {
            push_rows(&self.zero, &mut triplets, &mut b);
            cones.push(ZeroConeT(self.zero.len()));
        }
        if !self.nonneg.is_empty() {
            push_rows(&self.nonneg, &mut triplets, &mut b);
            cones.push(NonnegativeConeT(self.nonneg.len()));
        }
        for block in &self.soc {
            push_rows(block, &mut triplets, &mut b);
            cones.push(SecondOrderConeT(block.len()));
        }

        let m = b.len();
        let a = csc_from_triplets(n, triplets);
        let a = CscMatrix::new(m, n, a.colptr, a.rowval, a.nzval);

        let settings = DefaultSettingsBuilder::default()
            .max_iter(max_iter)
            .verbose(false)
            .build()
            .map_err(|e| {
                BacktestError::OptimizationError(format!("Failed to build settings: {}", e))
            })?;

        let mut solver = DefaultSolver::new(&p, &self.q, &a, &b, &cones, settings).map_err(|e| {
            BacktestError::OptimizationError(format!("Failed to create solver: {:?}", e))
        })?;

        solver.solve();

        match solver.solution.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {
                Ok(QpOutcome::Solved(solver.solution.x.clone()))
            }
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                Ok(QpOutcome::Infeasible)
            }
            status => Err(BacktestError::OptimizationError(format!(
                "Optimization failed with status: {:?}",
                status
            ))),
        }
    }
}

fn push_rows(rows: &[Row], triplets: &mut Vec<(usize, usize, f64)>, b: &mut Vec<f64>) {
    for row in rows {
        let r = b.len();
        for &(col, v) in &row.coeffs {
            triplets.push((r, col, v));
        }
        b.push(row.rhs);
    }
}

/// Compressed sparse column parts.
struct Csc {
    colptr: Vec<usize>,
    rowval: Vec<usize>,
    nzval: Vec<f64>,
}

fn csc_from_triplets(n: usize, mut triplets: Vec<(usize, usize, f64)>) -> Csc {
    triplets.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

    let mut colptr = vec![0; n + 1];
    let mut rowval = Vec::with_capacity(triplets.len());
    let mut nzval: Vec<f64> = Vec::with_capacity(triplets.len());
    let mut last: Option<(usize, usize)> = None;

    for (r, c, v) in triplets {
        if last == Some((r, c)) {
            if let Some(acc) = nzval.last_mut() {
                *acc += v;
            }
            continue;
        }
        rowval.push(r);
        nzval.push(v);
        colptr[c + 1] += 1;
        last = Some((r, c));
    }
    for j in 0..n {
        colptr[j + 1] += colptr[j];
    }
    Csc {
        colptr,
        rowval,
        nzval,
    }
}

/// Dense rows of every equality constraint, net-exposure normalization
/// included.
pub(crate) fn equality_rows(
    set: &ConstraintSet,
    ctx: &ConstraintContext<'_>,
) -> Result<Vec<(ConstraintTag, Vec<f64>, f64)>> {
    let n = set.num_assets();
    let mut rows = Vec::new();
    if !set.contains(ConstraintTag::DollarNeutral) && !set.contains(ConstraintTag::Budget) {
        rows.push((ConstraintTag::Budget, vec![1.0; n], DEFAULT_BUDGET));
    }
    for c in set.constraints() {
        match c {
            Constraint::DollarNeutral => rows.push((c.tag(), vec![1.0; n], 0.0)),
            Constraint::Budget(b) => rows.push((c.tag(), vec![1.0; n], *b)),
            Constraint::BetaNeutral => {
                rows.push((c.tag(), ctx.require_betas(n)?.to_vec(), 0.0));
            }
            Constraint::BoundBox { .. }
            | Constraint::GrossExposureCap(_)
            | Constraint::TailRiskCap { .. } => {}
        }
    }
    Ok(rows)
}

/// Hard sign restrictions implied by the bound box: a lower bound at or
/// above zero forbids shorting, an upper bound at or below zero forbids
/// going long.
pub(crate) fn add_sign_restrictions(builder: &mut QpBuilder, lower: &[f64], upper: &[f64]) {
    for (i, (lo, hi)) in lower.iter().zip(upper).enumerate() {
        if *lo >= 0.0 {
            builder.less_equal(vec![(i, -1.0)], 0.0);
        }
        if *hi <= 0.0 {
            builder.less_equal(vec![(i, 1.0)], 0.0);
        }
    }
}

/// Solve an allocation problem. Only the weight block of the solution is
/// returned.
pub(crate) fn solve(problem: &AllocationProblem<'_>) -> Result<QpOutcome> {
    let set = problem.constraints;
    let ctx = problem.context;
    let n = set.num_assets();
    let elastic = match problem.mode {
        ProblemMode::Strict => None,
        ProblemMode::Elastic { penalty } => Some(penalty),
    };

    let mut qp = QpBuilder::new(n);
    qp.add_quadratic(&problem.objective.p);
    for (i, &v) in problem.objective.q.iter().enumerate() {
        qp.add_linear(i, v);
    }

    for (_, coeffs, rhs) in equality_rows(set, ctx)? {
        qp.equality(
            coeffs.iter().enumerate().filter(|(_, v)| **v != 0.0).map(|(i, v)| (i, *v)).collect(),
            rhs,
        );
    }

    // Minimum-turnover tie-break: d ≥ |w - w_prev|, charged linearly.
    if let Some(previous) = problem.previous {
        if problem.turnover_penalty > 0.0 {
            let d = qp.add_vars(n);
            for (i, prev) in previous.iter().enumerate() {
                qp.add_linear(d + i, problem.turnover_penalty);
                qp.less_equal(vec![(i, 1.0), (d + i, -1.0)], *prev);
                qp.less_equal(vec![(i, -1.0), (d + i, -1.0)], -prev);
            }
        }
    }

    for c in set.constraints() {
        match c {
            Constraint::DollarNeutral | Constraint::Budget(_) | Constraint::BetaNeutral => {}
            Constraint::BoundBox { lower, upper } => match elastic {
                None => {
                    for (i, (lo, hi)) in lower.iter().zip(upper).enumerate() {
                        if hi.is_finite() {
                            qp.less_equal(vec![(i, 1.0)], *hi);
                        }
                        if lo.is_finite() {
                            qp.less_equal(vec![(i, -1.0)], -lo);
                        }
                    }
                }
                Some(penalty) => {
                    add_sign_restrictions(&mut qp, lower, upper);
                    for (i, (lo, hi)) in lower.iter().zip(upper).enumerate() {
                        if hi.is_finite() {
                            let s = add_slack(&mut qp, penalty);
                            qp.less_equal(vec![(i, 1.0), (s, -1.0)], *hi);
                        }
                        if lo.is_finite() {
                            let s = add_slack(&mut qp, penalty);
                            qp.less_equal(vec![(i, -1.0), (s, -1.0)], -lo);
                        }
                    }
                }
            },
            Constraint::GrossExposureCap(cap) => {
                let g = qp.add_vars(n);
                for i in 0..n {
                    qp.less_equal(vec![(i, 1.0), (g + i, -1.0)], 0.0);
                    qp.less_equal(vec![(i, -1.0), (g + i, -1.0)], 0.0);
                }
                let mut total: Vec<(usize, f64)> = (0..n).map(|i| (g + i, 1.0)).collect();
                if let Some(penalty) = elastic {
                    total.push((add_slack(&mut qp, penalty), -1.0));
                }
                qp.less_equal(total, *cap);
            }
            Constraint::TailRiskCap {
                metric,
                confidence,
                threshold,
            } => {
                let (mu, _) = ctx.require_forecasts(n)?;
                let l = problem.cholesky.ok_or_else(|| {
                    BacktestError::InvalidInput(
                        "tail-risk constraint requires a covariance factor".to_string(),
                    )
                })?;
                let k = metric.multiplier(*confidence);

                // k‖Lᵀw‖ <= threshold + μᵀw (+ slack)
                let mut head: Vec<(usize, f64)> = mu
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| **m != 0.0)
                    .map(|(i, m)| (i, -m))
                    .collect();
                if let Some(penalty) = elastic {
                    head.push((add_slack(&mut qp, penalty), -1.0));
                }
                let mut rows = vec![Row::new(head, *threshold)];
                for j in 0..n {
                    let coeffs: Vec<(usize, f64)> = (j..n)
                        .filter(|&i| l[i][j] != 0.0)
                        .map(|i| (i, -k * l[i][j]))
                        .collect();
                    rows.push(Row::new(coeffs, 0.0));
                }
                qp.second_order_cone(rows);
            }
        }
    }

    Ok(match qp.solve(problem.max_iter)? {
        QpOutcome::Solved(mut x) => {
            x.truncate(n);
            QpOutcome::Solved(x)
        }
        QpOutcome::Infeasible => QpOutcome::Infeasible,
    })
}

fn add_slack(qp: &mut QpBuilder, penalty: f64) -> usize {
    let s = qp.add_vars(1);
    qp.add_linear(s, penalty);
    qp.less_equal(vec![(s, -1.0)], 0.0);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csc_merges_duplicates() {
        let csc = csc_from_triplets(2, vec![(1, 0, 1.0), (0, 0, 2.0), (1, 0, 0.5), (0, 1, 3.0)]);
        assert_eq!(csc.colptr, vec![0, 2, 3]);
        assert_eq!(csc.rowval, vec![0, 1, 0]);
        assert_eq!(csc.nzval, vec![2.0, 1.5, 3.0]);
    }

    #[test]
    fn test_csc_empty_columns() {
        let csc = csc_from_triplets(3, vec![(0, 2, 1.0)]);
        assert_eq!(csc.colptr, vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_builder_solves_box_qp() {
        // min ½(x - 2)² s.t. x <= 1
        let mut qp = QpBuilder::new(1);
        qp.add_quadratic(&[vec![1.0]]);
        qp.add_linear(0, -2.0);
        qp.less_equal(vec![(0, 1.0)], 1.0);
        match qp.solve(DEFAULT_MAX_ITER).unwrap() {
            QpOutcome::Solved(x) => assert!((x[0] - 1.0).abs() < 1e-6),
            QpOutcome::Infeasible => panic!("expected a solution"),
        }
    }

    #[test]
    fn test_builder_detects_infeasibility() {
        let mut qp = QpBuilder::new(1);
        qp.add_quadratic(&[vec![1.0]]);
        qp.less_equal(vec![(0, 1.0)], -1.0);
        qp.less_equal(vec![(0, -1.0)], -1.0);
        assert_eq!(qp.solve(DEFAULT_MAX_ITER).unwrap(), QpOutcome::Infeasible);
    }

    #[test]
    fn test_builder_second_order_cone() {
        // min -x - y s.t. ‖(x, y)‖ <= 1
        let mut qp = QpBuilder::new(2);
        qp.add_linear(0, -1.0);
        qp.add_linear(1, -1.0);
        qp.second_order_cone(vec![
            Row::new(Vec::new(), 1.0),
            Row::new(vec![(0, -1.0)], 0.0),
            Row::new(vec![(1, -1.0)], 0.0),
        ]);
        match qp.solve(DEFAULT_MAX_ITER).unwrap() {
            QpOutcome::Solved(x) => {
                let half = std::f64::consts::FRAC_1_SQRT_2;
                assert!((x[0] - half).abs() < 1e-5);
                assert!((x[1] - half).abs() < 1e-5);
            }
            QpOutcome::Infeasible => panic!("expected a solution"),
        }
    }
}
