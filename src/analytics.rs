//! Performance analytics.
//!
//! Pure reductions of an equity curve (and the rebalance log) to summary
//! statistics.

use serde::{Deserialize, Serialize};

use crate::types::{EquityPoint, RebalanceEvent, SolverStatus, TriggerReason};

/// Drawdowns smaller than this count as none when computing MAR.
const MIN_DRAWDOWN: f64 = 1e-10;

/// Summary of a run's equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Points on the equity curve.
    pub periods: usize,
    /// Periods from the start of the run through the last point, including
    /// periods skipped for missing data. The CAGR horizon.
    pub elapsed_periods: usize,
    pub initial_value: f64,
    pub final_value: f64,
    pub total_return: f64,
    /// Compound annual growth rate.
    pub cagr: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Largest peak-to-trough loss, as a positive fraction.
    pub max_drawdown: f64,
    /// CAGR over max drawdown; 0 without a drawdown.
    pub mar_ratio: f64,
    pub benchmark: Option<BenchmarkMetrics>,
}

impl PerformanceSummary {
    /// Evaluate an equity curve that started from `initial_value`.
    ///
    /// `risk_free_rate` is annual; it is de-annualized per period as
    /// `risk_free_rate / periods_per_year`.
    pub fn from_equity_curve(
        curve: &[EquityPoint],
        initial_value: f64,
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> Self {
        let returns: Vec<f64> = curve.iter().map(|p| p.period_return).collect();
        let final_value = curve.last().map(|p| p.value).unwrap_or(initial_value);

        let benchmark = if !curve.is_empty() && curve.iter().all(|p| p.benchmark_return.is_some()) {
            let bench: Vec<f64> = curve.iter().filter_map(|p| p.benchmark_return).collect();
            BenchmarkMetrics::calculate(&returns, &bench, periods_per_year)
        } else {
            None
        };

        let max_drawdown = max_drawdown(curve);
        let elapsed_periods = curve.last().map_or(0, |p| p.step + 1);
        let cagr = cagr(initial_value, final_value, elapsed_periods, periods_per_year);
        Self {
            periods: curve.len(),
            elapsed_periods,
            initial_value,
            final_value,
            total_return: if initial_value > 0.0 {
                final_value / initial_value - 1.0
            } else {
                0.0
            },
            cagr,
            annualized_volatility: sample_std(&returns) * periods_per_year.sqrt(),
            sharpe_ratio: sharpe_ratio(&returns, periods_per_year, risk_free_rate),
            sortino_ratio: sortino_ratio(&returns, periods_per_year, risk_free_rate),
            max_drawdown,
            mar_ratio: mar_ratio(cagr, max_drawdown),
            benchmark,
        }
    }
}

/// `(V_end / V_start)^(periods_per_year / N) - 1`.
pub fn cagr(initial_value: f64, final_value: f64, periods: usize, periods_per_year: f64) -> f64 {
    if periods == 0 || initial_value <= 0.0 || final_value <= 0.0 {
        return 0.0;
    }
    (final_value / initial_value).powf(periods_per_year / periods as f64) - 1.0
}

/// Annualized Sharpe ratio with sample standard deviation; 0 when undefined.
pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64, risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let rf = risk_free_rate / periods_per_year;
    let excess = mean(returns) - rf;
    let std = sample_std(returns);
    if std < 1e-15 {
        return 0.0;
    }
    excess / std * periods_per_year.sqrt()
}

/// Annualized Sortino ratio using downside deviation below the per-period
/// risk-free rate.
pub fn sortino_ratio(returns: &[f64], periods_per_year: f64, risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let rf = risk_free_rate / periods_per_year;
    let downside = (returns
        .iter()
        .map(|r| (r - rf).min(0.0).powi(2))
        .sum::<f64>()
        / returns.len() as f64)
        .sqrt();
    if downside < 1e-15 {
        return 0.0;
    }
    (mean(returns) - rf) / downside * periods_per_year.sqrt()
}

pub fn max_drawdown(curve: &[EquityPoint]) -> f64 {
    curve.iter().map(|p| p.drawdown).fold(0.0, f64::max)
}

pub fn mar_ratio(cagr: f64, max_drawdown: f64) -> f64 {
    if max_drawdown.abs() < MIN_DRAWDOWN {
        0.0
    } else {
        cagr / max_drawdown.abs()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Comparison against a benchmark return series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    /// Sensitivity of portfolio returns to benchmark returns.
    pub beta: f64,
    pub correlation: f64,
    /// Annualized standard deviation of active returns.
    pub tracking_error: f64,
    /// Annualized mean active return over tracking error.
    pub information_ratio: f64,
    /// Annualized mean active return.
    pub excess_return: f64,
}

impl BenchmarkMetrics {
    /// Both series must be aligned and hold at least two observations.
    pub fn calculate(portfolio: &[f64], benchmark: &[f64], periods_per_year: f64) -> Option<Self> {
        if portfolio.len() < 2 || portfolio.len() != benchmark.len() {
            return None;
        }
        let pm = mean(portfolio);
        let bm = mean(benchmark);
        let n = (portfolio.len() - 1) as f64;
        let cov = portfolio
            .iter()
            .zip(benchmark)
            .map(|(p, b)| (p - pm) * (b - bm))
            .sum::<f64>()
            / n;
        let p_std = sample_std(portfolio);
        let b_std = sample_std(benchmark);

        let active: Vec<f64> = portfolio.iter().zip(benchmark).map(|(p, b)| p - b).collect();
        let tracking_error = sample_std(&active) * periods_per_year.sqrt();
        let excess_return = mean(&active) * periods_per_year;

        Some(Self {
            beta: if b_std > 0.0 { cov / (b_std * b_std) } else { 0.0 },
            correlation: if p_std > 0.0 && b_std > 0.0 {
                cov / (p_std * b_std)
            } else {
                0.0
            },
            tracking_error,
            information_ratio: if tracking_error > 1e-15 {
                excess_return / tracking_error
            } else {
                0.0
            },
            excess_return,
        })
    }
}

/// Aggregate of the rebalance log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TradingActivity {
    pub rebalances: usize,
    pub scheduled: usize,
    pub drift_triggered: usize,
    pub degraded: usize,
    pub total_turnover: f64,
    /// Sum of per-rebalance cost fractions.
    pub total_cost: f64,
    pub average_turnover: f64,
}

impl TradingActivity {
    pub fn from_events(events: &[RebalanceEvent]) -> Self {
        let total_turnover: f64 = events.iter().map(|e| e.turnover).sum();
        Self {
            rebalances: events.len(),
            scheduled: events.iter().filter(|e| e.reason == TriggerReason::Scheduled).count(),
            drift_triggered: events
                .iter()
                .filter(|e| e.reason == TriggerReason::DriftThreshold)
                .count(),
            degraded: events.iter().filter(|e| e.status == SolverStatus::Degraded).count(),
            total_turnover,
            total_cost: events.iter().map(|e| e.cost).sum(),
            average_turnover: if events.is_empty() {
                0.0
            } else {
                total_turnover / events.len() as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn curve(values: &[f64], initial: f64) -> Vec<EquityPoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut peak = initial;
        let mut prev = initial;
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                peak = f64::max(peak, v);
                let point = EquityPoint {
                    step: i,
                    timestamp: start + Duration::days(i as i64),
                    value: v,
                    peak,
                    drawdown: 1.0 - v / peak,
                    period_return: v / prev - 1.0,
                    benchmark_return: None,
                };
                prev = v;
                point
            })
            .collect()
    }

    #[test]
    fn test_cagr_doubling() {
        // Doubling over two years of 252 periods
        assert!((cagr(100.0, 200.0, 504, 252.0) - (2.0_f64.sqrt() - 1.0)).abs() < 1e-12);
        assert_eq!(cagr(100.0, 200.0, 0, 252.0), 0.0);
    }

    #[test]
    fn test_cagr_counts_skipped_periods() {
        // Four periods elapsed; the third was skipped for missing data.
        let mut c = curve(&[110.0, 121.0, 133.1], 100.0);
        c[2].step = 3;
        let s = PerformanceSummary::from_equity_curve(&c, 100.0, 4.0, 0.0);
        assert_eq!(s.periods, 3);
        assert_eq!(s.elapsed_periods, 4);
        assert!((s.cagr - 0.331).abs() < 1e-12);
    }

    #[test]
    fn test_max_drawdown_and_mar() {
        let c = curve(&[110.0, 121.0, 96.8, 130.0], 100.0);
        let s = PerformanceSummary::from_equity_curve(&c, 100.0, 4.0, 0.0);
        assert!((s.max_drawdown - 0.2).abs() < 1e-12);
        assert!((s.total_return - 0.3).abs() < 1e-12);
        assert!((s.cagr - 0.3).abs() < 1e-12);
        assert!((s.mar_ratio - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_mar_without_drawdown_is_zero() {
        let c = curve(&[101.0, 102.0, 103.0], 100.0);
        let s = PerformanceSummary::from_equity_curve(&c, 100.0, 252.0, 0.0);
        assert_eq!(s.max_drawdown, 0.0);
        assert_eq!(s.mar_ratio, 0.0);
    }

    #[test]
    fn test_sharpe_constant_returns_is_zero() {
        assert_eq!(sharpe_ratio(&[0.01, 0.01, 0.01], 252.0, 0.0), 0.0);
        assert_eq!(sharpe_ratio(&[0.01], 252.0, 0.0), 0.0);
    }

    #[test]
    fn test_sharpe_known_value() {
        let r = [0.01, -0.01, 0.02, 0.0];
        // mean 0.005, sample std sqrt(0.00025 / 3 * 2) ...
        let m = 0.005;
        let var = ((0.005f64).powi(2) + (0.015f64).powi(2) + (0.015f64).powi(2) + (0.005f64).powi(2)) / 3.0;
        let expected = m / var.sqrt() * 252.0_f64.sqrt();
        assert!((sharpe_ratio(&r, 252.0, 0.0) - expected).abs() < 1e-12);
        // Risk-free rate lowers it
        assert!(sharpe_ratio(&r, 252.0, 0.5) < expected);
    }

    #[test]
    fn test_sortino_ignores_upside() {
        let r = [0.02, -0.01, 0.03, -0.01];
        let s = sortino_ratio(&r, 252.0, 0.0);
        assert!(s > sharpe_ratio(&r, 252.0, 0.0));
    }

    #[test]
    fn test_benchmark_metrics() {
        let bench = [0.01, -0.02, 0.015, 0.005];
        let port: Vec<f64> = bench.iter().map(|b| 2.0 * b).collect();
        let m = BenchmarkMetrics::calculate(&port, &bench, 252.0).unwrap();
        assert!((m.beta - 2.0).abs() < 1e-12);
        assert!((m.correlation - 1.0).abs() < 1e-12);
        assert!(BenchmarkMetrics::calculate(&port[..1], &bench[..1], 252.0).is_none());
    }

    #[test]
    fn test_summary_includes_benchmark_when_complete() {
        let mut c = curve(&[101.0, 100.0, 102.0], 100.0);
        assert!(PerformanceSummary::from_equity_curve(&c, 100.0, 252.0, 0.0).benchmark.is_none());
        for p in &mut c {
            p.benchmark_return = Some(0.001);
        }
        assert!(PerformanceSummary::from_equity_curve(&c, 100.0, 252.0, 0.0).benchmark.is_some());
    }

    #[test]
    fn test_trading_activity() {
        assert_eq!(TradingActivity::from_events(&[]), TradingActivity::default());
    }
}
