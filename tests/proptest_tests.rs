//! Property-based tests using proptest for invariant testing.
//!
//! These tests verify that:
//! 1. Projection onto a constraint set lands inside it
//! 2. The risk controller's scales stay in their configured ranges, and a
//!    deeper drawdown never buys more exposure
//! 3. Turnover is a non-negative distance
//! 4. Backtest equity curves keep their peak and drawdown invariants

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use mantis_rebalance::config::{BacktestConfig, ConstraintSettings};
use mantis_rebalance::constraints::{turnover, Constraint, ConstraintSet, ConstraintTag};
use mantis_rebalance::engine::Engine;
use mantis_rebalance::risk::{RiskConfig, RiskController, RiskState};
use mantis_rebalance::types::{Asset, MarketSnapshot};

fn weights_strategy(n: usize) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-2.0..2.0f64, n)
}

/// Per-period returns between -10% and +10%.
fn returns_strategy(periods: usize) -> impl Strategy<Value = Vec<Vec<f64>>> {
    prop::collection::vec(prop::collection::vec(-0.10..0.10f64, 3), periods)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    // ========================================================================
    // Risk Controller Properties
    // ========================================================================

    #[test]
    fn volatility_scale_stays_in_bounds(forecast in 0.0..5.0f64, target in 0.01..0.5f64) {
        let config = RiskConfig {
            target_vol: target,
            min_scale: 0.2,
            max_scale: 0.9,
            ..Default::default()
        };
        let scale = RiskController::new(config, 252.0).volatility_scale(forecast);
        prop_assert!((0.2..=0.9).contains(&scale), "scale {} out of bounds", scale);
    }

    #[test]
    fn drawdown_ramp_is_monotone(a in 0.0..1.0f64, b in 0.0..1.0f64) {
        let rc = RiskController::new(RiskConfig::default(), 252.0);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(rc.drawdown_ramp(hi) <= rc.drawdown_ramp(lo));
        prop_assert!(rc.drawdown_ramp(hi) >= RiskConfig::default().drawdown_floor_scale);
    }

    #[test]
    fn drawdown_factor_stays_in_range(path in prop::collection::vec(0.0..0.6f64, 1..50)) {
        let rc = RiskController::new(RiskConfig::default(), 252.0);
        let mut state = RiskState::default();
        for dd in path {
            rc.observe(&mut state, None, dd);
            prop_assert!(state.drawdown_factor >= 0.3 - 1e-12);
            prop_assert!(state.drawdown_factor <= 1.0);
        }
    }

    #[test]
    fn deeper_drawdown_never_raises_exposure(
        steps in prop::collection::vec((0.0..0.6f64, 0.0..0.3f64), 1..60),
        ex_ante in 0.001..0.05f64,
    ) {
        let rc = RiskController::new(RiskConfig::default(), 252.0);
        let mut shallow = RiskState::default();
        let mut deep = RiskState::default();
        for (dd, extra) in steps {
            rc.observe(&mut shallow, None, dd);
            rc.observe(&mut deep, None, (dd + extra).min(0.99));
            prop_assert!(deep.drawdown_factor <= shallow.drawdown_factor + 1e-12);
            let deep_scale = rc.exposure(&deep, ex_ante).scale;
            let shallow_scale = rc.exposure(&shallow, ex_ante).scale;
            prop_assert!(
                deep_scale <= shallow_scale + 1e-12,
                "deeper drawdown scale {} above {}", deep_scale, shallow_scale
            );
        }
    }

    // ========================================================================
    // Turnover Properties
    // ========================================================================

    #[test]
    fn turnover_is_a_distance(a in weights_strategy(5), b in weights_strategy(5)) {
        let t = turnover(&a, &b);
        prop_assert!(t >= 0.0);
        prop_assert!((t - turnover(&b, &a)).abs() < 1e-12);
        prop_assert_eq!(turnover(&a, &a), 0.0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // ========================================================================
    // Constraint Projection Properties
    // ========================================================================

    #[test]
    fn projection_satisfies_dollar_neutral_box(candidate in weights_strategy(4)) {
        let set = ConstraintSet::new(
            4,
            vec![Constraint::DollarNeutral, Constraint::uniform_bounds(4, -1.0, 1.0)],
        )
        .unwrap();
        let snapshot = MarketSnapshot::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(), vec![0.0; 4]);

        let projected = set.project(&candidate, &snapshot).unwrap().unwrap();
        let net: f64 = projected.iter().sum();
        prop_assert!(net.abs() < 1e-6, "net {}", net);
        prop_assert!(projected.iter().all(|w| (-1.0..=1.0).contains(w)));
        let residuals = set.apply(&projected, &snapshot).unwrap();
        prop_assert!(residuals.iter().all(|r| r.satisfied));
        prop_assert!(residuals.iter().any(|r| r.tag == ConstraintTag::DollarNeutral));
    }

    // ========================================================================
    // Backtest Engine Invariants
    // ========================================================================

    #[test]
    fn equity_curve_invariants(returns in returns_strategy(30), period in 1usize..10) {
        let mut config = BacktestConfig::default();
        config.schedule.rebalance_period = period;
        config.constraints = ConstraintSettings {
            min_weight: Some(0.0),
            max_weight: Some(0.6),
            ..Default::default()
        };
        let assets = vec![Asset::new("A"), Asset::new("B"), Asset::new("C")];
        let cov = vec![
            vec![0.0004, 0.0001, 0.0],
            vec![0.0001, 0.0003, 0.0],
            vec![0.0, 0.0, 0.0002],
        ];
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let snaps: Vec<MarketSnapshot> = returns
            .into_iter()
            .enumerate()
            .map(|(t, r)| {
                MarketSnapshot::new(start + Duration::days(t as i64), r)
                    .with_forecasts(vec![0.0005, 0.0004, 0.0003], cov.clone())
            })
            .collect();

        let result = Engine::new(config, assets).unwrap().run(&snaps).unwrap();
        let mut last_peak = result.initial_capital;
        for point in &result.equity_curve {
            prop_assert!(point.value > 0.0);
            prop_assert!(point.peak >= last_peak);
            prop_assert!(point.peak >= point.value);
            prop_assert!((0.0..1.0).contains(&point.drawdown));
            last_peak = point.peak;
        }
        for event in &result.events {
            prop_assert!(event.turnover >= 0.0);
            prop_assert!(event.cost >= 0.0);
            prop_assert!(event.exposure_scale > 0.0 && event.exposure_scale <= 1.0);
            prop_assert!(event.post_weights.iter().all(|w| *w >= 0.0 && *w <= 0.6 + 1e-9));
        }
        prop_assert!(result.summary.max_drawdown < 1.0);
    }
}
