//! Parallel parameter sweeps.
//!
//! Every job builds its own engine and simulation, so jobs share nothing but
//! the read-only universe and snapshots.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::BacktestConfig;
use crate::engine::{BacktestResult, Engine};
use crate::error::Result;
use crate::types::{Asset, MarketSnapshot};

/// One configuration to run.
#[derive(Debug, Clone)]
pub struct SweepJob {
    pub label: String,
    pub config: BacktestConfig,
}

impl SweepJob {
    pub fn new(label: impl Into<String>, config: BacktestConfig) -> Self {
        Self {
            label: label.into(),
            config,
        }
    }
}

#[derive(Debug)]
pub struct SweepOutcome {
    pub label: String,
    pub result: Result<BacktestResult>,
}

/// Run every job over the same data. Outcomes come back in job order.
pub fn run_sweep(
    assets: &[Asset],
    snapshots: &[MarketSnapshot],
    jobs: Vec<SweepJob>,
    parallel: bool,
) -> Vec<SweepOutcome> {
    info!("Running sweep of {} jobs (parallel: {})", jobs.len(), parallel);

    let run_one = |job: SweepJob| {
        let result = Engine::new(job.config, assets.to_vec()).and_then(|engine| engine.run(snapshots));
        if let Err(e) = &result {
            warn!("Sweep job {} failed: {}", job.label, e);
        }
        SweepOutcome {
            label: job.label,
            result,
        }
    };

    if parallel {
        jobs.into_par_iter().map(run_one).collect()
    } else {
        jobs.into_iter().map(run_one).collect()
    }
}

/// Labels and final values of the jobs that completed, best first.
pub fn rank_by_final_value(outcomes: &[SweepOutcome]) -> Vec<(&str, f64)> {
    let mut ranked: Vec<(&str, f64)> = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok().map(|r| (o.label.as_str(), r.final_value())))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn data() -> (Vec<Asset>, Vec<MarketSnapshot>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cov = vec![vec![0.0004, 0.0001], vec![0.0001, 0.0002]];
        let snaps = (0..30)
            .map(|i| {
                let r = (i as f64 * 0.7).sin() * 0.01;
                MarketSnapshot::new(start + Duration::days(i), vec![r, -r * 0.5])
                    .with_forecasts(vec![0.0005, 0.0003], cov.clone())
            })
            .collect();
        (vec![Asset::new("A"), Asset::new("B")], snaps)
    }

    fn jobs() -> Vec<SweepJob> {
        [1usize, 5, 10]
            .iter()
            .map(|p| {
                let mut config = BacktestConfig::default();
                config.schedule.rebalance_period = *p;
                config.constraints.min_weight = Some(0.0);
                SweepJob::new(format!("period_{}", p), config)
            })
            .collect()
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (assets, snaps) = data();
        let parallel = run_sweep(&assets, &snaps, jobs(), true);
        let sequential = run_sweep(&assets, &snaps, jobs(), false);

        let labels: Vec<&str> = parallel.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["period_1", "period_5", "period_10"]);
        for (p, s) in parallel.iter().zip(&sequential) {
            let (p, s) = (p.result.as_ref().unwrap(), s.result.as_ref().unwrap());
            assert_eq!(p.curve_digest(), s.curve_digest());
        }
    }

    #[test]
    fn test_failed_job_is_reported() {
        let (assets, snaps) = data();
        let mut bad = BacktestConfig::default();
        bad.schedule.rebalance_period = 0;
        let mut all = jobs();
        all.push(SweepJob::new("bad", bad));

        let outcomes = run_sweep(&assets, &snaps, all, true);
        assert!(outcomes[3].result.is_err());
        assert_eq!(rank_by_final_value(&outcomes).len(), 3);
    }
}
