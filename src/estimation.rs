//! Forecast estimation from observed returns.
//!
//! Used when snapshots carry no forecasts. Estimators only ever see returns
//! up to and including the current period.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{BacktestError, Result};

/// Rolling window of per-period asset returns, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ReturnHistory {
    capacity: usize,
    rows: VecDeque<Vec<f64>>,
}

impl ReturnHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rows: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, returns: Vec<f64>) {
        if self.capacity == 0 {
            return;
        }
        if self.rows.len() == self.capacity {
            self.rows.pop_front();
        }
        self.rows.push_back(returns);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Vec<f64>> {
        self.rows.iter()
    }
}

/// Estimated expected returns and covariance, per period.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub expected_returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

/// Produces forecasts from past returns.
pub trait ForecastEstimator: Send + Sync {
    /// `None` until enough history has accumulated.
    fn estimate(&self, history: &ReturnHistory) -> Option<Forecast>;

    /// Observations required before `estimate` returns a value.
    fn warmup(&self) -> usize;

    fn name(&self) -> &str;
}

/// Equally weighted mean and covariance over the trailing window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleEstimator {
    window: usize,
}

impl SampleEstimator {
    pub fn new(window: usize) -> Result<Self> {
        check_window(window)?;
        Ok(Self { window })
    }
}

impl ForecastEstimator for SampleEstimator {
    fn estimate(&self, history: &ReturnHistory) -> Option<Forecast> {
        let rows = trailing(history, self.window)?;
        let weights = vec![1.0 / rows.len() as f64; rows.len()];
        Some(weighted_moments(&rows, &weights))
    }

    fn warmup(&self) -> usize {
        self.window
    }

    fn name(&self) -> &str {
        "Sample"
    }
}

/// Exponentially weighted mean and covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EwmaEstimator {
    half_life: f64,
    window: usize,
}

impl EwmaEstimator {
    pub fn new(half_life: f64, window: usize) -> Result<Self> {
        if !(half_life > 0.0 && half_life.is_finite()) {
            return Err(BacktestError::ConfigError(format!(
                "estimation half_life must be positive, got {}",
                half_life
            )));
        }
        check_window(window)?;
        Ok(Self { half_life, window })
    }
}

impl ForecastEstimator for EwmaEstimator {
    fn estimate(&self, history: &ReturnHistory) -> Option<Forecast> {
        let rows = trailing(history, self.window)?;
        let lambda = 0.5_f64.powf(1.0 / self.half_life);
        let last = rows.len() - 1;
        let raw: Vec<f64> = (0..rows.len()).map(|t| lambda.powi((last - t) as i32)).collect();
        let total: f64 = raw.iter().sum();
        let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
        Some(weighted_moments(&rows, &weights))
    }

    fn warmup(&self) -> usize {
        self.window
    }

    fn name(&self) -> &str {
        "EWMA"
    }
}

fn check_window(window: usize) -> Result<()> {
    if window < 2 {
        return Err(BacktestError::ConfigError(format!(
            "estimation window must be at least 2, got {}",
            window
        )));
    }
    Ok(())
}

/// The last `window` rows, once that many exist.
fn trailing(history: &ReturnHistory, window: usize) -> Option<Vec<&Vec<f64>>> {
    if window < 2 || history.len() < window {
        return None;
    }
    Some(history.rows().skip(history.len() - window).collect())
}

fn weighted_moments(rows: &[&Vec<f64>], weights: &[f64]) -> Forecast {
    let n = rows.first().map(|r| r.len()).unwrap_or(0);
    let mut mean = vec![0.0; n];
    for (row, w) in rows.iter().zip(weights) {
        for (m, r) in mean.iter_mut().zip(row.iter()) {
            *m += w * r;
        }
    }
    let mut cov = vec![vec![0.0; n]; n];
    for (row, w) in rows.iter().zip(weights) {
        for i in 0..n {
            let di = row[i] - mean[i];
            for j in i..n {
                cov[i][j] += w * di * (row[j] - mean[j]);
            }
        }
    }
    for i in 0..n {
        for j in 0..i {
            cov[i][j] = cov[j][i];
        }
    }
    Forecast {
        expected_returns: mean,
        covariance: cov,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Snapshots must carry forecasts.
    #[default]
    None,
    Sample,
    Ewma,
}

/// Estimator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationConfig {
    #[serde(default)]
    pub method: EstimationMethod,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_half_life")]
    pub half_life: f64,
}

fn default_window() -> usize { 60 }
fn default_half_life() -> f64 { 20.0 }

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            method: EstimationMethod::None,
            window: default_window(),
            half_life: default_half_life(),
        }
    }
}

impl EstimationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.method != EstimationMethod::None {
            check_window(self.window)?;
        }
        if !(self.half_life > 0.0 && self.half_life.is_finite()) {
            return Err(BacktestError::ConfigError(format!(
                "estimation half_life must be positive, got {}",
                self.half_life
            )));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<Option<Box<dyn ForecastEstimator>>> {
        Ok(match self.method {
            EstimationMethod::None => None,
            EstimationMethod::Sample => Some(Box::new(SampleEstimator::new(self.window)?)),
            EstimationMethod::Ewma => Some(Box::new(EwmaEstimator::new(self.half_life, self.window)?)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(rows: &[[f64; 2]]) -> ReturnHistory {
        let mut h = ReturnHistory::new(10);
        for r in rows {
            h.push(r.to_vec());
        }
        h
    }

    #[test]
    fn test_history_is_bounded() {
        let mut h = ReturnHistory::new(2);
        h.push(vec![1.0]);
        h.push(vec![2.0]);
        h.push(vec![3.0]);
        assert_eq!(h.len(), 2);
        assert_eq!(h.rows().next(), Some(&vec![2.0]));
    }

    #[test]
    fn test_sample_moments() {
        let h = history(&[[0.01, 0.02], [0.03, -0.02], [0.02, 0.00]]);
        let f = SampleEstimator::new(3).unwrap().estimate(&h).unwrap();
        assert!((f.expected_returns[0] - 0.02).abs() < 1e-15);
        assert!(f.expected_returns[1].abs() < 1e-15);
        // population variance of (0.01, 0.03, 0.02)
        assert!((f.covariance[0][0] - 0.0002 / 3.0).abs() < 1e-15);
        assert!((f.covariance[0][1] - f.covariance[1][0]).abs() < 1e-18);
        assert!(f.covariance[0][1] < 0.0);
    }

    #[test]
    fn test_warmup() {
        let h = history(&[[0.01, 0.02]]);
        assert!(SampleEstimator::new(3).unwrap().estimate(&h).is_none());
        assert!(EwmaEstimator::new(5.0, 3).unwrap().estimate(&h).is_none());
    }

    #[test]
    fn test_ewma_weights_recent_returns() {
        let h = history(&[[0.0, 0.0], [0.0, 0.0], [0.1, 0.1]]);
        let sample = SampleEstimator::new(3).unwrap().estimate(&h).unwrap();
        let ewma = EwmaEstimator::new(1.0, 3).unwrap().estimate(&h).unwrap();
        assert!(ewma.expected_returns[0] > sample.expected_returns[0]);
    }

    #[test]
    fn test_config_build() {
        assert!(EstimationConfig::default().build().unwrap().is_none());
        let config = EstimationConfig {
            method: EstimationMethod::Ewma,
            ..Default::default()
        };
        let est = config.build().unwrap().unwrap();
        assert_eq!(est.name(), "EWMA");
        assert_eq!(est.warmup(), 60);
    }

    #[test]
    fn test_invalid_estimators_rejected() {
        assert!(matches!(SampleEstimator::new(0), Err(BacktestError::ConfigError(_))));
        assert!(matches!(SampleEstimator::new(1), Err(BacktestError::ConfigError(_))));
        assert!(matches!(EwmaEstimator::new(5.0, 0), Err(BacktestError::ConfigError(_))));
        assert!(matches!(EwmaEstimator::new(0.0, 10), Err(BacktestError::ConfigError(_))));
        assert!(matches!(EwmaEstimator::new(f64::NAN, 10), Err(BacktestError::ConfigError(_))));
        assert_eq!(EwmaEstimator::new(5.0, 2).unwrap().warmup(), 2);
    }
}
