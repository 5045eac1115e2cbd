//! Error types for the rebalancing engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::constraints::{ConstraintResidual, ConstraintTag};
use crate::engine::BacktestResult;

/// Main error type for the rebalancing engine.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The equality constraints (together with the sign restrictions of the
    /// bound box) admit no solution.
    #[error("Infeasible constraints at {timestamp:?}: violated {violated:?}")]
    InfeasibleConstraint {
        timestamp: Option<DateTime<Utc>>,
        violated: Vec<ConstraintTag>,
        residuals: Vec<ConstraintResidual>,
    },

    #[error("Data gap at {timestamp} (step {step}): missing {missing:?}")]
    DataGap {
        step: usize,
        timestamp: DateTime<Utc>,
        missing: Vec<String>,
    },

    #[error("Numerical instability at {timestamp:?}: {detail}")]
    NumericalInstability {
        timestamp: Option<DateTime<Utc>>,
        detail: String,
    },

    #[error("Optimization error: {0}")]
    OptimizationError(String),

    #[error("Invalid scheduler transition: {0}")]
    InvalidTransition(String),

    #[error("Portfolio exhausted at {timestamp}: value {value}")]
    PortfolioExhausted { timestamp: DateTime<Utc>, value: f64 },

    /// A fatal error stopped the run; the partial result holds everything
    /// recorded up to the last valid state.
    #[error("Run aborted at step {step}: {source}")]
    RunAborted {
        step: usize,
        #[source]
        source: Box<BacktestError>,
        partial: Box<BacktestResult>,
    },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BacktestError {
    /// Attach a timestamp to errors raised below the engine, where the clock
    /// is not known.
    pub fn at(self, when: DateTime<Utc>) -> Self {
        match self {
            BacktestError::InfeasibleConstraint {
                timestamp: None,
                violated,
                residuals,
            } => BacktestError::InfeasibleConstraint {
                timestamp: Some(when),
                violated,
                residuals,
            },
            BacktestError::NumericalInstability {
                timestamp: None,
                detail,
            } => BacktestError::NumericalInstability {
                timestamp: Some(when),
                detail,
            },
            other => other,
        }
    }

    /// Partial result carried by an aborted run.
    pub fn partial_result(&self) -> Option<&BacktestResult> {
        match self {
            BacktestError::RunAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Innermost cause, unwrapping `RunAborted`.
    pub fn root_cause(&self) -> &BacktestError {
        match self {
            BacktestError::RunAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, BacktestError>;
