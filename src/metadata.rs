//! Run metadata and reproducibility tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::types::EquityPoint;

/// Identity of a run.
///
/// The run id is a UUID v5 derived from the configuration hash, so identical
/// configurations share an id and any change to the configuration changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    /// SHA256 of the JSON-serialized configuration.
    pub config_hash: String,
    pub objective: String,
    pub cost_model: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RunMetadata {
    pub fn new<T: Serialize>(config: &T, objective: &str, cost_model: &str) -> Self {
        let config_hash = compute_config_hash(config);
        Self {
            run_id: run_id_for(&config_hash),
            config_hash,
            objective: objective.to_string(),
            cost_model: cost_model.to_string(),
            start: None,
            end: None,
        }
    }
}

/// Deterministic run id for a configuration hash.
pub fn run_id_for(config_hash: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, config_hash.as_bytes())
}

/// Compute SHA256 hash of arbitrary bytes.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    format!("{:x}", result)
}

/// Compute configuration hash from JSON serialization.
pub fn compute_config_hash<T: Serialize>(config: &T) -> String {
    match serde_json::to_vec(config) {
        Ok(bytes) => compute_hash(&bytes),
        Err(e) => {
            warn!("Failed to serialize config for hashing: {}", e);
            String::new()
        }
    }
}

/// SHA256 over the exact bits of an equity curve.
///
/// Two runs produced identical curves iff their digests match.
pub fn equity_curve_digest(curve: &[EquityPoint]) -> String {
    let mut hasher = Sha256::new();
    for point in curve {
        hasher.update((point.step as u64).to_le_bytes());
        hasher.update(point.timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(point.value.to_bits().to_le_bytes());
        hasher.update(point.drawdown.to_bits().to_le_bytes());
        hasher.update(point.period_return.to_bits().to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}
