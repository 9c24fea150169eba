// src/models/regrade.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Represents the 'quiz_regrades' ledger: one row per (question usage,
/// slot) whose fraction changed during a regrade.
///
/// `regraded == false` marks a dry-run entry: the delta was observed but
/// not applied, and the pair is still waiting for a real regrade.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RegradeRecord {
    pub usage_id: i64,
    pub slot: i64,
    pub old_fraction: Option<f64>,
    pub new_fraction: Option<f64>,
    pub regraded: bool,
    pub time_modified: chrono::DateTime<chrono::Utc>,
}

/// Totals reported back to the caller after a regrade batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegradeOutcome {
    /// Attempts successfully regraded.
    pub processed: u64,
    /// Attempts whose regrade failed and was skipped.
    pub failed: u64,
    /// Total (usage, slot) pairs whose fraction changed.
    pub changed: u64,
}

/// DTO for starting a regrade batch.
#[derive(Debug, Deserialize)]
pub struct RegradeRequest {
    /// Preview score deltas without persisting new fractions.
    #[serde(default)]
    pub dry_run: bool,
    pub students: Option<Vec<i64>>,
    pub attempts: Option<Vec<i64>>,
}

/// DTO for regrading only the pairs flagged by a previous dry run.
#[derive(Debug, Deserialize)]
pub struct RegradeNeedingRequest {
    pub students: Option<Vec<i64>>,
}
