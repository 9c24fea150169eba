// src/models/attempt.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Attempt states we care about. Only finished attempts feed statistics
/// and regrading.
pub const STATE_FINISHED: &str = "finished";
pub const STATE_IN_PROGRESS: &str = "inprogress";

/// Represents the 'quiz_attempts' table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Attempt {
    pub id: i64,
    pub quiz_id: i64,
    pub user_id: i64,

    /// Id of this attempt's question usage: the bundle of per-slot
    /// recorded responses and fractions.
    pub usage_id: i64,

    pub attempt_number: i64,
    pub state: String,
    pub sum_grades: Option<f64>,
    pub time_finish: Option<chrono::DateTime<chrono::Utc>>,
}

/// One recorded grading outcome: the fraction (0..1 share of `max_mark`)
/// a question usage earned at a slot. `fraction` is None while a response
/// is ungraded or absent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuestionFraction {
    pub usage_id: i64,
    pub slot: i64,
    pub fraction: Option<f64>,
    pub max_mark: f64,
}

/// Filter for selecting attempts for a regrade batch.
#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    /// Restrict to these user ids (a group/report filter).
    pub students: Option<Vec<i64>>,
    /// Restrict to these attempt ids.
    pub attempt_ids: Option<Vec<i64>>,
}

impl AttemptFilter {
    pub fn matches(&self, attempt: &Attempt) -> bool {
        if let Some(students) = &self.students {
            if !students.contains(&attempt.user_id) {
                return false;
            }
        }
        if let Some(ids) = &self.attempt_ids {
            if !ids.contains(&attempt.id) {
                return false;
            }
        }
        true
    }
}
