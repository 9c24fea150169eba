// src/models/slot.rs

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use validator::Validate;

/// Represents the 'quiz_slots' table in the database.
/// One row per question placement in a quiz.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Slot {
    pub id: i64,
    pub quiz_id: i64,

    /// 1-based position in the quiz. Dense: the slots of a quiz always
    /// cover 1..=N with no gaps or duplicates.
    #[sqlx(rename = "slot")]
    pub slot_number: i64,

    pub question_id: i64,

    /// 1-based page number, non-decreasing in slot order.
    pub page: i64,

    pub max_mark: f64,

    /// Whether this slot can only be attempted once the previous slot is
    /// complete. Only honoured for question types that support it.
    pub require_previous: bool,
}

/// Represents the 'quiz_sections' table: a named contiguous run of slots.
///
/// A section's extent is derived, not stored: it runs from `first_slot`
/// up to the slot before the next section's `first_slot` (or the last
/// slot of the quiz for the final section).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Section {
    pub id: i64,
    pub quiz_id: i64,
    pub first_slot: i64,
    pub heading: String,
    pub shuffle_questions: bool,
}

/// Minimal read-only question metadata joined into the structure.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuestionMeta {
    pub question_id: i64,

    #[sqlx(rename = "type")]
    pub question_type: String,

    /// Display length. 0 marks an informational item that gets the label
    /// "i" instead of a question number.
    pub length: i64,

    /// Randomly-generated questions are deleted when their last slot goes.
    pub is_random: bool,
}

/// Question type tag used for slots whose question row has gone missing.
pub const MISSING_QUESTION_TYPE: &str = "missing";

impl QuestionMeta {
    /// Placeholder metadata for a dangling question reference, so a broken
    /// quiz can still be loaded and repaired.
    pub fn missing(question_id: i64) -> Self {
        Self {
            question_id,
            question_type: MISSING_QUESTION_TYPE.to_string(),
            length: 1,
            is_random: false,
        }
    }
}

/// DTO for moving a slot to a new position.
#[derive(Debug, Deserialize, Validate)]
pub struct MoveSlotRequest {
    /// Slot id to insert after; omit to move to the very start.
    pub after_slot_id: Option<i64>,

    /// Destination page. Must lie within the page range allowed by the
    /// slots adjacent to the insertion point.
    #[validate(range(min = 1))]
    pub page: i64,
}

/// DTO for updating a slot's maximum mark.
#[derive(Debug, Deserialize, Validate)]
pub struct SetMaxMarkRequest {
    #[validate(range(min = 0.0))]
    pub max_mark: f64,
}

/// DTO for toggling a slot's dependency on the previous slot.
#[derive(Debug, Deserialize)]
pub struct RequirePreviousRequest {
    pub require_previous: bool,
}

/// Whether a page break after a slot is being inserted or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageBreakAction {
    Add,
    Remove,
}

/// DTO for inserting/removing a page break after a slot.
#[derive(Debug, Deserialize)]
pub struct PageBreakRequest {
    pub action: PageBreakAction,
}

/// DTO for adding a section heading at the start of a page.
#[derive(Debug, Deserialize, Validate)]
pub struct AddSectionRequest {
    #[validate(range(min = 1))]
    pub page: i64,
    #[validate(length(max = 1000))]
    pub heading: String,
}

/// DTO for updating an existing section.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateSectionRequest {
    #[validate(length(max = 1000))]
    pub heading: Option<String>,
    pub shuffle_questions: Option<bool>,
}
