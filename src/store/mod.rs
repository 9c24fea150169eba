// src/store/mod.rs

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::AppError;
use crate::models::attempt::{Attempt, AttemptFilter, QuestionFraction};
use crate::models::regrade::RegradeRecord;
use crate::models::slot::{QuestionMeta, Section, Slot};
use crate::models::statistics::{AttemptSelection, CalculatedStatistics};

/// A slot's new position within the quiz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRenumber {
    pub slot_id: i64,
    pub new_number: i64,
}

/// A slot's new page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPage {
    pub slot_id: i64,
    pub new_page: i64,
}

/// A section boundary's new first slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionMove {
    pub section_id: i64,
    pub new_first_slot: i64,
}

/// The all-or-nothing changeset produced by one structural edit.
///
/// Stores must apply every part within a single transaction: any failure
/// after partial writes rolls the whole update back. The structure
/// algorithms compute the complete changeset (including the dense
/// re-packing of page numbers) before the store is touched, so failed
/// validation never leaves a partial mutation behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructureUpdate {
    pub renumber: Vec<SlotRenumber>,
    pub pages: Vec<SlotPage>,
    pub section_moves: Vec<SectionMove>,
    pub delete_slots: Vec<i64>,
    pub delete_sections: Vec<i64>,
    /// Orphaned randomly-generated questions to clean up with their slot.
    pub delete_questions: Vec<i64>,
}

impl StructureUpdate {
    pub fn is_empty(&self) -> bool {
        self.renumber.is_empty()
            && self.pages.is_empty()
            && self.section_moves.is_empty()
            && self.delete_slots.is_empty()
            && self.delete_sections.is_empty()
            && self.delete_questions.is_empty()
    }
}

/// A new section row to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSection {
    pub quiz_id: i64,
    pub first_slot: i64,
    pub heading: String,
    pub shuffle_questions: bool,
}

/// Persistence for slots, sections and question metadata.
#[async_trait]
pub trait QuizStore: Send + Sync {
    /// All slots of a quiz, ordered by slot number.
    async fn load_slots(&self, quiz_id: i64) -> Result<Vec<Slot>, AppError>;

    /// All sections of a quiz, ordered by first slot.
    async fn load_sections(&self, quiz_id: i64) -> Result<Vec<Section>, AppError>;

    /// Metadata for the given questions. Missing rows are simply absent
    /// from the result; the caller synthesizes placeholders.
    async fn load_question_meta(
        &self,
        question_ids: &[i64],
    ) -> Result<Vec<QuestionMeta>, AppError>;

    /// Whether any attempts exist for the quiz. Attempts lock the
    /// structure against editing.
    async fn has_attempts(&self, quiz_id: i64) -> Result<bool, AppError>;

    /// Apply a structural changeset as one transaction.
    async fn apply_structure_update(
        &self,
        quiz_id: i64,
        update: StructureUpdate,
    ) -> Result<(), AppError>;

    async fn insert_section(&self, section: NewSection) -> Result<i64, AppError>;

    async fn update_section_heading(
        &self,
        section_id: i64,
        heading: &str,
    ) -> Result<(), AppError>;

    async fn update_section_shuffle(
        &self,
        section_id: i64,
        shuffle: bool,
    ) -> Result<(), AppError>;

    async fn update_slot_max_mark(&self, slot_id: i64, max_mark: f64) -> Result<(), AppError>;

    async fn update_slot_require_previous(
        &self,
        slot_id: i64,
        require_previous: bool,
    ) -> Result<(), AppError>;

    /// True when the question is randomly generated and no slot other than
    /// `excluding_slot` references it.
    async fn is_orphan_random_question(
        &self,
        question_id: i64,
        excluding_slot: i64,
    ) -> Result<bool, AppError>;
}

/// Persistence for attempts, their recorded fractions, and the regrade
/// ledger. Grade aggregates are exposed per selection policy so the
/// statistics calculator never has to know how attempts are grouped.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Count and mean of the sum-of-grades column for one policy.
    async fn grade_count_and_mean(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<(i64, Option<f64>), AppError>;

    /// The per-student sum-of-grades values selected by one policy.
    async fn sum_of_grades(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<Vec<f64>, AppError>;

    /// Sum over scored positions of the sample variance of the marks
    /// (fraction times max mark) earned at that position, for the
    /// attempts selected by one policy. Feeds the internal-consistency
    /// coefficient.
    async fn mark_variance_sum(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<Option<f64>, AppError>;

    /// Finished attempts of a quiz matching the filter.
    async fn attempts(
        &self,
        quiz_id: i64,
        filter: &AttemptFilter,
    ) -> Result<Vec<Attempt>, AppError>;

    /// Recorded fractions for one question usage, ordered by slot.
    async fn question_fractions(
        &self,
        usage_id: i64,
    ) -> Result<Vec<QuestionFraction>, AppError>;

    /// Persist the outcome of regrading one attempt as a single
    /// transaction: insert the ledger records (replacing any previous
    /// entry for the same (usage, slot)), and, when `new_sum_grades` is
    /// set (a real run), write the new fractions from the records and the
    /// recomputed attempt total.
    async fn apply_regrade(
        &self,
        attempt: &Attempt,
        records: &[RegradeRecord],
        new_sum_grades: Option<f64>,
    ) -> Result<(), AppError>;

    /// Delete ledger entries for a quiz, optionally narrowed to specific
    /// attempts.
    async fn clear_regrade_records(
        &self,
        quiz_id: i64,
        attempt_ids: Option<&[i64]>,
    ) -> Result<(), AppError>;

    /// Ledger entries still flagged `regraded = false` from a dry run.
    async fn records_needing_regrade(
        &self,
        quiz_id: i64,
    ) -> Result<Vec<RegradeRecord>, AppError>;

    async fn count_needing_regrade(&self, quiz_id: i64) -> Result<i64, AppError>;

    /// Re-derive every attempt's sum of grades from its recorded
    /// fractions after a real regrade.
    async fn recompute_quiz_grades(&self, quiz_id: i64) -> Result<(), AppError>;

    /// Propagate a changed slot mark into every existing attempt's usage
    /// at that slot, so past attempts are re-weighted consistently.
    async fn set_usage_max_mark(
        &self,
        quiz_id: i64,
        slot_number: i64,
        max_mark: f64,
    ) -> Result<(), AppError>;
}

/// Persistence for the statistics cache.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn get_statistics(
        &self,
        hash: &str,
    ) -> Result<Option<CalculatedStatistics>, AppError>;

    async fn put_statistics(
        &self,
        hash: &str,
        stats: &CalculatedStatistics,
    ) -> Result<(), AppError>;

    async fn last_calculated_time(
        &self,
        hash: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, AppError>;

    /// Delete the cached aggregate and any per-question statistics rows
    /// sharing the hash.
    async fn invalidate(&self, hash: &str) -> Result<(), AppError>;

    /// Delete every cached statistic of a quiz, whatever its selection
    /// hash. Used after a real regrade changes the contributing attempts.
    async fn invalidate_quiz(&self, quiz_id: i64) -> Result<(), AppError>;
}

/// Capability queries and regrading, implemented per question type by the
/// question engine collaborator.
#[async_trait]
pub trait QuestionEngine: Send + Sync {
    /// Can this question type be the target of a require-previous
    /// dependency (does it ever finish)?
    fn supports_require_previous(&self, question_type: &str) -> bool;

    /// Can responses to this question type be aggregated for analysis?
    fn can_analyze_responses(&self, question_type: &str) -> bool;

    /// Re-run grading for one slot of a question usage and report the new
    /// fraction (None when the response remains ungradable).
    async fn regrade_question(
        &self,
        usage_id: i64,
        slot: i64,
    ) -> Result<Option<f64>, AppError>;
}

/// Incremental progress reporting for long-running batches. A no-op
/// implementation is valid.
pub trait ProgressReporter: Send + Sync {
    fn start(&self, total: u64);
    fn advance(&self, done: u64, total: u64, message: &str);
    fn finish(&self);
}

/// Progress reporter that discards everything.
pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn start(&self, _total: u64) {}
    fn advance(&self, _done: u64, _total: u64, _message: &str) {}
    fn finish(&self) {}
}

/// Progress reporter that logs through tracing, for batches driven from
/// an HTTP handler.
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn start(&self, total: u64) {
        tracing::info!("Starting batch of {} attempts", total);
    }

    fn advance(&self, done: u64, total: u64, message: &str) {
        tracing::info!("{}/{} {}", done, total, message);
    }

    fn finish(&self) {
        tracing::info!("Batch finished");
    }
}

/// Question engine stand-in that reports the currently recorded fraction
/// unchanged. Wired into the HTTP surface until a real question engine
/// collaborator is registered; regrades through it never produce deltas.
pub struct StoredFractionEngine<'a> {
    attempts: &'a dyn AttemptStore,
}

impl<'a> StoredFractionEngine<'a> {
    pub fn new(attempts: &'a dyn AttemptStore) -> Self {
        Self { attempts }
    }
}

#[async_trait]
impl QuestionEngine for StoredFractionEngine<'_> {
    fn supports_require_previous(&self, question_type: &str) -> bool {
        !matches!(question_type, "description" | "missing")
    }

    fn can_analyze_responses(&self, question_type: &str) -> bool {
        !matches!(question_type, "description" | "essay" | "missing")
    }

    async fn regrade_question(
        &self,
        usage_id: i64,
        slot: i64,
    ) -> Result<Option<f64>, AppError> {
        let fractions = self.attempts.question_fractions(usage_id).await?;
        Ok(fractions
            .iter()
            .find(|f| f.slot == slot)
            .and_then(|f| f.fraction))
    }
}

/// Gradebook propagation, invoked after real (non-dry) regrades.
#[async_trait]
pub trait Gradebook: Send + Sync {
    async fn update_quiz_grades(&self, quiz_id: i64) -> Result<(), AppError>;
}

/// Gradebook sink that only logs. Stands in until an external gradebook
/// is wired up.
pub struct NullGradebook;

#[async_trait]
impl Gradebook for NullGradebook {
    async fn update_quiz_grades(&self, quiz_id: i64) -> Result<(), AppError> {
        tracing::debug!("Gradebook update requested for quiz {}", quiz_id);
        Ok(())
    }
}
