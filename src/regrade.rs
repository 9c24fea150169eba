// src/regrade.rs

use std::collections::HashMap;

use chrono::Utc;

use crate::error::AppError;
use crate::models::attempt::{Attempt, AttemptFilter};
use crate::models::regrade::{RegradeOutcome, RegradeRecord};
use crate::structure::GRADE_EPSILON;
use crate::store::{AttemptStore, Gradebook, ProgressReporter, QuestionEngine, StatsStore};

/// Re-executes grading for selected attempts and keeps the regrade
/// ledger, aggregate grades, gradebook and statistics cache in step.
///
/// One attempt's regrade is atomic; a whole batch is not. An interrupted
/// batch leaves the finished attempts regraded and the rest untouched,
/// and is resumed by `regrade_attempts_needing`.
pub struct RegradeEngine<'a> {
    attempts: &'a dyn AttemptStore,
    stats: &'a dyn StatsStore,
    questions: &'a dyn QuestionEngine,
    gradebook: &'a dyn Gradebook,
    progress: &'a dyn ProgressReporter,
}

impl<'a> RegradeEngine<'a> {
    pub fn new(
        attempts: &'a dyn AttemptStore,
        stats: &'a dyn StatsStore,
        questions: &'a dyn QuestionEngine,
        gradebook: &'a dyn Gradebook,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            attempts,
            stats,
            questions,
            gradebook,
            progress,
        }
    }

    /// Regrade one attempt, optionally restricted to the given slots.
    ///
    /// Fraction deltas above 1e-7 produce ledger records; a dry run stops
    /// there, a real run also persists the new fractions and the
    /// recomputed attempt total. All writes for the attempt happen in one
    /// transaction. Returns the number of changed (usage, slot) pairs.
    pub async fn regrade_attempt(
        &self,
        attempt: &Attempt,
        dry_run: bool,
        slots: Option<&[i64]>,
    ) -> Result<u64, AppError> {
        let fractions = self.attempts.question_fractions(attempt.usage_id).await?;
        let now = Utc::now();

        let mut records = Vec::new();
        let mut new_sum = 0.0;
        for recorded in &fractions {
            let targeted = slots.map_or(true, |list| list.contains(&recorded.slot));
            if !targeted {
                new_sum += recorded.fraction.unwrap_or(0.0) * recorded.max_mark;
                continue;
            }

            let new_fraction = self
                .questions
                .regrade_question(attempt.usage_id, recorded.slot)
                .await?;

            if fraction_changed(recorded.fraction, new_fraction) {
                records.push(RegradeRecord {
                    usage_id: attempt.usage_id,
                    slot: recorded.slot,
                    old_fraction: recorded.fraction,
                    new_fraction,
                    regraded: !dry_run,
                    time_modified: now,
                });
                new_sum += new_fraction.unwrap_or(0.0) * recorded.max_mark;
            } else {
                new_sum += recorded.fraction.unwrap_or(0.0) * recorded.max_mark;
            }
        }

        if records.is_empty() {
            return Ok(0);
        }

        let changed = records.len() as u64;
        let new_sum_grades = if dry_run { None } else { Some(new_sum) };
        self.attempts
            .apply_regrade(attempt, &records, new_sum_grades)
            .await?;
        Ok(changed)
    }

    /// Regrade every finished attempt matching the filters.
    ///
    /// Clears previous ledger entries for the same scope first. The batch
    /// is best-effort: one attempt failing is logged, counted and
    /// skipped, and the batch moves on. Real runs finish by recomputing
    /// the quiz's grades, notifying the gradebook, and invalidating the
    /// cached statistics.
    pub async fn regrade_attempts(
        &self,
        quiz_id: i64,
        dry_run: bool,
        students: Option<Vec<i64>>,
        attempt_ids: Option<Vec<i64>>,
    ) -> Result<RegradeOutcome, AppError> {
        let scoped = students.is_some() || attempt_ids.is_some();
        let filter = AttemptFilter {
            students,
            attempt_ids,
        };
        let list = self.attempts.attempts(quiz_id, &filter).await?;

        let scope_ids: Option<Vec<i64>> = if scoped {
            Some(list.iter().map(|a| a.id).collect())
        } else {
            None
        };
        self.attempts
            .clear_regrade_records(quiz_id, scope_ids.as_deref())
            .await?;

        let outcome = self.run_batch(&list, dry_run, &HashMap::new()).await;

        if !dry_run && !list.is_empty() {
            self.finalize(quiz_id).await?;
        }
        Ok(outcome)
    }

    /// Regrade only the (usage, slot) pairs flagged by a previous dry
    /// run, for real, then update the overall grades.
    pub async fn regrade_attempts_needing(
        &self,
        quiz_id: i64,
        students: Option<Vec<i64>>,
    ) -> Result<RegradeOutcome, AppError> {
        let pending = self.attempts.records_needing_regrade(quiz_id).await?;
        if pending.is_empty() {
            return Ok(RegradeOutcome::default());
        }

        let mut slots_by_usage: HashMap<i64, Vec<i64>> = HashMap::new();
        for record in &pending {
            slots_by_usage
                .entry(record.usage_id)
                .or_default()
                .push(record.slot);
        }

        let filter = AttemptFilter {
            students,
            attempt_ids: None,
        };
        let list: Vec<Attempt> = self
            .attempts
            .attempts(quiz_id, &filter)
            .await?
            .into_iter()
            .filter(|a| slots_by_usage.contains_key(&a.usage_id))
            .collect();
        if list.is_empty() {
            return Ok(RegradeOutcome::default());
        }

        // The dry-run rows for these attempts are superseded by the real
        // records written below.
        let ids: Vec<i64> = list.iter().map(|a| a.id).collect();
        self.attempts
            .clear_regrade_records(quiz_id, Some(&ids))
            .await?;

        let outcome = self.run_batch(&list, false, &slots_by_usage).await;
        self.finalize(quiz_id).await?;
        Ok(outcome)
    }

    async fn run_batch(
        &self,
        list: &[Attempt],
        dry_run: bool,
        slots_by_usage: &HashMap<i64, Vec<i64>>,
    ) -> RegradeOutcome {
        let total = list.len() as u64;
        self.progress.start(total);

        let mut outcome = RegradeOutcome::default();
        for (index, attempt) in list.iter().enumerate() {
            let slots = slots_by_usage.get(&attempt.usage_id).map(|v| v.as_slice());
            match self.regrade_attempt(attempt, dry_run, slots).await {
                Ok(changed) => {
                    outcome.processed += 1;
                    outcome.changed += changed;
                }
                Err(err) => {
                    // Per-item try/continue: the failed attempt's
                    // transaction rolled back, the rest of the batch
                    // still runs.
                    outcome.failed += 1;
                    tracing::warn!("Regrade of attempt {} failed, skipping: {}", attempt.id, err);
                }
            }
            self.progress
                .advance(index as u64 + 1, total, &format!("attempt {}", attempt.id));
        }

        self.progress.finish();
        outcome
    }

    async fn finalize(&self, quiz_id: i64) -> Result<(), AppError> {
        self.attempts.recompute_quiz_grades(quiz_id).await?;
        self.gradebook.update_quiz_grades(quiz_id).await?;
        self.stats.invalidate_quiz(quiz_id).await?;
        Ok(())
    }
}

/// Whether a regraded fraction differs enough from the recorded one to
/// matter. Float round-trip noise below 1e-7 is not a change.
fn fraction_changed(old: Option<f64>, new: Option<f64>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => (a - b).abs() > GRADE_EPSILON,
        (None, None) => false,
        _ => true,
    }
}
