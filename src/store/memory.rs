// src/store/memory.rs
//
// In-memory implementation of the persistence interfaces, plus scripted
// collaborator implementations. Backs the integration tests and any
// deployment that wants the core without a database. Structural updates
// are staged on copies and validated before being swapped in, so a bad
// changeset behaves like a rolled-back transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::AppError;
use crate::models::attempt::{Attempt, AttemptFilter, QuestionFraction, STATE_FINISHED};
use crate::models::regrade::RegradeRecord;
use crate::models::slot::{QuestionMeta, Section, Slot};
use crate::models::statistics::{AttemptSelection, CalculatedStatistics};
use crate::store::{
    AttemptStore, Gradebook, NewSection, QuestionEngine, ProgressReporter, QuizStore, StatsStore,
    StructureUpdate,
};

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    sections: Vec<Section>,
    questions: HashMap<i64, QuestionMeta>,
    attempts: Vec<Attempt>,
    fractions: Vec<QuestionFraction>,
    statistics: HashMap<String, CalculatedStatistics>,
    question_statistics: HashMap<String, Vec<i64>>,
    regrades: Vec<RegradeRecord>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn quiz_usages(&self, quiz_id: i64) -> HashSet<i64> {
        self.attempts
            .iter()
            .filter(|a| a.quiz_id == quiz_id)
            .map(|a| a.usage_id)
            .collect()
    }

    /// One sum-of-grades value per student, selected by policy, in
    /// stable (user id) order.
    fn selected_grades(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Vec<f64> {
        let mut by_user: BTreeMap<i64, Vec<&Attempt>> = BTreeMap::new();
        for attempt in &self.attempts {
            if attempt.quiz_id != quiz_id || attempt.state != STATE_FINISHED {
                continue;
            }
            if let Some(list) = students {
                if !list.contains(&attempt.user_id) {
                    continue;
                }
            }
            by_user.entry(attempt.user_id).or_default().push(attempt);
        }

        by_user
            .values()
            .filter_map(|attempts| {
                let grade = |a: &&Attempt| a.sum_grades.unwrap_or(0.0);
                match policy {
                    AttemptSelection::First => attempts
                        .iter()
                        .min_by_key(|a| a.attempt_number)
                        .map(grade),
                    AttemptSelection::Last => attempts
                        .iter()
                        .max_by_key(|a| a.attempt_number)
                        .map(grade),
                    AttemptSelection::Highest => attempts
                        .iter()
                        .max_by(|a, b| grade(a).total_cmp(&grade(b)))
                        .map(grade),
                    AttemptSelection::Average => {
                        if attempts.is_empty() {
                            None
                        } else {
                            Some(
                                attempts.iter().map(grade).sum::<f64>() / attempts.len() as f64,
                            )
                        }
                    }
                }
            })
            .collect()
    }

    /// The usage ids contributing under a policy. For `Average` every
    /// finished attempt contributes; otherwise the one chosen per user.
    fn selected_usages(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Vec<i64> {
        let mut by_user: BTreeMap<i64, Vec<&Attempt>> = BTreeMap::new();
        for attempt in &self.attempts {
            if attempt.quiz_id != quiz_id || attempt.state != STATE_FINISHED {
                continue;
            }
            if let Some(list) = students {
                if !list.contains(&attempt.user_id) {
                    continue;
                }
            }
            by_user.entry(attempt.user_id).or_default().push(attempt);
        }

        let mut usages = Vec::new();
        for attempts in by_user.values() {
            let grade = |a: &&Attempt| a.sum_grades.unwrap_or(0.0);
            match policy {
                AttemptSelection::First => {
                    if let Some(a) = attempts.iter().min_by_key(|a| a.attempt_number) {
                        usages.push(a.usage_id);
                    }
                }
                AttemptSelection::Last => {
                    if let Some(a) = attempts.iter().max_by_key(|a| a.attempt_number) {
                        usages.push(a.usage_id);
                    }
                }
                AttemptSelection::Highest => {
                    if let Some(a) = attempts.iter().max_by(|a, b| grade(a).total_cmp(&grade(b))) {
                        usages.push(a.usage_id);
                    }
                }
                AttemptSelection::Average => {
                    usages.extend(attempts.iter().map(|a| a.usage_id));
                }
            }
        }
        usages
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ---- seeding helpers ----

    pub fn add_quiz(&self) -> i64 {
        self.write().next_id()
    }

    pub fn add_question(&self, question_type: &str, length: i64, is_random: bool) -> i64 {
        let mut inner = self.write();
        let id = inner.next_id();
        inner.questions.insert(
            id,
            QuestionMeta {
                question_id: id,
                question_type: question_type.to_string(),
                length,
                is_random,
            },
        );
        id
    }

    /// Append a slot at the end of the quiz on the given page.
    pub fn add_slot(&self, quiz_id: i64, question_id: i64, page: i64, max_mark: f64) -> i64 {
        let mut inner = self.write();
        let id = inner.next_id();
        let slot_number = inner
            .slots
            .iter()
            .filter(|s| s.quiz_id == quiz_id)
            .count() as i64
            + 1;
        inner.slots.push(Slot {
            id,
            quiz_id,
            slot_number,
            question_id,
            page,
            max_mark,
            require_previous: false,
        });
        id
    }

    pub fn add_section(&self, quiz_id: i64, first_slot: i64, heading: &str) -> i64 {
        let mut inner = self.write();
        let id = inner.next_id();
        inner.sections.push(Section {
            id,
            quiz_id,
            first_slot,
            heading: heading.to_string(),
            shuffle_questions: false,
        });
        id
    }

    /// Seed a finished (or in-progress) attempt with recorded fractions.
    /// `sum_grades` is derived from the fractions and the quiz's slot
    /// marks. Returns (attempt_id, usage_id).
    pub fn add_attempt(
        &self,
        quiz_id: i64,
        user_id: i64,
        attempt_number: i64,
        state: &str,
        fractions: &[(i64, Option<f64>)],
    ) -> (i64, i64) {
        let mut inner = self.write();
        let id = inner.next_id();
        let usage_id = inner.next_id();

        let mut sum = 0.0;
        for (slot_number, fraction) in fractions {
            let max_mark = inner
                .slots
                .iter()
                .find(|s| s.quiz_id == quiz_id && s.slot_number == *slot_number)
                .map(|s| s.max_mark)
                .unwrap_or(1.0);
            inner.fractions.push(QuestionFraction {
                usage_id,
                slot: *slot_number,
                fraction: *fraction,
                max_mark,
            });
            sum += fraction.unwrap_or(0.0) * max_mark;
        }

        let finished = state == STATE_FINISHED;
        inner.attempts.push(Attempt {
            id,
            quiz_id,
            user_id,
            usage_id,
            attempt_number,
            state: state.to_string(),
            sum_grades: finished.then_some(sum),
            time_finish: finished.then(Utc::now),
        });
        (id, usage_id)
    }

    /// Seed a per-question statistics row sharing an aggregate hash.
    pub fn add_question_statistic(&self, hash: &str, slot: i64) {
        self.write()
            .question_statistics
            .entry(hash.to_string())
            .or_default()
            .push(slot);
    }

    // ---- inspection helpers for tests ----

    pub fn slots_of(&self, quiz_id: i64) -> Vec<Slot> {
        let inner = self.read();
        let mut slots: Vec<Slot> = inner
            .slots
            .iter()
            .filter(|s| s.quiz_id == quiz_id)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.slot_number);
        slots
    }

    pub fn sections_of(&self, quiz_id: i64) -> Vec<Section> {
        let inner = self.read();
        let mut sections: Vec<Section> = inner
            .sections
            .iter()
            .filter(|s| s.quiz_id == quiz_id)
            .cloned()
            .collect();
        sections.sort_by_key(|s| s.first_slot);
        sections
    }

    pub fn attempt(&self, attempt_id: i64) -> Option<Attempt> {
        self.read().attempts.iter().find(|a| a.id == attempt_id).cloned()
    }

    pub fn fraction(&self, usage_id: i64, slot: i64) -> Option<Option<f64>> {
        self.read()
            .fractions
            .iter()
            .find(|f| f.usage_id == usage_id && f.slot == slot)
            .map(|f| f.fraction)
    }

    pub fn usage_max_mark(&self, usage_id: i64, slot: i64) -> Option<f64> {
        self.read()
            .fractions
            .iter()
            .find(|f| f.usage_id == usage_id && f.slot == slot)
            .map(|f| f.max_mark)
    }

    pub fn has_question(&self, question_id: i64) -> bool {
        self.read().questions.contains_key(&question_id)
    }

    pub fn regrade_records(&self, quiz_id: i64) -> Vec<RegradeRecord> {
        let inner = self.read();
        let usages = inner.quiz_usages(quiz_id);
        let mut records: Vec<RegradeRecord> = inner
            .regrades
            .iter()
            .filter(|r| usages.contains(&r.usage_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.usage_id, r.slot));
        records
    }

    pub fn statistics_count_for_quiz(&self, quiz_id: i64) -> usize {
        self.read()
            .statistics
            .values()
            .filter(|s| s.quiz_id == quiz_id)
            .count()
    }

    pub fn question_statistics_count(&self, hash: &str) -> usize {
        self.read()
            .question_statistics
            .get(hash)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl QuizStore for MemoryStore {
    async fn load_slots(&self, quiz_id: i64) -> Result<Vec<Slot>, AppError> {
        Ok(self.slots_of(quiz_id))
    }

    async fn load_sections(&self, quiz_id: i64) -> Result<Vec<Section>, AppError> {
        Ok(self.sections_of(quiz_id))
    }

    async fn load_question_meta(
        &self,
        question_ids: &[i64],
    ) -> Result<Vec<QuestionMeta>, AppError> {
        let inner = self.read();
        Ok(question_ids
            .iter()
            .filter_map(|id| inner.questions.get(id).cloned())
            .collect())
    }

    async fn has_attempts(&self, quiz_id: i64) -> Result<bool, AppError> {
        Ok(self.read().attempts.iter().any(|a| a.quiz_id == quiz_id))
    }

    async fn apply_structure_update(
        &self,
        quiz_id: i64,
        update: StructureUpdate,
    ) -> Result<(), AppError> {
        let mut inner = self.write();

        // Stage the quiz's rows, apply everything, validate, then swap.
        let mut slots: Vec<Slot> = inner
            .slots
            .iter()
            .filter(|s| s.quiz_id == quiz_id)
            .cloned()
            .collect();
        let mut sections: Vec<Section> = inner
            .sections
            .iter()
            .filter(|s| s.quiz_id == quiz_id)
            .cloned()
            .collect();

        slots.retain(|s| !update.delete_slots.contains(&s.id));
        sections.retain(|s| !update.delete_sections.contains(&s.id));
        for entry in &update.renumber {
            if let Some(slot) = slots.iter_mut().find(|s| s.id == entry.slot_id) {
                slot.slot_number = entry.new_number;
            }
        }
        for entry in &update.pages {
            if let Some(slot) = slots.iter_mut().find(|s| s.id == entry.slot_id) {
                slot.page = entry.new_page;
            }
        }
        for entry in &update.section_moves {
            if let Some(section) = sections.iter_mut().find(|s| s.id == entry.section_id) {
                section.first_slot = entry.new_first_slot;
            }
        }

        slots.sort_by_key(|s| s.slot_number);
        sections.sort_by_key(|s| s.first_slot);

        // Constraint check standing in for the database's: a violating
        // update is rejected wholesale, like a rolled-back transaction.
        for (index, slot) in slots.iter().enumerate() {
            if slot.slot_number != index as i64 + 1 {
                return Err(AppError::InternalServerError(
                    "structure update breaks slot numbering; rolled back".to_string(),
                ));
            }
            if index > 0 && slot.page < slots[index - 1].page {
                return Err(AppError::InternalServerError(
                    "structure update breaks page ordering; rolled back".to_string(),
                ));
            }
        }
        if !slots.is_empty() {
            if sections.is_empty() || sections[0].first_slot != 1 {
                return Err(AppError::InternalServerError(
                    "structure update breaks section start; rolled back".to_string(),
                ));
            }
            for (index, section) in sections.iter().enumerate() {
                if section.first_slot > slots.len() as i64
                    || (index > 0 && section.first_slot <= sections[index - 1].first_slot)
                {
                    return Err(AppError::InternalServerError(
                        "structure update breaks section ranges; rolled back".to_string(),
                    ));
                }
            }
        }

        inner.slots.retain(|s| s.quiz_id != quiz_id);
        inner.slots.extend(slots);
        inner.sections.retain(|s| s.quiz_id != quiz_id);
        inner.sections.extend(sections);
        for question_id in &update.delete_questions {
            inner.questions.remove(question_id);
        }
        Ok(())
    }

    async fn insert_section(&self, section: NewSection) -> Result<i64, AppError> {
        let mut inner = self.write();
        if inner
            .sections
            .iter()
            .any(|s| s.quiz_id == section.quiz_id && s.first_slot == section.first_slot)
        {
            return Err(AppError::Conflict(
                "A section already starts at this slot".to_string(),
            ));
        }
        let id = inner.next_id();
        inner.sections.push(Section {
            id,
            quiz_id: section.quiz_id,
            first_slot: section.first_slot,
            heading: section.heading,
            shuffle_questions: section.shuffle_questions,
        });
        Ok(id)
    }

    async fn update_section_heading(
        &self,
        section_id: i64,
        heading: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.write();
        let section = inner
            .sections
            .iter_mut()
            .find(|s| s.id == section_id)
            .ok_or_else(|| AppError::NotFound("Section not found".to_string()))?;
        section.heading = heading.to_string();
        Ok(())
    }

    async fn update_section_shuffle(
        &self,
        section_id: i64,
        shuffle: bool,
    ) -> Result<(), AppError> {
        let mut inner = self.write();
        let section = inner
            .sections
            .iter_mut()
            .find(|s| s.id == section_id)
            .ok_or_else(|| AppError::NotFound("Section not found".to_string()))?;
        section.shuffle_questions = shuffle;
        Ok(())
    }

    async fn update_slot_max_mark(&self, slot_id: i64, max_mark: f64) -> Result<(), AppError> {
        let mut inner = self.write();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.id == slot_id)
            .ok_or_else(|| AppError::NotFound("Slot not found".to_string()))?;
        slot.max_mark = max_mark;
        Ok(())
    }

    async fn update_slot_require_previous(
        &self,
        slot_id: i64,
        require_previous: bool,
    ) -> Result<(), AppError> {
        let mut inner = self.write();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.id == slot_id)
            .ok_or_else(|| AppError::NotFound("Slot not found".to_string()))?;
        slot.require_previous = require_previous;
        Ok(())
    }

    async fn is_orphan_random_question(
        &self,
        question_id: i64,
        excluding_slot: i64,
    ) -> Result<bool, AppError> {
        let inner = self.read();
        let Some(question) = inner.questions.get(&question_id) else {
            return Ok(false);
        };
        if !question.is_random {
            return Ok(false);
        }
        Ok(!inner
            .slots
            .iter()
            .any(|s| s.question_id == question_id && s.id != excluding_slot))
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn grade_count_and_mean(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<(i64, Option<f64>), AppError> {
        let grades = self.read().selected_grades(quiz_id, policy, students);
        if grades.is_empty() {
            return Ok((0, None));
        }
        let mean = grades.iter().sum::<f64>() / grades.len() as f64;
        Ok((grades.len() as i64, Some(mean)))
    }

    async fn sum_of_grades(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<Vec<f64>, AppError> {
        Ok(self.read().selected_grades(quiz_id, policy, students))
    }

    async fn mark_variance_sum(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<Option<f64>, AppError> {
        let inner = self.read();
        let usages: HashSet<i64> = inner
            .selected_usages(quiz_id, policy, students)
            .into_iter()
            .collect();

        let mut by_slot: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for fraction in &inner.fractions {
            if usages.contains(&fraction.usage_id) {
                by_slot
                    .entry(fraction.slot)
                    .or_default()
                    .push(fraction.fraction.unwrap_or(0.0) * fraction.max_mark);
            }
        }

        let mut total = None;
        for marks in by_slot.values() {
            if marks.len() < 2 {
                continue;
            }
            let n = marks.len() as f64;
            let mean = marks.iter().sum::<f64>() / n;
            let variance = marks.iter().map(|m| (m - mean) * (m - mean)).sum::<f64>() / (n - 1.0);
            *total.get_or_insert(0.0) += variance;
        }
        Ok(total)
    }

    async fn attempts(
        &self,
        quiz_id: i64,
        filter: &AttemptFilter,
    ) -> Result<Vec<Attempt>, AppError> {
        let inner = self.read();
        let mut attempts: Vec<Attempt> = inner
            .attempts
            .iter()
            .filter(|a| a.quiz_id == quiz_id && a.state == STATE_FINISHED && filter.matches(a))
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.id);
        Ok(attempts)
    }

    async fn question_fractions(
        &self,
        usage_id: i64,
    ) -> Result<Vec<QuestionFraction>, AppError> {
        let inner = self.read();
        let mut fractions: Vec<QuestionFraction> = inner
            .fractions
            .iter()
            .filter(|f| f.usage_id == usage_id)
            .cloned()
            .collect();
        fractions.sort_by_key(|f| f.slot);
        Ok(fractions)
    }

    async fn apply_regrade(
        &self,
        attempt: &Attempt,
        records: &[RegradeRecord],
        new_sum_grades: Option<f64>,
    ) -> Result<(), AppError> {
        let mut inner = self.write();

        for record in records {
            inner
                .regrades
                .retain(|r| !(r.usage_id == record.usage_id && r.slot == record.slot));
            inner.regrades.push(record.clone());
        }

        if let Some(sum) = new_sum_grades {
            for record in records {
                if let Some(fraction) = inner
                    .fractions
                    .iter_mut()
                    .find(|f| f.usage_id == record.usage_id && f.slot == record.slot)
                {
                    fraction.fraction = record.new_fraction;
                }
            }
            if let Some(stored) = inner.attempts.iter_mut().find(|a| a.id == attempt.id) {
                stored.sum_grades = Some(sum);
            }
        }
        Ok(())
    }

    async fn clear_regrade_records(
        &self,
        quiz_id: i64,
        attempt_ids: Option<&[i64]>,
    ) -> Result<(), AppError> {
        let mut inner = self.write();
        let usages: HashSet<i64> = inner
            .attempts
            .iter()
            .filter(|a| {
                a.quiz_id == quiz_id
                    && attempt_ids.map_or(true, |ids| ids.contains(&a.id))
            })
            .map(|a| a.usage_id)
            .collect();
        inner.regrades.retain(|r| !usages.contains(&r.usage_id));
        Ok(())
    }

    async fn records_needing_regrade(
        &self,
        quiz_id: i64,
    ) -> Result<Vec<RegradeRecord>, AppError> {
        let inner = self.read();
        let usages = inner.quiz_usages(quiz_id);
        let mut records: Vec<RegradeRecord> = inner
            .regrades
            .iter()
            .filter(|r| !r.regraded && usages.contains(&r.usage_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.usage_id, r.slot));
        Ok(records)
    }

    async fn count_needing_regrade(&self, quiz_id: i64) -> Result<i64, AppError> {
        Ok(self.records_needing_regrade(quiz_id).await?.len() as i64)
    }

    async fn recompute_quiz_grades(&self, quiz_id: i64) -> Result<(), AppError> {
        let mut inner = self.write();
        let totals: HashMap<i64, f64> = {
            let usages = inner.quiz_usages(quiz_id);
            let mut totals: HashMap<i64, f64> = HashMap::new();
            for fraction in &inner.fractions {
                if usages.contains(&fraction.usage_id) {
                    *totals.entry(fraction.usage_id).or_insert(0.0) +=
                        fraction.fraction.unwrap_or(0.0) * fraction.max_mark;
                }
            }
            totals
        };
        for attempt in inner.attempts.iter_mut() {
            if attempt.quiz_id == quiz_id && attempt.state == STATE_FINISHED {
                attempt.sum_grades = Some(*totals.get(&attempt.usage_id).unwrap_or(&0.0));
            }
        }
        Ok(())
    }

    async fn set_usage_max_mark(
        &self,
        quiz_id: i64,
        slot_number: i64,
        max_mark: f64,
    ) -> Result<(), AppError> {
        let mut inner = self.write();
        let usages = inner.quiz_usages(quiz_id);
        for fraction in inner.fractions.iter_mut() {
            if fraction.slot == slot_number && usages.contains(&fraction.usage_id) {
                fraction.max_mark = max_mark;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn get_statistics(
        &self,
        hash: &str,
    ) -> Result<Option<CalculatedStatistics>, AppError> {
        Ok(self.read().statistics.get(hash).cloned())
    }

    async fn put_statistics(
        &self,
        hash: &str,
        stats: &CalculatedStatistics,
    ) -> Result<(), AppError> {
        self.write()
            .statistics
            .insert(hash.to_string(), stats.clone());
        Ok(())
    }

    async fn last_calculated_time(
        &self,
        hash: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, AppError> {
        Ok(self.read().statistics.get(hash).map(|s| s.time_modified))
    }

    async fn invalidate(&self, hash: &str) -> Result<(), AppError> {
        let mut inner = self.write();
        inner.statistics.remove(hash);
        inner.question_statistics.remove(hash);
        Ok(())
    }

    async fn invalidate_quiz(&self, quiz_id: i64) -> Result<(), AppError> {
        let mut inner = self.write();
        let hashes: Vec<String> = inner
            .statistics
            .iter()
            .filter(|(_, stats)| stats.quiz_id == quiz_id)
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in hashes {
            inner.statistics.remove(&hash);
            inner.question_statistics.remove(&hash);
        }
        Ok(())
    }
}

/// Question engine whose regrade outcomes are scripted per (usage, slot).
/// Unscripted pairs echo the currently recorded fraction, i.e. regrading
/// them changes nothing.
pub struct ScriptedQuestionEngine {
    store: Arc<MemoryStore>,
    results: RwLock<HashMap<(i64, i64), Option<f64>>>,
    failing: RwLock<HashSet<i64>>,
}

impl ScriptedQuestionEngine {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            results: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Script the fraction the next regrade of (usage, slot) produces.
    pub fn set_fraction(&self, usage_id: i64, slot: i64, fraction: Option<f64>) {
        self.results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((usage_id, slot), fraction);
    }

    /// Make every regrade of this usage fail, for batch-failure tests.
    pub fn fail_usage(&self, usage_id: i64) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(usage_id);
    }
}

#[async_trait]
impl QuestionEngine for ScriptedQuestionEngine {
    fn supports_require_previous(&self, question_type: &str) -> bool {
        !matches!(question_type, "description" | "missing")
    }

    fn can_analyze_responses(&self, question_type: &str) -> bool {
        matches!(
            question_type,
            "multichoice" | "truefalse" | "shortanswer" | "numerical" | "match"
        )
    }

    async fn regrade_question(
        &self,
        usage_id: i64,
        slot: i64,
    ) -> Result<Option<f64>, AppError> {
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&usage_id)
        {
            return Err(AppError::InternalServerError(format!(
                "question engine failed for usage {}",
                usage_id
            )));
        }
        if let Some(fraction) = self
            .results
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(usage_id, slot))
        {
            return Ok(*fraction);
        }
        Ok(self.store.fraction(usage_id, slot).flatten())
    }
}

/// Gradebook that records which quizzes were pushed to it.
#[derive(Default)]
pub struct RecordingGradebook {
    calls: Mutex<Vec<i64>>,
}

impl RecordingGradebook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Gradebook for RecordingGradebook {
    async fn update_quiz_grades(&self, quiz_id: i64) -> Result<(), AppError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(quiz_id);
        Ok(())
    }
}

/// Progress reporter that records its events as strings.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: String) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl ProgressReporter for RecordingProgress {
    fn start(&self, total: u64) {
        self.push(format!("start {}", total));
    }

    fn advance(&self, done: u64, total: u64, _message: &str) {
        self.push(format!("{}/{}", done, total));
    }

    fn finish(&self) {
        self.push("finish".to_string());
    }
}
