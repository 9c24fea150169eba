// src/structure/edit.rs
//
// Mutation algorithms for the quiz structure. Every operation validates
// against the in-memory snapshot first, then emits one StructureUpdate
// changeset that the store applies atomically. Methods that can shift
// slot numbers, pages or section ranges consume `self`: the handle is
// stale once the store has changed underneath it.

use std::collections::HashSet;

use super::{GRADE_EPSILON, Structure, refresh_page_numbers};
use crate::error::AppError;
use crate::models::slot::{PageBreakAction, Slot};
use crate::store::{
    AttemptStore, NewSection, QuestionEngine, QuizStore, SectionMove, SlotPage, SlotRenumber,
    StructureUpdate,
};
use crate::utils::html::clean_html;

/// A candidate section boundary move. Tie-break moves are dropped rather
/// than applied when they would violate the section invariants.
#[derive(Debug, Clone, Copy)]
struct BoundaryShift {
    section_id: i64,
    new_first_slot: i64,
    tie_break: bool,
}

impl Structure {
    /// Move a slot to the position after `after_slot_id` (or to the very
    /// start), placing it on `page`.
    ///
    /// The whole edit (renumbering over the affected span, the moved
    /// slot's page, section boundary shifts, and the dense re-pack of
    /// page numbers) is computed up front and applied as one
    /// transaction. Consumes the handle; reload before further queries.
    pub async fn move_slot(
        self,
        store: &dyn QuizStore,
        moving_slot_id: i64,
        after_slot_id: Option<i64>,
        page: i64,
    ) -> Result<(), AppError> {
        self.ensure_editable()?;
        if page < 1 {
            return Err(AppError::BadRequest("Page numbers start at 1".to_string()));
        }

        let moving = self
            .slot_by_id(moving_slot_id)
            .ok_or_else(|| AppError::NotFound("Slot to move not found".to_string()))?
            .slot
            .clone();
        let moving_number = moving.slot_number;

        let mut after_number = match after_slot_id {
            None => 0,
            Some(id) => {
                self.slot_by_id(id)
                    .ok_or_else(|| AppError::NotFound("Target slot not found".to_string()))?
                    .slot
                    .slot_number
            }
        };

        // Moving a slot directly after itself means moving it after the
        // previous slot: same position, possibly a different page.
        if after_number == moving_number {
            after_number = moving_number - 1;
        }

        let last = self.slot_count();

        // Renumbering map over the affected span only.
        let mut renumber: Vec<SlotRenumber> = Vec::new();
        let new_number;
        if after_number > moving_number {
            // Moving down: everything between shifts up one place.
            new_number = after_number;
            for number in (moving_number + 1)..=after_number {
                renumber.push(SlotRenumber {
                    slot_id: self.slots[(number - 1) as usize].slot.id,
                    new_number: number - 1,
                });
            }
            renumber.push(SlotRenumber {
                slot_id: moving.id,
                new_number,
            });
        } else if after_number < moving_number - 1 {
            // Moving up: everything between shifts down one place.
            new_number = after_number + 1;
            for number in (after_number + 1)..moving_number {
                renumber.push(SlotRenumber {
                    slot_id: self.slots[(number - 1) as usize].slot.id,
                    new_number: number + 1,
                });
            }
            renumber.push(SlotRenumber {
                slot_id: moving.id,
                new_number,
            });
        } else {
            // Same relative position; only the page can change.
            new_number = moving_number;
        }

        // The destination page must lie between the pages of the slots
        // adjacent to the insertion point (pre-move pages: renumbering
        // never changes a slot's page).
        if after_number >= 1 && page < self.page_of(after_number) {
            return Err(AppError::PreconditionFailed(format!(
                "Page {} is before the page of the preceding slot",
                page
            )));
        }
        let mut following = after_number + 1;
        if following == moving_number {
            following += 1;
        }
        if following <= last && page > self.page_of(following) {
            return Err(AppError::PreconditionFailed(format!(
                "Page {} is after the page of the following slot",
                page
            )));
        }

        // A section cannot be emptied by moving its only slot away.
        let section_index = self.section_index_of(moving_number);
        if self.sections.len() > 1
            && self.section_slot_count(section_index) == 1
            && new_number != moving_number
        {
            return Err(AppError::PreconditionFailed(
                "Moving the only slot out of its section would leave it empty".to_string(),
            ));
        }

        let mut shifts = self.boundary_shifts(moving_number, new_number, page);
        if !self.boundaries_valid(&shifts) {
            shifts.retain(|s| !s.tie_break);
            if !self.boundaries_valid(&shifts) {
                return Err(AppError::InternalServerError(format!(
                    "move of slot {} would corrupt section boundaries",
                    moving_slot_id
                )));
            }
        }
        let section_moves: Vec<SectionMove> = shifts
            .iter()
            .map(|s| SectionMove {
                section_id: s.section_id,
                new_first_slot: s.new_first_slot,
            })
            .collect();

        // Project the move onto a copy of the slots, then re-pack the
        // page numbers densely. The diff against the loaded pages is what
        // gets written.
        let mut projected: Vec<Slot> = self.slots.iter().map(|s| s.slot.clone()).collect();
        for entry in &renumber {
            if let Some(slot) = projected.iter_mut().find(|s| s.id == entry.slot_id) {
                slot.slot_number = entry.new_number;
            }
        }
        if let Some(slot) = projected.iter_mut().find(|s| s.id == moving.id) {
            slot.page = page;
        }
        projected.sort_by_key(|s| s.slot_number);
        refresh_page_numbers(&mut projected);

        let mut pages: Vec<SlotPage> = Vec::new();
        for slot in &projected {
            let original = self
                .slot_by_id(slot.id)
                .map(|s| s.slot.page)
                .unwrap_or(slot.page);
            if slot.page != original {
                pages.push(SlotPage {
                    slot_id: slot.id,
                    new_page: slot.page,
                });
            }
        }

        let update = StructureUpdate {
            renumber,
            pages,
            section_moves,
            ..Default::default()
        };
        if update.is_empty() {
            return Ok(());
        }
        store.apply_structure_update(self.quiz_id, update).await
    }

    /// Section boundary shifts for a move from `moving_number` to
    /// `new_number` landing on `page`.
    ///
    /// Boundaries strictly inside the affected span follow their slot
    /// (±1). A boundary exactly at the insertion point is the tie-break:
    /// the heading is pulled over the moved slot iff the destination page
    /// equals the first page of the section after the insertion point,
    /// i.e. the slot visually lands inside that section.
    fn boundary_shifts(&self, moving_number: i64, new_number: i64, page: i64) -> Vec<BoundaryShift> {
        let mut shifts = Vec::new();
        let m = moving_number;
        let t = new_number;

        if t > m {
            for section in &self.sections {
                let f = section.first_slot;
                if f > m && f <= t {
                    shifts.push(BoundaryShift {
                        section_id: section.id,
                        new_first_slot: f - 1,
                        tie_break: false,
                    });
                } else if f == t + 1 && page == self.page_of(t + 1) {
                    // The moved slot lands on the following section's
                    // first page: the heading absorbs it.
                    shifts.push(BoundaryShift {
                        section_id: section.id,
                        new_first_slot: t,
                        tie_break: true,
                    });
                }
            }
        } else if t < m {
            for section in &self.sections {
                let f = section.first_slot;
                if f == t {
                    // The section that used to start here keeps its first
                    // slot only if the moved slot joins it (same page);
                    // otherwise the heading follows its original slot up.
                    if page != self.page_of(t) {
                        shifts.push(BoundaryShift {
                            section_id: section.id,
                            new_first_slot: t + 1,
                            tie_break: true,
                        });
                    }
                } else if f > t && f <= m {
                    shifts.push(BoundaryShift {
                        section_id: section.id,
                        new_first_slot: f + 1,
                        tie_break: false,
                    });
                }
            }
        } else {
            // Position unchanged: a page change can still hand the slot
            // to the neighbouring section when it crosses the boundary.
            for section in &self.sections {
                let f = section.first_slot;
                if f == m + 1 && page == self.page_of(m + 1) && page != self.page_of(m) {
                    shifts.push(BoundaryShift {
                        section_id: section.id,
                        new_first_slot: m,
                        tie_break: true,
                    });
                } else if f == m
                    && m > 1
                    && page == self.page_of(m - 1)
                    && page != self.page_of(m)
                {
                    shifts.push(BoundaryShift {
                        section_id: section.id,
                        new_first_slot: m + 1,
                        tie_break: true,
                    });
                }
            }
        }

        shifts
    }

    /// Check that applying the shifts keeps section boundaries strictly
    /// increasing, starting at 1, and inside the quiz.
    fn boundaries_valid(&self, shifts: &[BoundaryShift]) -> bool {
        let last = self.slot_count();
        let mut previous = 0;
        for section in &self.sections {
            let first = shifts
                .iter()
                .find(|s| s.section_id == section.id)
                .map(|s| s.new_first_slot)
                .unwrap_or(section.first_slot);
            if previous == 0 && first != 1 {
                return false;
            }
            if first <= previous || first > last {
                return false;
            }
            previous = first;
        }
        true
    }

    /// Delete the slot at `slot_number`, renumber everything after it
    /// down by one, shift later section boundaries, clean up an orphaned
    /// randomly-generated question, and re-pack pages. Atomic; consumes
    /// the handle.
    pub async fn remove_slot(
        self,
        store: &dyn QuizStore,
        slot_number: i64,
    ) -> Result<(), AppError> {
        self.ensure_editable()?;
        let removed = self
            .slot_by_number(slot_number)
            .ok_or_else(|| AppError::NotFound("Slot to remove not found".to_string()))?
            .slot
            .clone();

        let section_index = self.section_index_of(slot_number);
        if self.sections.len() > 1 && self.section_slot_count(section_index) == 1 {
            return Err(AppError::PreconditionFailed(
                "Cannot remove the last slot of a section".to_string(),
            ));
        }

        let mut update = StructureUpdate::default();
        update.delete_slots.push(removed.id);

        let last = self.slot_count();
        for number in (slot_number + 1)..=last {
            update.renumber.push(SlotRenumber {
                slot_id: self.slots[(number - 1) as usize].slot.id,
                new_number: number - 1,
            });
        }

        for section in &self.sections {
            if section.first_slot > slot_number {
                update.section_moves.push(SectionMove {
                    section_id: section.id,
                    new_first_slot: section.first_slot - 1,
                });
            }
        }

        if store
            .is_orphan_random_question(removed.question_id, removed.id)
            .await?
        {
            update.delete_questions.push(removed.question_id);
        }

        let mut projected: Vec<Slot> = self
            .slots
            .iter()
            .filter(|s| s.slot.id != removed.id)
            .map(|s| s.slot.clone())
            .collect();
        for entry in &update.renumber {
            if let Some(slot) = projected.iter_mut().find(|s| s.id == entry.slot_id) {
                slot.slot_number = entry.new_number;
            }
        }
        projected.sort_by_key(|s| s.slot_number);
        refresh_page_numbers(&mut projected);
        for slot in &projected {
            let original = self
                .slot_by_id(slot.id)
                .map(|s| s.slot.page)
                .unwrap_or(slot.page);
            if slot.page != original {
                update.pages.push(SlotPage {
                    slot_id: slot.id,
                    new_page: slot.page,
                });
            }
        }

        store.apply_structure_update(self.quiz_id, update).await
    }

    /// Change a slot's maximum mark.
    ///
    /// Returns false without touching the store when the new value is
    /// within 1e-7 of the old one, so a form round-trip never causes a
    /// write. Otherwise persists the mark and propagates it into every
    /// existing attempt's recorded usage at that slot.
    pub async fn update_slot_max_mark(
        &mut self,
        quiz_store: &dyn QuizStore,
        attempt_store: &dyn AttemptStore,
        slot_id: i64,
        max_mark: f64,
    ) -> Result<bool, AppError> {
        let index = self
            .slots
            .iter()
            .position(|s| s.slot.id == slot_id)
            .ok_or_else(|| AppError::NotFound("Slot not found".to_string()))?;

        if (self.slots[index].slot.max_mark - max_mark).abs() < GRADE_EPSILON {
            return Ok(false);
        }

        quiz_store.update_slot_max_mark(slot_id, max_mark).await?;
        attempt_store
            .set_usage_max_mark(self.quiz_id, self.slots[index].slot.slot_number, max_mark)
            .await?;
        self.slots[index].slot.max_mark = max_mark;
        Ok(true)
    }

    /// Make a slot attemptable only once the previous slot is complete
    /// (or lift that restriction).
    ///
    /// The dependency only makes sense when the previous slot's question
    /// can actually finish during the attempt, which is a capability of
    /// its question type.
    pub async fn set_require_previous(
        &mut self,
        store: &dyn QuizStore,
        questions: &dyn QuestionEngine,
        slot_id: i64,
        require_previous: bool,
    ) -> Result<bool, AppError> {
        let index = self
            .slots
            .iter()
            .position(|s| s.slot.id == slot_id)
            .ok_or_else(|| AppError::NotFound("Slot not found".to_string()))?;
        if index == 0 {
            return Err(AppError::PreconditionFailed(
                "The first slot has no previous slot to depend on".to_string(),
            ));
        }
        if require_previous
            && !questions.supports_require_previous(&self.slots[index - 1].question_type)
        {
            return Err(AppError::PreconditionFailed(
                "The previous question never finishes, so it cannot be depended on".to_string(),
            ));
        }

        if self.slots[index].slot.require_previous == require_previous {
            return Ok(false);
        }
        store
            .update_slot_require_previous(slot_id, require_previous)
            .await?;
        self.slots[index].slot.require_previous = require_previous;
        Ok(true)
    }

    /// Insert or remove the page break immediately after a slot, then
    /// renumber pages densely from 1. Returns the updated slot rows.
    pub async fn update_page_break(
        self,
        store: &dyn QuizStore,
        slot_id: i64,
        action: PageBreakAction,
    ) -> Result<Vec<Slot>, AppError> {
        self.ensure_editable()?;
        let slot_number = self
            .slot_by_id(slot_id)
            .ok_or_else(|| AppError::NotFound("Slot not found".to_string()))?
            .slot
            .slot_number;
        let last = self.slot_count();
        if slot_number >= last {
            return Err(AppError::BadRequest(
                "There is no page break after the last slot".to_string(),
            ));
        }

        if action == PageBreakAction::Remove
            && self
                .sections
                .iter()
                .any(|s| s.first_slot == slot_number + 1)
        {
            return Err(AppError::PreconditionFailed(
                "A section starts on the next page; its page break cannot be removed".to_string(),
            ));
        }

        // Work on the break set: slot numbers followed by a page break.
        let mut breaks: HashSet<i64> = HashSet::new();
        for number in 1..last {
            if self.page_of(number + 1) > self.page_of(number) {
                breaks.insert(number);
            }
        }
        match action {
            PageBreakAction::Add => breaks.insert(slot_number),
            PageBreakAction::Remove => breaks.remove(&slot_number),
        };

        let mut projected: Vec<Slot> = self.slots.iter().map(|s| s.slot.clone()).collect();
        let mut page = 1;
        for slot in projected.iter_mut() {
            slot.page = page;
            if breaks.contains(&slot.slot_number) {
                page += 1;
            }
        }

        let mut update = StructureUpdate::default();
        for slot in &projected {
            let original = self
                .slot_by_id(slot.id)
                .map(|s| s.slot.page)
                .unwrap_or(slot.page);
            if slot.page != original {
                update.pages.push(SlotPage {
                    slot_id: slot.id,
                    new_page: slot.page,
                });
            }
        }
        if !update.is_empty() {
            store.apply_structure_update(self.quiz_id, update).await?;
        }
        Ok(projected)
    }

    /// Add a section heading starting at the first slot of a page.
    /// Returns the new section's id.
    pub async fn add_section_heading(
        self,
        store: &dyn QuizStore,
        page: i64,
        heading: &str,
    ) -> Result<i64, AppError> {
        self.ensure_editable()?;
        let first_slot = self
            .first_slot_of_page(page)
            .ok_or_else(|| AppError::NotFound(format!("Quiz has no page {}", page)))?;
        if self.sections.iter().any(|s| s.first_slot == first_slot) {
            return Err(AppError::Conflict(
                "A section already starts at this page".to_string(),
            ));
        }

        store
            .insert_section(NewSection {
                quiz_id: self.quiz_id,
                first_slot,
                heading: clean_html(heading),
                shuffle_questions: false,
            })
            .await
    }

    /// Update a section's heading text (sanitized).
    pub async fn set_section_heading(
        &mut self,
        store: &dyn QuizStore,
        section_id: i64,
        heading: &str,
    ) -> Result<(), AppError> {
        let index = self
            .sections
            .iter()
            .position(|s| s.id == section_id)
            .ok_or_else(|| AppError::NotFound("Section not found".to_string()))?;
        let heading = clean_html(heading);
        store.update_section_heading(section_id, &heading).await?;
        self.sections[index].heading = heading;
        Ok(())
    }

    pub async fn set_section_shuffle(
        &mut self,
        store: &dyn QuizStore,
        section_id: i64,
        shuffle: bool,
    ) -> Result<(), AppError> {
        let index = self
            .sections
            .iter()
            .position(|s| s.id == section_id)
            .ok_or_else(|| AppError::NotFound("Section not found".to_string()))?;
        store.update_section_shuffle(section_id, shuffle).await?;
        self.sections[index].shuffle_questions = shuffle;
        Ok(())
    }

    /// Remove a section heading; its slots merge into the previous
    /// section. The first section can never be removed.
    pub async fn remove_section_heading(
        self,
        store: &dyn QuizStore,
        section_id: i64,
    ) -> Result<(), AppError> {
        self.ensure_editable()?;
        let section = self
            .sections
            .iter()
            .find(|s| s.id == section_id)
            .ok_or_else(|| AppError::NotFound("Section not found".to_string()))?;
        if section.first_slot == 1 {
            return Err(AppError::PreconditionFailed(
                "The first section cannot be removed".to_string(),
            ));
        }

        let update = StructureUpdate {
            delete_sections: vec![section_id],
            ..Default::default()
        };
        store.apply_structure_update(self.quiz_id, update).await
    }

    /// Persist a dense re-pack of the page numbers. Useful for repairing
    /// page gaps left by external imports.
    pub async fn refresh_page_numbers_and_save(
        self,
        store: &dyn QuizStore,
    ) -> Result<Vec<Slot>, AppError> {
        let mut projected: Vec<Slot> = self.slots.iter().map(|s| s.slot.clone()).collect();
        refresh_page_numbers(&mut projected);

        let mut update = StructureUpdate::default();
        for slot in &projected {
            let original = self
                .slot_by_id(slot.id)
                .map(|s| s.slot.page)
                .unwrap_or(slot.page);
            if slot.page != original {
                update.pages.push(SlotPage {
                    slot_id: slot.id,
                    new_page: slot.page,
                });
            }
        }
        if !update.is_empty() {
            store.apply_structure_update(self.quiz_id, update).await?;
        }
        Ok(projected)
    }
}
