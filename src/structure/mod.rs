// src/structure/mod.rs

mod edit;

use serde::Serialize;
use std::collections::HashMap;

use crate::error::AppError;
use crate::models::slot::{QuestionMeta, Section, Slot};
use crate::store::QuizStore;

/// Marks within this tolerance of each other are considered equal, so
/// floating-point round-trip noise never causes spurious writes or
/// phantom regrade records.
pub const GRADE_EPSILON: f64 = 1e-7;

/// Display label for informational (zero-length) items.
const INFO_LABEL: &str = "i";

/// A slot joined with the question metadata the editor needs.
#[derive(Debug, Clone, Serialize)]
pub struct SlotWithMeta {
    #[serde(flatten)]
    pub slot: Slot,
    pub question_type: String,
    pub length: i64,

    /// Sequential number among scored slots; None for informational items.
    pub display_number: Option<i64>,
}

impl SlotWithMeta {
    /// What the student sees next to the question: a number, or "i" for
    /// an informational item.
    pub fn display_label(&self) -> String {
        match self.display_number {
            Some(n) => n.to_string(),
            None => INFO_LABEL.to_string(),
        }
    }
}

/// Serializable snapshot of a loaded structure.
#[derive(Debug, Serialize)]
pub struct StructureView {
    pub quiz_id: i64,
    pub can_be_edited: bool,
    pub slots: Vec<SlotWithMeta>,
    pub sections: Vec<Section>,
}

/// The full ordered collection of slots and sections for one quiz.
///
/// Lifecycle: `Loaded -> Stale`. Every method that changes slot order,
/// pages or section ranges takes `self` by value, so a mutated handle
/// cannot be queried again; callers reload after each structural edit.
/// Attribute updates that cannot shift ranges (`update_slot_max_mark`,
/// `set_section_heading`, `set_section_shuffle`) take `&mut self` and
/// keep the in-memory copy coherent.
#[derive(Debug)]
pub struct Structure {
    quiz_id: i64,
    /// Ordered by slot number: `slots[i]` has slot number `i + 1`.
    slots: Vec<SlotWithMeta>,
    /// Ordered by ascending first slot.
    sections: Vec<Section>,
    can_edit: bool,
}

impl Structure {
    /// Load the slots and sections of a quiz and verify the structural
    /// invariants.
    ///
    /// Slots whose question row is missing get placeholder metadata so a
    /// dangling reference never blocks loading. Display numbers are
    /// assigned here: scored slots (length > 0) are numbered sequentially,
    /// informational slots are labeled "i".
    pub async fn load(store: &dyn QuizStore, quiz_id: i64) -> Result<Structure, AppError> {
        let slots = store.load_slots(quiz_id).await?;
        let sections = store.load_sections(quiz_id).await?;

        for (index, slot) in slots.iter().enumerate() {
            if slot.slot_number != index as i64 + 1 {
                return Err(AppError::InternalServerError(format!(
                    "quiz {} slot numbers are not contiguous at position {}",
                    quiz_id,
                    index + 1
                )));
            }
            if index > 0 && slot.page < slots[index - 1].page {
                return Err(AppError::InternalServerError(format!(
                    "quiz {} page numbers decrease at slot {}",
                    quiz_id, slot.slot_number
                )));
            }
        }

        if !slots.is_empty() {
            if sections.is_empty() {
                return Err(AppError::InternalServerError(format!(
                    "quiz {} has slots but no sections",
                    quiz_id
                )));
            }
            if sections[0].first_slot != 1 {
                return Err(AppError::InternalServerError(format!(
                    "quiz {} first section does not start at slot 1",
                    quiz_id
                )));
            }
            let last = slots.len() as i64;
            for (index, section) in sections.iter().enumerate() {
                if section.first_slot < 1 || section.first_slot > last {
                    return Err(AppError::InternalServerError(format!(
                        "quiz {} section {} starts outside the quiz",
                        quiz_id, section.id
                    )));
                }
                if index > 0 && section.first_slot <= sections[index - 1].first_slot {
                    return Err(AppError::InternalServerError(format!(
                        "quiz {} sections overlap at section {}",
                        quiz_id, section.id
                    )));
                }
            }
        }

        let question_ids: Vec<i64> = slots.iter().map(|s| s.question_id).collect();
        let metas: HashMap<i64, QuestionMeta> = store
            .load_question_meta(&question_ids)
            .await?
            .into_iter()
            .map(|m| (m.question_id, m))
            .collect();

        let mut display_counter = 0;
        let slots = slots
            .into_iter()
            .map(|slot| {
                let meta = metas
                    .get(&slot.question_id)
                    .cloned()
                    .unwrap_or_else(|| QuestionMeta::missing(slot.question_id));
                let display_number = if meta.length > 0 {
                    display_counter += 1;
                    Some(display_counter)
                } else {
                    None
                };
                SlotWithMeta {
                    slot,
                    question_type: meta.question_type,
                    length: meta.length,
                    display_number,
                }
            })
            .collect();

        let can_edit = !store.has_attempts(quiz_id).await?;

        Ok(Structure {
            quiz_id,
            slots,
            sections,
            can_edit,
        })
    }

    pub fn quiz_id(&self) -> i64 {
        self.quiz_id
    }

    pub fn slots(&self) -> &[SlotWithMeta] {
        &self.slots
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// True iff no attempts exist yet for the quiz. Computed once at load.
    pub fn can_be_edited(&self) -> bool {
        self.can_edit
    }

    pub(crate) fn ensure_editable(&self) -> Result<(), AppError> {
        if self.can_edit {
            Ok(())
        } else {
            Err(AppError::PreconditionFailed(
                "The quiz structure cannot be edited because attempts exist".to_string(),
            ))
        }
    }

    pub fn slot_count(&self) -> i64 {
        self.slots.len() as i64
    }

    /// Number of scored positions (slots whose question has length > 0).
    pub fn scored_position_count(&self) -> i64 {
        self.slots.iter().filter(|s| s.length > 0).count() as i64
    }

    pub fn slot_by_id(&self, slot_id: i64) -> Option<&SlotWithMeta> {
        self.slots.iter().find(|s| s.slot.id == slot_id)
    }

    pub fn slot_by_number(&self, slot_number: i64) -> Option<&SlotWithMeta> {
        if slot_number < 1 || slot_number > self.slots.len() as i64 {
            return None;
        }
        Some(&self.slots[(slot_number - 1) as usize])
    }

    /// Page of the slot at a (valid) slot number. The dense-numbering
    /// invariant is verified at load, so direct indexing is safe.
    pub(crate) fn page_of(&self, slot_number: i64) -> i64 {
        self.slots[(slot_number - 1) as usize].slot.page
    }

    /// Index into `sections` of the section containing a slot number.
    pub(crate) fn section_index_of(&self, slot_number: i64) -> usize {
        let mut found = 0;
        for (index, section) in self.sections.iter().enumerate() {
            if section.first_slot <= slot_number {
                found = index;
            } else {
                break;
            }
        }
        found
    }

    pub fn section_of(&self, slot_number: i64) -> &Section {
        &self.sections[self.section_index_of(slot_number)]
    }

    /// Last slot number of a section: one before the next section's first
    /// slot, or the quiz's last slot for the final section.
    pub(crate) fn section_last_slot(&self, section_index: usize) -> i64 {
        match self.sections.get(section_index + 1) {
            Some(next) => next.first_slot - 1,
            None => self.slots.len() as i64,
        }
    }

    pub(crate) fn section_slot_count(&self, section_index: usize) -> i64 {
        self.section_last_slot(section_index) - self.sections[section_index].first_slot + 1
    }

    /// Slot number of the first slot on a page, if the page exists.
    pub(crate) fn first_slot_of_page(&self, page: i64) -> Option<i64> {
        self.slots
            .iter()
            .find(|s| s.slot.page == page)
            .map(|s| s.slot.slot_number)
    }

    pub fn view(&self) -> StructureView {
        StructureView {
            quiz_id: self.quiz_id,
            can_be_edited: self.can_edit,
            slots: self.slots.clone(),
            sections: self.sections.clone(),
        }
    }
}

/// Compress any gaps in page numbering so pages form a dense 1..=M
/// sequence matching slot order. Pure function over an ordered slot list;
/// slots that shared a page keep sharing one.
pub fn refresh_page_numbers(slots: &mut [Slot]) {
    let mut page = 0;
    let mut previous_original: Option<i64> = None;
    for slot in slots.iter_mut() {
        let original = slot.page;
        if previous_original != Some(original) {
            page += 1;
            previous_original = Some(original);
        }
        slot.page = page;
    }
}
