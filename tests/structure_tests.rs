// tests/structure_tests.rs

use std::sync::Arc;

use quizcore::error::AppError;
use quizcore::models::slot::{PageBreakAction, Slot};
use quizcore::store::memory::{MemoryStore, ScriptedQuestionEngine};
use quizcore::structure::{Structure, refresh_page_numbers};

/// Quiz with five scored slots on pages [1, 1, 2, 2, 3] and a single
/// section. Returns (quiz_id, slot_ids).
fn five_slot_quiz(store: &MemoryStore) -> (i64, Vec<i64>) {
    let quiz = store.add_quiz();
    let mut slot_ids = Vec::new();
    for page in [1, 1, 2, 2, 3] {
        let question = store.add_question("multichoice", 1, false);
        slot_ids.push(store.add_slot(quiz, question, page, 1.0));
    }
    store.add_section(quiz, 1, "");
    (quiz, slot_ids)
}

fn assert_dense(slots: &[Slot]) {
    for (index, slot) in slots.iter().enumerate() {
        assert_eq!(
            slot.slot_number,
            index as i64 + 1,
            "slot numbers must be contiguous from 1"
        );
    }
}

fn pages(slots: &[Slot]) -> Vec<i64> {
    slots.iter().map(|s| s.page).collect()
}

#[tokio::test]
async fn load_assigns_display_numbers_and_labels() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    let scored = store.add_question("multichoice", 1, false);
    let info = store.add_question("description", 0, false);
    let scored2 = store.add_question("shortanswer", 1, false);
    store.add_slot(quiz, scored, 1, 1.0);
    store.add_slot(quiz, info, 1, 0.0);
    store.add_slot(quiz, scored2, 2, 1.0);
    store.add_section(quiz, 1, "");

    let structure = Structure::load(&store, quiz).await.unwrap();

    assert!(structure.can_be_edited());
    let slots = structure.slots();
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[0].display_number, Some(1));
    assert_eq!(slots[0].display_label(), "1");
    assert_eq!(slots[1].display_number, None);
    assert_eq!(slots[1].display_label(), "i");
    assert_eq!(slots[2].display_number, Some(2));
}

#[tokio::test]
async fn load_synthesizes_placeholder_for_missing_question() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    store.add_slot(quiz, 424242, 1, 1.0);
    store.add_section(quiz, 1, "");

    let structure = Structure::load(&store, quiz).await.unwrap();

    assert_eq!(structure.slots()[0].question_type, "missing");
    assert_eq!(structure.slots()[0].length, 1);
    assert_eq!(structure.slots()[0].display_number, Some(1));
}

#[tokio::test]
async fn load_numbers_slots_densely() {
    let store = MemoryStore::new();
    let (quiz, _) = five_slot_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();

    assert_eq!(structure.slot_count(), 5);
    let slots: Vec<Slot> = structure.slots().iter().map(|s| s.slot.clone()).collect();
    assert_dense(&slots);
    assert_eq!(structure.sections()[0].first_slot, 1);
}

#[tokio::test]
async fn move_slot_down_renumbers_affected_span() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[0], Some(ids[2]), 2)
        .await
        .unwrap();

    let slots = store.slots_of(quiz);
    assert_eq!(slots.len(), 5);
    assert_dense(&slots);
    let moved = slots.iter().find(|s| s.id == ids[0]).unwrap();
    assert_eq!(moved.slot_number, 3);
    assert_eq!(moved.page, 2);
    assert_eq!(pages(&slots), vec![1, 2, 2, 2, 3]);
}

#[tokio::test]
async fn move_slot_up_renumbers_affected_span() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[3], Some(ids[0]), 1)
        .await
        .unwrap();

    let slots = store.slots_of(quiz);
    assert_dense(&slots);
    let moved = slots.iter().find(|s| s.id == ids[3]).unwrap();
    assert_eq!(moved.slot_number, 2);
    assert_eq!(moved.page, 1);
    assert_eq!(pages(&slots), vec![1, 1, 1, 2, 3]);
}

#[tokio::test]
async fn move_to_own_position_changes_nothing() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);
    let before = store.slots_of(quiz);

    // After the previous slot, and after itself: both are the same
    // position modulo direction.
    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[1], Some(ids[0]), 1)
        .await
        .unwrap();
    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[1], Some(ids[1]), 1)
        .await
        .unwrap();

    let after = store.slots_of(quiz);
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.slot_number, b.slot_number);
        assert_eq!(a.page, b.page);
    }
}

#[tokio::test]
async fn move_to_very_end_allows_new_page() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[0], Some(ids[4]), 99)
        .await
        .unwrap();

    let slots = store.slots_of(quiz);
    assert_dense(&slots);
    let moved = slots.iter().find(|s| s.id == ids[0]).unwrap();
    assert_eq!(moved.slot_number, 5);
    // Pages re-packed densely: the out-of-range request became page 4.
    assert_eq!(pages(&slots), vec![1, 2, 2, 3, 4]);
}

#[tokio::test]
async fn move_rejects_page_outside_neighbour_range() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    let err = structure
        .move_slot(&store, ids[0], Some(ids[2]), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    let structure = Structure::load(&store, quiz).await.unwrap();
    let err = structure
        .move_slot(&store, ids[0], Some(ids[2]), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    // Nothing was written.
    let slots = store.slots_of(quiz);
    assert_eq!(pages(&slots), vec![1, 1, 2, 2, 3]);
}

#[tokio::test]
async fn move_rejects_unknown_slot() {
    let store = MemoryStore::new();
    let (quiz, _) = five_slot_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    let err = structure.move_slot(&store, 9999, None, 1).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn move_rejects_when_attempts_exist() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);
    store.add_attempt(quiz, 1, 1, "finished", &[(1, Some(1.0))]);

    let structure = Structure::load(&store, quiz).await.unwrap();
    assert!(!structure.can_be_edited());
    let err = structure
        .move_slot(&store, ids[0], Some(ids[2]), 2)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
}

#[tokio::test]
async fn move_sole_slot_of_section_is_rejected() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    for page in [1, 2, 3] {
        let question = store.add_question("multichoice", 1, false);
        store.add_slot(quiz, question, page, 1.0);
    }
    store.add_section(quiz, 1, "one");
    store.add_section(quiz, 2, "two");
    store.add_section(quiz, 3, "three");
    let ids: Vec<i64> = store.slots_of(quiz).iter().map(|s| s.id).collect();

    let structure = Structure::load(&store, quiz).await.unwrap();
    let err = structure
        .move_slot(&store, ids[1], Some(ids[2]), 3)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
}

/// Four slots over pages [1, 1, 2, 2] with a second section from slot 3.
fn two_section_quiz(store: &MemoryStore) -> (i64, Vec<i64>, i64) {
    let quiz = store.add_quiz();
    let mut ids = Vec::new();
    for page in [1, 1, 2, 2] {
        let question = store.add_question("multichoice", 1, false);
        ids.push(store.add_slot(quiz, question, page, 1.0));
    }
    store.add_section(quiz, 1, "intro");
    let second = store.add_section(quiz, 3, "part two");
    (quiz, ids, second)
}

#[tokio::test]
async fn moving_onto_next_sections_page_pulls_its_heading() {
    let store = MemoryStore::new();
    let (quiz, ids, second) = two_section_quiz(&store);

    // Slot 1 moves after slot 2, landing on the second section's first
    // page: the heading absorbs it.
    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[0], Some(ids[1]), 2)
        .await
        .unwrap();

    let sections = store.sections_of(quiz);
    assert_eq!(sections.len(), 2);
    let pulled = sections.iter().find(|s| s.id == second).unwrap();
    assert_eq!(pulled.first_slot, 2);
    assert_eq!(pages(&store.slots_of(quiz)), vec![1, 2, 2, 2]);
}

#[tokio::test]
async fn moving_before_the_boundary_leaves_the_heading() {
    let store = MemoryStore::new();
    let (quiz, ids, second) = two_section_quiz(&store);

    // Same position, but staying on page 1: the slot remains the last of
    // the first section.
    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[0], Some(ids[1]), 1)
        .await
        .unwrap();

    let sections = store.sections_of(quiz);
    let untouched = sections.iter().find(|s| s.id == second).unwrap();
    assert_eq!(untouched.first_slot, 3);
    assert_eq!(pages(&store.slots_of(quiz)), vec![1, 1, 2, 2]);
}

#[tokio::test]
async fn moving_up_to_a_section_start_keeps_the_heading_with_matching_page() {
    let store = MemoryStore::new();
    let (quiz, ids, second) = two_section_quiz(&store);

    // Slot 4 moves to position 3 (after slot 2) on page 2, the second
    // section's first page: the section keeps starting at slot 3, which
    // is now the moved slot.
    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .move_slot(&store, ids[3], Some(ids[1]), 2)
        .await
        .unwrap();

    let sections = store.sections_of(quiz);
    let kept = sections.iter().find(|s| s.id == second).unwrap();
    assert_eq!(kept.first_slot, 3);
    let moved = store
        .slots_of(quiz)
        .into_iter()
        .find(|s| s.id == ids[3])
        .unwrap();
    assert_eq!(moved.slot_number, 3);
}

#[tokio::test]
async fn remove_slot_renumbers_and_keeps_count() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    structure.remove_slot(&store, 2).await.unwrap();

    let slots = store.slots_of(quiz);
    assert_eq!(slots.len(), 4);
    assert_dense(&slots);
    assert!(slots.iter().all(|s| s.id != ids[1]));
    assert_eq!(pages(&slots), vec![1, 2, 2, 3]);
}

#[tokio::test]
async fn remove_slot_shifts_later_section_boundaries() {
    let store = MemoryStore::new();
    let (quiz, _, second) = two_section_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    structure.remove_slot(&store, 1).await.unwrap();

    let sections = store.sections_of(quiz);
    assert_eq!(sections[0].first_slot, 1);
    let shifted = sections.iter().find(|s| s.id == second).unwrap();
    assert_eq!(shifted.first_slot, 2);
    assert_dense(&store.slots_of(quiz));
}

#[tokio::test]
async fn remove_last_slot_of_a_section_is_rejected() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    for page in [1, 1, 2] {
        let question = store.add_question("multichoice", 1, false);
        store.add_slot(quiz, question, page, 1.0);
    }
    store.add_section(quiz, 1, "");
    store.add_section(quiz, 3, "tail");

    let structure = Structure::load(&store, quiz).await.unwrap();
    let err = structure.remove_slot(&store, 3).await.unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
    assert_eq!(store.slots_of(quiz).len(), 3);
}

#[tokio::test]
async fn remove_slot_deletes_orphaned_random_question() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    let random = store.add_question("random", 1, true);
    let normal = store.add_question("multichoice", 1, false);
    store.add_slot(quiz, random, 1, 1.0);
    store.add_slot(quiz, normal, 1, 1.0);
    store.add_section(quiz, 1, "");

    let structure = Structure::load(&store, quiz).await.unwrap();
    structure.remove_slot(&store, 1).await.unwrap();

    assert!(!store.has_question(random));
    assert!(store.has_question(normal));
}

#[tokio::test]
async fn max_mark_update_within_epsilon_is_a_noop() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);

    let mut structure = Structure::load(&store, quiz).await.unwrap();
    let changed = structure
        .update_slot_max_mark(&store, &store, ids[0], 1.0 + 5e-8)
        .await
        .unwrap();

    assert!(!changed);
    assert_eq!(store.slots_of(quiz)[0].max_mark, 1.0);
}

#[tokio::test]
async fn max_mark_update_propagates_to_existing_attempts() {
    let store = MemoryStore::new();
    let (quiz, ids) = five_slot_quiz(&store);
    let (_, usage) = store.add_attempt(quiz, 7, 1, "finished", &[(1, Some(0.5))]);

    // Attempts lock structural edits, but not mark changes.
    let mut structure = Structure::load(&store, quiz).await.unwrap();
    let changed = structure
        .update_slot_max_mark(&store, &store, ids[0], 2.5)
        .await
        .unwrap();

    assert!(changed);
    assert_eq!(store.slots_of(quiz)[0].max_mark, 2.5);
    assert_eq!(store.usage_max_mark(usage, 1), Some(2.5));
}

#[tokio::test]
async fn page_break_add_and_remove_repaginate_densely() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    let mut ids = Vec::new();
    for page in [1, 1, 2] {
        let question = store.add_question("multichoice", 1, false);
        ids.push(store.add_slot(quiz, question, page, 1.0));
    }
    store.add_section(quiz, 1, "");

    let structure = Structure::load(&store, quiz).await.unwrap();
    let slots = structure
        .update_page_break(&store, ids[0], PageBreakAction::Add)
        .await
        .unwrap();
    assert_eq!(pages(&slots), vec![1, 2, 3]);
    assert_eq!(pages(&store.slots_of(quiz)), vec![1, 2, 3]);

    let structure = Structure::load(&store, quiz).await.unwrap();
    let slots = structure
        .update_page_break(&store, ids[1], PageBreakAction::Remove)
        .await
        .unwrap();
    assert_eq!(pages(&slots), vec![1, 2, 2]);
}

#[tokio::test]
async fn page_break_before_a_section_start_cannot_be_removed() {
    let store = MemoryStore::new();
    let (quiz, ids, _) = two_section_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    let err = structure
        .update_page_break(&store, ids[1], PageBreakAction::Remove)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
}

#[test]
fn refresh_page_numbers_compresses_gaps() {
    let mut slots: Vec<Slot> = [1, 3, 3, 7]
        .iter()
        .enumerate()
        .map(|(index, page)| Slot {
            id: index as i64 + 1,
            quiz_id: 1,
            slot_number: index as i64 + 1,
            question_id: 1,
            page: *page,
            max_mark: 1.0,
            require_previous: false,
        })
        .collect();

    refresh_page_numbers(&mut slots);

    let pages: Vec<i64> = slots.iter().map(|s| s.page).collect();
    assert_eq!(pages, vec![1, 2, 2, 3]);
}

#[tokio::test]
async fn section_headings_are_sanitized_on_write() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    for page in [1, 1, 2] {
        let question = store.add_question("multichoice", 1, false);
        store.add_slot(quiz, question, page, 1.0);
    }
    store.add_section(quiz, 1, "");

    let structure = Structure::load(&store, quiz).await.unwrap();
    let id = structure
        .add_section_heading(&store, 2, "<script>alert('x')</script><b>Part two</b>")
        .await
        .unwrap();

    let sections = store.sections_of(quiz);
    let added = sections.iter().find(|s| s.id == id).unwrap();
    assert_eq!(added.first_slot, 3);
    assert!(added.heading.contains("<b>Part two</b>"));
    assert!(!added.heading.contains("script"));
}

#[tokio::test]
async fn adding_a_section_where_one_starts_conflicts() {
    let store = MemoryStore::new();
    let (quiz, _, _) = two_section_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    let err = structure
        .add_section_heading(&store, 2, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn first_section_cannot_be_removed() {
    let store = MemoryStore::new();
    let (quiz, _, second) = two_section_quiz(&store);

    let structure = Structure::load(&store, quiz).await.unwrap();
    let first_id = structure.sections()[0].id;
    let err = structure
        .remove_section_heading(&store, first_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    // Removing the second section merges its slots into the first.
    let structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .remove_section_heading(&store, second)
        .await
        .unwrap();
    assert_eq!(store.sections_of(quiz).len(), 1);
}

#[tokio::test]
async fn require_previous_respects_question_capabilities() {
    let store = Arc::new(MemoryStore::new());
    let quiz = store.add_quiz();
    let info = store.add_question("description", 0, false);
    let scored = store.add_question("multichoice", 1, false);
    let scored_two = store.add_question("shortanswer", 1, false);
    store.add_slot(quiz, info, 1, 0.0);
    store.add_slot(quiz, scored, 1, 1.0);
    store.add_slot(quiz, scored_two, 2, 1.0);
    store.add_section(quiz, 1, "");
    let ids: Vec<i64> = store.slots_of(quiz).iter().map(|s| s.id).collect();
    let questions = ScriptedQuestionEngine::new(store.clone());

    let mut structure = Structure::load(&*store, quiz).await.unwrap();

    // The first slot has nothing to depend on.
    let err = structure
        .set_require_previous(&*store, &questions, ids[0], true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    // An informational item never finishes, so it cannot be depended on.
    let err = structure
        .set_require_previous(&*store, &questions, ids[1], true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    let changed = structure
        .set_require_previous(&*store, &questions, ids[2], true)
        .await
        .unwrap();
    assert!(changed);
    assert!(store.slots_of(quiz)[2].require_previous);

    // Setting the same value again writes nothing.
    let changed = structure
        .set_require_previous(&*store, &questions, ids[2], true)
        .await
        .unwrap();
    assert!(!changed);
}

#[tokio::test]
async fn section_heading_and_shuffle_updates_stay_in_sync() {
    let store = MemoryStore::new();
    let (quiz, _, second) = two_section_quiz(&store);

    let mut structure = Structure::load(&store, quiz).await.unwrap();
    structure
        .set_section_heading(&store, second, "renamed")
        .await
        .unwrap();
    structure
        .set_section_shuffle(&store, second, true)
        .await
        .unwrap();

    assert_eq!(structure.sections()[1].heading, "renamed");
    assert!(structure.sections()[1].shuffle_questions);
    let stored = store.sections_of(quiz);
    let updated = stored.iter().find(|s| s.id == second).unwrap();
    assert_eq!(updated.heading, "renamed");
    assert!(updated.shuffle_questions);
}
