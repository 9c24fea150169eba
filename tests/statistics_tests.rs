// tests/statistics_tests.rs

use chrono::{Duration, Utc};
use quizcore::models::statistics::{
    AttemptSelection, CalculatedStatistics, PolicyBreakdown,
};
use quizcore::stats::{
    STATISTICS_TTL_SECONDS, StatisticsCache, StatisticsCalculator, selection_hash,
};
use quizcore::store::memory::MemoryStore;
use quizcore::store::{AttemptStore, StatsStore};

/// Quiz with one scored slot where each listed grade becomes one
/// student's single finished attempt.
fn quiz_with_grades(store: &MemoryStore, grades: &[f64]) -> i64 {
    let quiz = store.add_quiz();
    let question = store.add_question("shortanswer", 1, false);
    store.add_slot(quiz, question, 1, 1.0);
    store.add_section(quiz, 1, "");
    for (index, grade) in grades.iter().enumerate() {
        store.add_attempt(quiz, index as i64 + 1, 1, "finished", &[(1, Some(*grade))]);
    }
    quiz
}

fn assert_close(actual: Option<f64>, expected: f64, tolerance: f64) {
    let actual = actual.expect("statistic should be present");
    assert!(
        (actual - expected).abs() < tolerance,
        "expected {} within {}, got {}",
        expected,
        tolerance,
        actual
    );
}

#[tokio::test]
async fn mean_and_median_of_three_grades() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[10.0, 20.0, 30.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 1, None)
        .await
        .unwrap();

    assert_eq!(stats.count, 3);
    assert_close(stats.mean, 20.0, 1e-12);
    assert_close(stats.median, 20.0, 1e-12);
    assert_close(stats.standard_deviation, 10.0, 1e-12);
    assert_close(stats.skewness, 0.0, 1e-12);
    assert_eq!(stats.kurtosis, None);
    assert_eq!(stats.cic, None);
}

#[tokio::test]
async fn median_of_four_grades_averages_the_middle_pair() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[40.0, 10.0, 30.0, 20.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 1, None)
        .await
        .unwrap();

    assert_close(stats.median, 25.0, 1e-12);
}

#[tokio::test]
async fn classic_standard_deviation_example() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 1, None)
        .await
        .unwrap();

    // sqrt(32 / 7) with the (s - 1) denominator.
    assert_close(stats.standard_deviation, 2.138089935299395, 1e-9);
}

#[tokio::test]
async fn small_samples_omit_higher_moments() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[10.0, 20.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 1, None)
        .await
        .unwrap();

    assert_eq!(stats.count, 2);
    assert_close(stats.mean, 15.0, 1e-12);
    assert_close(stats.median, 15.0, 1e-12);
    assert_eq!(stats.standard_deviation, None);
    assert_eq!(stats.skewness, None);
    assert_eq!(stats.kurtosis, None);
}

#[tokio::test]
async fn zero_attempts_short_circuits_but_still_persists() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    let question = store.add_question("shortanswer", 1, false);
    store.add_slot(quiz, question, 1, 1.0);
    store.add_section(quiz, 1, "");

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Highest, None, 1, None)
        .await
        .unwrap();

    assert_eq!(stats.count, 0);
    assert_eq!(stats.mean, None);
    assert_eq!(stats.median, None);

    let hash = selection_hash(quiz, AttemptSelection::Highest, None);
    let cached = store.get_statistics(&hash).await.unwrap().unwrap();
    assert_eq!(cached.count, 0);
}

#[tokio::test]
async fn all_four_policies_are_always_aggregated() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    let question = store.add_question("shortanswer", 1, false);
    store.add_slot(quiz, question, 1, 1.0);
    store.add_section(quiz, 1, "");
    store.add_attempt(quiz, 1, 1, "finished", &[(1, Some(10.0))]);
    store.add_attempt(quiz, 1, 2, "finished", &[(1, Some(30.0))]);
    store.add_attempt(quiz, 2, 1, "finished", &[(1, Some(20.0))]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::First, None, 1, None)
        .await
        .unwrap();

    assert_eq!(stats.breakdown.first.count, 2);
    assert_close(stats.breakdown.first.mean, 15.0, 1e-12);
    assert_close(stats.breakdown.last.mean, 25.0, 1e-12);
    assert_close(stats.breakdown.highest.mean, 25.0, 1e-12);
    assert_close(stats.breakdown.average.mean, 20.0, 1e-12);

    // Only the requested policy drives the main fields.
    assert_close(stats.mean, 15.0, 1e-12);
    assert_eq!(stats.count, 2);
}

#[tokio::test]
async fn kurtosis_needs_four_samples() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[1.0, 2.0, 3.0, 4.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 1, None)
        .await
        .unwrap();

    assert_close(stats.skewness, 0.0, 1e-9);
    // Four evenly spaced points have excess kurtosis -1.2.
    assert_close(stats.kurtosis, -1.2, 1e-9);
}

#[tokio::test]
async fn zero_variance_omits_shape_statistics() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[5.0, 5.0, 5.0, 5.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 1, None)
        .await
        .unwrap();

    assert_eq!(stats.standard_deviation, Some(0.0));
    assert_eq!(stats.skewness, None);
    assert_eq!(stats.kurtosis, None);
    assert_eq!(stats.cic, None);
}

#[tokio::test]
async fn internal_consistency_from_two_positions() {
    let store = MemoryStore::new();
    let quiz = store.add_quiz();
    for _ in 0..2 {
        let question = store.add_question("shortanswer", 1, false);
        store.add_slot(quiz, question, 1, 1.0);
    }
    store.add_section(quiz, 1, "");
    store.add_attempt(quiz, 1, 1, "finished", &[(1, Some(1.0)), (2, Some(0.0))]);
    store.add_attempt(quiz, 2, 1, "finished", &[(1, Some(0.0)), (2, Some(0.0))]);
    store.add_attempt(quiz, 3, 1, "finished", &[(1, Some(1.0)), (2, Some(1.0))]);

    let mark_variance = store
        .mark_variance_sum(quiz, AttemptSelection::Last, None)
        .await
        .unwrap();
    assert_close(mark_variance, 2.0 / 3.0, 1e-12);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 2, mark_variance)
        .await
        .unwrap();

    assert_close(stats.cic, 200.0 / 3.0, 1e-9);
    assert_close(stats.error_ratio, 57.73502691896258, 1e-9);
    assert_close(stats.standard_error, 0.5773502691896258, 1e-9);
}

#[tokio::test]
async fn single_position_omits_internal_consistency() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[1.0, 2.0, 3.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, None, 1, Some(0.5))
        .await
        .unwrap();

    assert_eq!(stats.cic, None);
    assert_eq!(stats.error_ratio, None);
    assert_eq!(stats.standard_error, None);
}

#[tokio::test]
async fn student_subset_restricts_the_sample() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[10.0, 20.0, 30.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(quiz, AttemptSelection::Last, Some(&[1, 2]), 1, None)
        .await
        .unwrap();

    assert_eq!(stats.count, 2);
    assert_close(stats.mean, 15.0, 1e-12);
}

fn stats_fixture(quiz_id: i64, age_seconds: i64) -> CalculatedStatistics {
    CalculatedStatistics {
        quiz_id,
        policy: AttemptSelection::Highest,
        breakdown: PolicyBreakdown::default(),
        count: 3,
        mean: Some(20.0),
        median: Some(20.0),
        standard_deviation: Some(10.0),
        skewness: None,
        kurtosis: None,
        cic: None,
        error_ratio: None,
        standard_error: None,
        time_modified: Utc::now() - Duration::seconds(age_seconds),
    }
}

#[tokio::test]
async fn cache_serves_fresh_entries_and_drops_expired_ones() {
    let store = MemoryStore::new();
    let cache = StatisticsCache::new(&store);
    let hash = selection_hash(1, AttemptSelection::Highest, None);

    store
        .put_statistics(&hash, &stats_fixture(1, 10))
        .await
        .unwrap();
    assert!(cache.get_cached(&hash).await.unwrap().is_some());

    store
        .put_statistics(&hash, &stats_fixture(1, STATISTICS_TTL_SECONDS + 1))
        .await
        .unwrap();
    assert!(cache.get_cached(&hash).await.unwrap().is_none());

    // Still present in storage, just too old to serve.
    assert!(cache.last_calculated_time(&hash).await.unwrap().is_some());
}

#[test]
fn selection_hash_is_order_independent_and_specific() {
    let base = selection_hash(1, AttemptSelection::Highest, Some(&[3, 1, 2]));

    assert_eq!(
        base,
        selection_hash(1, AttemptSelection::Highest, Some(&[2, 3, 1]))
    );
    assert_eq!(
        base,
        selection_hash(1, AttemptSelection::Highest, Some(&[1, 1, 2, 3]))
    );
    assert_ne!(base, selection_hash(1, AttemptSelection::First, Some(&[1, 2, 3])));
    assert_ne!(base, selection_hash(2, AttemptSelection::Highest, Some(&[1, 2, 3])));
    assert_ne!(
        selection_hash(1, AttemptSelection::Highest, None),
        selection_hash(1, AttemptSelection::Highest, Some(&[]))
    );
}

#[tokio::test]
async fn calculation_persists_under_the_selection_hash() {
    let store = MemoryStore::new();
    let quiz = quiz_with_grades(&store, &[10.0, 20.0, 30.0]);

    let calculator = StatisticsCalculator::new(&store, &store);
    calculator
        .calculate(quiz, AttemptSelection::Last, Some(&[3, 1, 2]), 1, None)
        .await
        .unwrap();

    // Same subset in a different order addresses the same entry.
    let hash = selection_hash(quiz, AttemptSelection::Last, Some(&[1, 2, 3]));
    assert!(store.get_statistics(&hash).await.unwrap().is_some());
}

#[tokio::test]
async fn invalidate_clears_aggregate_and_per_question_rows() {
    let store = MemoryStore::new();
    let cache = StatisticsCache::new(&store);
    let hash = selection_hash(1, AttemptSelection::Highest, None);

    store
        .put_statistics(&hash, &stats_fixture(1, 0))
        .await
        .unwrap();
    store.add_question_statistic(&hash, 1);
    store.add_question_statistic(&hash, 2);

    cache.invalidate(&hash).await.unwrap();

    assert!(store.get_statistics(&hash).await.unwrap().is_none());
    assert_eq!(store.question_statistics_count(&hash), 0);
}

#[tokio::test]
async fn invalidate_quiz_clears_every_selection() {
    let store = MemoryStore::new();
    let cache = StatisticsCache::new(&store);
    let first = selection_hash(7, AttemptSelection::Highest, None);
    let second = selection_hash(7, AttemptSelection::First, None);

    store.put_statistics(&first, &stats_fixture(7, 0)).await.unwrap();
    store
        .put_statistics(&second, &stats_fixture(7, 0))
        .await
        .unwrap();
    assert_eq!(store.statistics_count_for_quiz(7), 2);

    cache.invalidate_quiz(7).await.unwrap();

    assert_eq!(store.statistics_count_for_quiz(7), 0);
}
