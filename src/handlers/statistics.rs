// src/handlers/statistics.rs

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use sqlx::PgPool;

use crate::{
    error::AppError,
    models::statistics::AttemptSelection,
    stats::{StatisticsCache, StatisticsCalculator, selection_hash},
    store::{AttemptStore, postgres::PgStore},
    structure::Structure,
};

/// Query parameters for the statistics endpoint.
#[derive(Debug, Deserialize)]
pub struct StatisticsParams {
    pub policy: Option<AttemptSelection>,

    /// Comma-separated user ids restricting the calculation.
    pub students: Option<String>,

    /// Force a fresh calculation, discarding any cached result.
    #[serde(default)]
    pub recalculate: bool,
}

fn parse_students(raw: &Option<String>) -> Result<Option<Vec<i64>>, AppError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut students = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id = part
            .parse::<i64>()
            .map_err(|_| AppError::BadRequest(format!("Invalid student id '{}'", part)))?;
        students.push(id);
    }
    Ok(Some(students))
}

/// Returns the quiz statistics for a selection policy, served from the
/// cache when a fresh enough entry exists.
pub async fn get_statistics(
    State(pool): State<PgPool>,
    Path(quiz_id): Path<i64>,
    Query(params): Query<StatisticsParams>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let policy = params.policy.unwrap_or(AttemptSelection::Highest);
    let students = parse_students(&params.students)?;
    let hash = selection_hash(quiz_id, policy, students.as_deref());

    let cache = StatisticsCache::new(&store);
    if params.recalculate {
        cache.invalidate(&hash).await?;
    } else if let Some(stats) = cache.get_cached(&hash).await? {
        return Ok(Json(stats));
    }

    let structure = Structure::load(&store, quiz_id).await?;
    let position_count = structure.scored_position_count();
    let mark_variance = store
        .mark_variance_sum(quiz_id, policy, students.as_deref())
        .await?;

    let calculator = StatisticsCalculator::new(&store, &store);
    let stats = calculator
        .calculate(
            quiz_id,
            policy,
            students.as_deref(),
            position_count,
            mark_variance,
        )
        .await?;

    Ok(Json(stats))
}

/// Clears every cached statistic of the quiz along with the regrade
/// ledger, forcing the next request to recompute from scratch.
pub async fn clear_statistics(
    State(pool): State<PgPool>,
    Path(quiz_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let cache = StatisticsCache::new(&store);
    cache.invalidate_quiz(quiz_id).await?;
    store.clear_regrade_records(quiz_id, None).await?;

    Ok(StatusCode::NO_CONTENT)
}
