// src/handlers/regrade.rs

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use sqlx::PgPool;

use crate::{
    error::AppError,
    models::regrade::{RegradeNeedingRequest, RegradeRequest},
    regrade::RegradeEngine,
    store::{AttemptStore, NullGradebook, StoredFractionEngine, TracingProgress, postgres::PgStore},
};

/// Starts a regrade batch over the attempts matching the filters. Dry
/// runs only record the would-be deltas in the ledger.
pub async fn start_regrade(
    State(pool): State<PgPool>,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<RegradeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let questions = StoredFractionEngine::new(&store);
    let gradebook = NullGradebook;
    let progress = TracingProgress;
    let engine = RegradeEngine::new(&store, &store, &questions, &gradebook, &progress);

    let outcome = engine
        .regrade_attempts(quiz_id, payload.dry_run, payload.students, payload.attempts)
        .await?;

    Ok(Json(outcome))
}

/// Regrades, for real, only the (attempt, slot) pairs flagged by a
/// previous dry run.
pub async fn regrade_needing(
    State(pool): State<PgPool>,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<RegradeNeedingRequest>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let questions = StoredFractionEngine::new(&store);
    let gradebook = NullGradebook;
    let progress = TracingProgress;
    let engine = RegradeEngine::new(&store, &store, &questions, &gradebook, &progress);

    let outcome = engine
        .regrade_attempts_needing(quiz_id, payload.students)
        .await?;

    Ok(Json(outcome))
}

/// How many (attempt, slot) pairs still await a real regrade.
pub async fn pending_regrades(
    State(pool): State<PgPool>,
    Path(quiz_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let pending = store.count_needing_regrade(quiz_id).await?;

    Ok(Json(serde_json::json!({ "pending": pending })))
}
