// src/handlers/structure.rs

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use sqlx::PgPool;
use validator::Validate;

use crate::{
    error::AppError,
    models::slot::{
        AddSectionRequest, MoveSlotRequest, PageBreakRequest, RequirePreviousRequest,
        SetMaxMarkRequest, UpdateSectionRequest,
    },
    store::{StoredFractionEngine, postgres::PgStore},
    structure::Structure,
};

/// Returns the loaded structure of a quiz: slots with display numbers
/// and question metadata, plus sections.
pub async fn get_structure(
    State(pool): State<PgPool>,
    Path(quiz_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let structure = Structure::load(&store, quiz_id).await?;
    Ok(Json(structure.view()))
}

/// Moves a slot after another slot (or to the start) onto a target page.
pub async fn move_slot(
    State(pool): State<PgPool>,
    Path((quiz_id, slot_id)): Path<(i64, i64)>,
    Json(payload): Json<MoveSlotRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let store = PgStore::new(pool);
    let structure = Structure::load(&store, quiz_id).await?;
    structure
        .move_slot(&store, slot_id, payload.after_slot_id, payload.page)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Deletes the slot at a position; later slots close the gap.
pub async fn remove_slot(
    State(pool): State<PgPool>,
    Path((quiz_id, slot_number)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let structure = Structure::load(&store, quiz_id).await?;
    structure.remove_slot(&store, slot_number).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Updates a slot's maximum mark. Reports whether anything was written:
/// changes within the floating-point tolerance are ignored.
pub async fn set_max_mark(
    State(pool): State<PgPool>,
    Path((quiz_id, slot_id)): Path<(i64, i64)>,
    Json(payload): Json<SetMaxMarkRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let store = PgStore::new(pool);
    let mut structure = Structure::load(&store, quiz_id).await?;
    let changed = structure
        .update_slot_max_mark(&store, &store, slot_id, payload.max_mark)
        .await?;

    Ok(Json(serde_json::json!({ "changed": changed })))
}

/// Toggles whether a slot can only be attempted after the previous slot
/// is complete.
pub async fn set_require_previous(
    State(pool): State<PgPool>,
    Path((quiz_id, slot_id)): Path<(i64, i64)>,
    Json(payload): Json<RequirePreviousRequest>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let questions = StoredFractionEngine::new(&store);
    let mut structure = Structure::load(&store, quiz_id).await?;
    let changed = structure
        .set_require_previous(&store, &questions, slot_id, payload.require_previous)
        .await?;

    Ok(Json(serde_json::json!({ "changed": changed })))
}

/// Inserts or removes the page break after a slot and returns the
/// repaginated slot rows.
pub async fn update_page_break(
    State(pool): State<PgPool>,
    Path((quiz_id, slot_id)): Path<(i64, i64)>,
    Json(payload): Json<PageBreakRequest>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let structure = Structure::load(&store, quiz_id).await?;
    let slots = structure
        .update_page_break(&store, slot_id, payload.action)
        .await?;

    Ok(Json(slots))
}

/// Adds a section heading starting at the first slot of a page.
pub async fn add_section(
    State(pool): State<PgPool>,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<AddSectionRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let store = PgStore::new(pool);
    let structure = Structure::load(&store, quiz_id).await?;
    let id = structure
        .add_section_heading(&store, payload.page, &payload.heading)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id })),
    ))
}

/// Updates a section's heading and/or shuffle flag.
pub async fn update_section(
    State(pool): State<PgPool>,
    Path((quiz_id, section_id)): Path<(i64, i64)>,
    Json(payload): Json<UpdateSectionRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let store = PgStore::new(pool);
    let mut structure = Structure::load(&store, quiz_id).await?;
    if let Some(heading) = &payload.heading {
        structure
            .set_section_heading(&store, section_id, heading)
            .await?;
    }
    if let Some(shuffle) = payload.shuffle_questions {
        structure
            .set_section_shuffle(&store, section_id, shuffle)
            .await?;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Removes a section heading; its slots merge into the previous section.
pub async fn remove_section(
    State(pool): State<PgPool>,
    Path((quiz_id, section_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgStore::new(pool);
    let structure = Structure::load(&store, quiz_id).await?;
    structure.remove_section_heading(&store, section_id).await?;

    Ok(StatusCode::NO_CONTENT)
}
