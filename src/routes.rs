// src/routes.rs

use axum::{
    Router,
    http::Method,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{regrade, statistics, structure};
use crate::state::AppState;

/// Assembles the main application router.
///
/// * Structure editing, statistics and regrade endpoints per quiz.
/// * Applies global middleware (Trace, CORS).
/// * Injects global state (Database Pool).
pub fn create_router(state: AppState) -> Router {
    let origins = [
        "http://localhost:3000".parse().unwrap(),
        "http://127.0.0.1:3000".parse().unwrap(),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let quiz_routes = Router::new()
        .route("/{quiz_id}/structure", get(structure::get_structure))
        .route(
            "/{quiz_id}/structure/slots/{slot_id}/move",
            put(structure::move_slot),
        )
        .route(
            "/{quiz_id}/structure/slots/{slot_number}",
            axum::routing::delete(structure::remove_slot),
        )
        .route(
            "/{quiz_id}/structure/slots/{slot_id}/maxmark",
            put(structure::set_max_mark),
        )
        .route(
            "/{quiz_id}/structure/slots/{slot_id}/pagebreak",
            put(structure::update_page_break),
        )
        .route(
            "/{quiz_id}/structure/slots/{slot_id}/requireprevious",
            put(structure::set_require_previous),
        )
        .route("/{quiz_id}/structure/sections", post(structure::add_section))
        .route(
            "/{quiz_id}/structure/sections/{section_id}",
            put(structure::update_section).delete(structure::remove_section),
        )
        .route(
            "/{quiz_id}/statistics",
            get(statistics::get_statistics).delete(statistics::clear_statistics),
        )
        .route("/{quiz_id}/regrade", post(regrade::start_regrade))
        .route("/{quiz_id}/regrade/needing", post(regrade::regrade_needing))
        .route("/{quiz_id}/regrade/pending", get(regrade::pending_regrades));

    Router::new()
        .nest("/api/quizzes", quiz_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
