//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{CompletedPhase, ErrorResponse, PhaseListResponse, ProgressView},
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_phases,
        handlers::get_progress,
    ),
    components(
        schemas(PhaseListResponse, ProgressView, CompletedPhase, ErrorResponse)
    ),
    tags(
        (name = "Vocabulary API", description = "Phase order and learner progress for the vocabulary tutor")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/phases", get(handlers::list_phases))
        .route(
            "/users/{user_id}/words/{word_id}/progress",
            get(handlers::get_progress),
        )
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
