//! Axum Handlers for the REST API
//!
//! Read-only views over the phase table and learner progress. Handlers use
//! `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::error;
use vocab_core::model::{ProgressRecord, UserId, WordId};
use vocab_core::repository::Repository;
use vocab_core::{EntryDecision, PhaseTable, ResumptionPolicy};

use crate::{
    models::{CompletedPhase, ErrorResponse, PhaseListResponse, ProgressView},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

pub fn phase_list(phases: &PhaseTable) -> PhaseListResponse {
    PhaseListResponse {
        phases: phases.ids().map(|id| id.to_string()).collect(),
    }
}

/// Builds the progress view the same way a new session would pick its entry.
pub fn progress_view(
    phases: &PhaseTable,
    policy: &ResumptionPolicy,
    user_id: UserId,
    word_id: WordId,
    progress: &[ProgressRecord],
    last_interaction_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ProgressView {
    let decision =
        policy.choose_entry(phases, user_id, word_id, progress, last_interaction_at, now);
    let (next_phase, greeting) = match decision {
        EntryDecision::Start { phase, greeting } => {
            (Some(phase.to_string()), Some(greeting.as_str().to_string()))
        }
        EntryDecision::AlreadyComplete => (None, None),
    };
    ProgressView {
        user_id,
        word_id,
        completed: progress
            .iter()
            .map(|r| CompletedPhase {
                phase_id: r.phase_id.to_string(),
                completed_at: r.completed_at,
            })
            .collect(),
        complete: next_phase.is_none(),
        next_phase,
        greeting,
    }
}

/// List the configured phase order.
#[utoipa::path(
    get,
    path = "/phases",
    responses(
        (status = 200, description = "Phases in the order a session runs them", body = PhaseListResponse)
    )
)]
pub async fn list_phases(State(state): State<Arc<AppState>>) -> Json<PhaseListResponse> {
    Json(phase_list(state.orchestrator.phases()))
}

/// Get a learner's progress on one word.
#[utoipa::path(
    get,
    path = "/users/{user_id}/words/{word_id}/progress",
    responses(
        (status = 200, description = "Completed phases and the next entry point", body = ProgressView),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 404, description = "User or word not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("user_id" = i64, Path, description = "Learner ID"),
        ("word_id" = i64, Path, description = "Vocabulary word ID")
    )
)]
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path((user_id, word_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    if user_id <= 0 || word_id <= 0 {
        return Err(ApiError::BadRequest(
            "user_id and word_id must be positive".to_string(),
        ));
    }

    state
        .db
        .get_user(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("User with id '{}' not found", user_id)))?;
    state
        .db
        .get_word(word_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Word with id '{}' not found", word_id)))?;

    let progress = state.db.get_progress(user_id, word_id).await?;
    let last_interaction_at = state.db.get_last_interaction(user_id, word_id).await?;

    let view = progress_view(
        state.orchestrator.phases(),
        &state.orchestrator.settings().resumption,
        user_id,
        word_id,
        &progress,
        last_interaction_at,
        Utc::now(),
    );
    Ok((StatusCode::OK, Json(view)))
}
