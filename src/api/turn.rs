//! POST /api/tutor/turn — run one tutoring turn.

use super::ApiState;
use crate::agent::{ProgressEntry, TurnRequest};
use crate::error::TutorError;
use crate::observation::Observation;
use crate::srl::{Critique, Plan};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub(super) struct TurnApiRequest {
    #[serde(flatten)]
    request: TurnRequest,
    /// Include the full observation in the response (for dataset tooling).
    #[serde(default)]
    emit_state: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct TurnApiResponse {
    session_id: String,
    turn_id: String,
    turn_index: u64,
    response_text: String,
    action_type: String,
    confidence: f64,
    source_chunk_ids: Vec<String>,
    cold_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    critique: Option<Critique>,
    progress_steps: Vec<ProgressEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    observation: Option<Observation>,
}

pub(super) async fn handle_turn(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<TurnApiRequest>,
) -> Response {
    let emit_state = request.emit_state;
    match state.agent.run_turn(request.request).await {
        Ok(outcome) => Json(TurnApiResponse {
            session_id: outcome.session_id,
            turn_id: outcome.turn_id,
            turn_index: outcome.turn_index,
            response_text: outcome.response_text,
            action_type: outcome.action.applied_type.to_string(),
            confidence: outcome.action.confidence,
            source_chunk_ids: outcome.action.source_chunk_ids,
            cold_start: outcome.cold_start,
            plan: outcome.plan,
            critique: outcome.critique,
            progress_steps: outcome.progress,
            observation: emit_state.then_some(outcome.observation),
        })
        .into_response(),
        Err(error) => error_response(error),
    }
}

/// Map pipeline errors onto HTTP statuses. Only the two user-visible errors
/// get specific statuses; anything else is an internal failure.
fn error_response(error: TutorError) -> Response {
    match &error {
        TutorError::EmptyPool(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "no material available for this scope",
                "detail": error.to_string(),
            })),
        )
            .into_response(),
        TutorError::MissingContext(_) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": error.to_string()})),
        )
            .into_response(),
        _ => {
            tracing::warn!(%error, "turn failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}
