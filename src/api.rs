//! HTTP surface: turn and rollout endpoints.

mod rollout;
mod turn;

use crate::agent::TutorAgent;
use crate::dataset::DatasetEmitter;

use axum::Router;
use axum::routing::post;

use std::sync::Arc;

/// Shared state for all handlers.
pub struct ApiState {
    pub agent: Arc<TutorAgent>,
    pub emitter: DatasetEmitter,
}

/// Build the API router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/tutor/turn", post(turn::handle_turn))
        .route("/api/rl/rollout", post(rollout::handle_rollout))
        .with_state(state)
}
