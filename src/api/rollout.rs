//! POST /api/rl/rollout — generate scored candidates and training data.

use super::ApiState;
use crate::critic::PreferenceDecision;
use crate::dataset::BatchManifest;
use crate::rollout::{
    DEFAULT_ACTIONS, CandidateOverride, PreferencePair, RolloutConfig, RolloutEntry,
    RolloutRecord, run_rollout,
};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use std::sync::Arc;

/// Candidate counts above this are refused: rollouts multiply capability
/// calls per observation.
const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Deserialize)]
pub(super) struct RolloutApiRequest {
    observations: Vec<RolloutEntry>,
    #[serde(default)]
    actions: Option<Vec<String>>,
    #[serde(default = "default_candidates")]
    candidates: usize,
    #[serde(default = "default_mock")]
    mock: bool,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    model_per_candidate: Vec<CandidateOverride>,
    /// Persist the batch through the dataset emitter.
    #[serde(default)]
    emit: bool,
}

fn default_candidates() -> usize {
    3
}

fn default_mock() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub(super) struct RolloutApiResponse {
    sft: Vec<RolloutRecord>,
    prefs: Vec<PreferencePair>,
    panel: Vec<PreferenceDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch: Option<BatchManifest>,
}

pub(super) async fn handle_rollout(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RolloutApiRequest>,
) -> Response {
    if request.observations.is_empty() {
        return bad_request("observations list must not be empty");
    }
    if request.candidates == 0 || request.candidates > MAX_CANDIDATES {
        return bad_request("candidates must be between 1 and 8");
    }
    let actions = request
        .actions
        .filter(|actions| !actions.is_empty())
        .unwrap_or_else(|| DEFAULT_ACTIONS.iter().map(|a| (*a).to_owned()).collect());

    let config = RolloutConfig {
        actions,
        candidates: request.candidates,
        mock: request.mock,
        seed: request.seed,
        model_per_candidate: request.model_per_candidate,
    };

    let output = match run_rollout(&state.agent, &request.observations, &config).await {
        Ok(output) => output,
        Err(error) => {
            tracing::warn!(%error, "rollout failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": error.to_string()})),
            )
                .into_response();
        }
    };

    let batch = if request.emit {
        match state.emitter.emit_batch(&output) {
            Ok(manifest) => Some(manifest),
            Err(error) => {
                tracing::warn!(%error, "batch emission failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": error.to_string()})),
                )
                    .into_response();
            }
        }
    } else {
        None
    };

    Json(RolloutApiResponse {
        sft: output.sft,
        prefs: output.prefs,
        panel: output.panel,
        batch,
    })
    .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{TurnRequest, TutorAgent};
    use crate::capability::CapabilityClient;
    use crate::config::TutorConfig;
    use crate::dataset::DatasetEmitter;
    use crate::store::TutorStore;

    async fn state() -> Arc<ApiState> {
        let store = TutorStore::connect_in_memory().await.expect("store");
        let agent = Arc::new(TutorAgent::new(
            store,
            Arc::new(CapabilityClient::Mock),
            TutorConfig::default(),
        ));
        let dir = std::env::temp_dir().join(format!("tutord-test-{}", uuid::Uuid::new_v4()));
        Arc::new(ApiState {
            agent,
            emitter: DatasetEmitter::with_out_dir(&dir, false),
        })
    }

    fn entry() -> RolloutEntry {
        RolloutEntry {
            payload: TurnRequest {
                message: "what is heat flux?".into(),
                user_id: "u-1".into(),
                target_concepts: vec!["heat flux".into()],
                ..Default::default()
            },
            observation: None,
        }
    }

    #[tokio::test]
    async fn mock_rollout_round_trips() {
        let state = state().await;
        let request = RolloutApiRequest {
            observations: vec![entry()],
            actions: None,
            candidates: 2,
            mock: true,
            seed: Some(3),
            model_per_candidate: Vec::new(),
            emit: false,
        };
        let response = handle_rollout(State(state), Json(request)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_observations_are_rejected() {
        let state = state().await;
        let request = RolloutApiRequest {
            observations: Vec::new(),
            actions: None,
            candidates: 2,
            mock: true,
            seed: None,
            model_per_candidate: Vec::new(),
            emit: false,
        };
        let response = handle_rollout(State(state), Json(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn excessive_candidate_counts_are_rejected() {
        let state = state().await;
        let request = RolloutApiRequest {
            observations: vec![entry()],
            actions: None,
            candidates: 9,
            mock: true,
            seed: None,
            model_per_candidate: Vec::new(),
            emit: false,
        };
        let response = handle_rollout(State(state), Json(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn emit_flag_persists_a_batch() {
        let state = state().await;
        let request = RolloutApiRequest {
            observations: vec![entry()],
            actions: None,
            candidates: 2,
            mock: true,
            seed: Some(5),
            model_per_candidate: Vec::new(),
            emit: true,
        };
        let response = handle_rollout(State(state.clone()), Json(request)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn request_defaults_apply() {
        let request: RolloutApiRequest =
            serde_json::from_str(r#"{"observations": [{"payload": {"message": "hi", "user_id": "u"}}]}"#)
                .expect("parse");
        assert_eq!(request.candidates, 3);
        assert!(request.mock);
        assert!(!request.emit);
    }
}
