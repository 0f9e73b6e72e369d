//! Black-box language capability client.
//!
//! The pipeline treats generation as a capability: given a prompt, return a
//! JSON payload. Three backends — an HTTP client against a completion server,
//! a deterministic mock for offline rollouts, and a canned client that replays
//! scripted payloads for tests. Every remote call runs under a hard timeout;
//! a timeout degrades exactly like any other capability failure, so callers
//! always get a usable payload back.

use crate::config::CapabilityConfig;
use crate::error::{Result, TutorError};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest as _, Sha256};

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Dimensionality of the embedding surface.
pub const EMBEDDING_DIM: usize = 64;

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    stream: bool,
    n_predict: usize,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// A language capability backend.
pub enum CapabilityClient {
    Http(HttpCapability),
    /// Returns the caller-supplied default payload for every completion and a
    /// content-derived deterministic embedding. Used for offline rollouts.
    Mock,
    /// Replays scripted payloads in order, then behaves like `Mock`.
    Canned(Mutex<VecDeque<JsonValue>>),
}

impl CapabilityClient {
    pub fn from_config(config: &CapabilityConfig) -> Result<Self> {
        if config.mock {
            return Ok(Self::Mock);
        }
        Ok(Self::Http(HttpCapability::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
        )?))
    }

    pub fn canned(payloads: Vec<JsonValue>) -> Self {
        Self::Canned(Mutex::new(payloads.into()))
    }

    /// Ask the capability for a JSON payload, falling back to `default` on
    /// unreachability, timeout, or malformed output. This is the only entry
    /// point the pipeline uses, so the degraded path is uniform everywhere.
    pub async fn complete_json_or(&self, prompt: &str, default: JsonValue) -> JsonValue {
        match self {
            Self::Http(http) => match http.complete_json(prompt).await {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(%error, "capability call degraded to default payload");
                    default
                }
            },
            Self::Mock => default,
            Self::Canned(queue) => {
                let scripted = queue.lock().expect("canned queue lock poisoned").pop_front();
                scripted.unwrap_or(default)
            }
        }
    }

    /// Embed a query string. The mock embedding is a pure function of the
    /// text so repeated rankings over identical inputs stay identical.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            Self::Http(http) => http.embed(text).await,
            Self::Mock | Self::Canned(_) => Ok(deterministic_embedding(text)),
        }
    }
}

impl std::fmt::Debug for CapabilityClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(http) => f.debug_tuple("Http").field(&http.base_url).finish(),
            Self::Mock => f.write_str("Mock"),
            Self::Canned(_) => f.write_str("Canned"),
        }
    }
}

/// HTTP-backed capability against a llama-server style completion endpoint.
pub struct HttpCapability {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCapability {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| TutorError::CapabilityUnavailable(error.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    async fn complete_json(&self, prompt: &str) -> Result<JsonValue> {
        let body = CompletionRequest {
            prompt,
            stream: false,
            n_predict: 512,
        };
        let response = self
            .client
            .post(format!("{}/completion", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|error| TutorError::CapabilityUnavailable(error.to_string()))?;
        if !response.status().is_success() {
            return Err(TutorError::CapabilityUnavailable(format!(
                "completion endpoint returned {}",
                response.status()
            )));
        }
        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|error| TutorError::CapabilityUnavailable(error.to_string()))?;
        parse_json_content(&completion.content)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest { content: text };
        let response = self
            .client
            .post(format!("{}/embedding", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|error| TutorError::CapabilityUnavailable(error.to_string()))?;
        if !response.status().is_success() {
            return Err(TutorError::CapabilityUnavailable(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }
        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| TutorError::CapabilityUnavailable(error.to_string()))?;
        Ok(payload.embedding)
    }
}

/// Extract the first JSON object from the model's text output. Models wrap
/// payloads in prose or code fences often enough that strict parsing alone
/// would waste good completions.
fn parse_json_content(content: &str) -> Result<JsonValue> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) {
        return Ok(value);
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
        && let Ok(value) = serde_json::from_str::<JsonValue>(&trimmed[start..=end])
    {
        return Ok(value);
    }
    Err(TutorError::CapabilityUnavailable(
        "completion did not contain a JSON object".into(),
    ))
}

/// Hash the text into a unit-norm vector. Stable across runs and processes.
fn deterministic_embedding(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.to_lowercase().as_bytes());
    let mut values: Vec<f32> = (0..EMBEDDING_DIM)
        .map(|index| {
            let byte = digest[index % digest.len()];
            let rotated = byte.rotate_left((index / digest.len()) as u32);
            (rotated as f32 / 127.5) - 1.0
        })
        .collect();
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in &mut values {
            *value /= norm;
        }
    }
    values
}
