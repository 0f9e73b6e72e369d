//! Turn classification: intent, affect, concept, confidence.
//!
//! The classifier is a capability call with a hard degraded path — when the
//! capability is unreachable or returns junk, the turn proceeds with neutral
//! defaults instead of failing. Out-of-vocabulary intents and affects are
//! coerced to `Unknown`/`Neutral` so downstream matching never sees a stray
//! label.

use crate::capability::CapabilityClient;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// What the learner is doing with this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Question,
    Answer,
    Reflection,
    OffTopic,
    Greeting,
    Unknown,
}

impl Intent {
    /// Parse from a string, defaulting to Unknown.
    pub fn from_str_lossy(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "question" => Self::Question,
            "answer" => Self::Answer,
            "reflection" => Self::Reflection,
            "off_topic" => Self::OffTopic,
            "greeting" => Self::Greeting,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Question => write!(f, "question"),
            Self::Answer => write!(f, "answer"),
            Self::Reflection => write!(f, "reflection"),
            Self::OffTopic => write!(f, "off_topic"),
            Self::Greeting => write!(f, "greeting"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Emotional read on the learner's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affect {
    Confused,
    Unsure,
    Engaged,
    Frustrated,
    Neutral,
}

impl Affect {
    /// Parse from a string, defaulting to Neutral.
    pub fn from_str_lossy(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "confused" => Self::Confused,
            "unsure" => Self::Unsure,
            "engaged" => Self::Engaged,
            "frustrated" => Self::Frustrated,
            _ => Self::Neutral,
        }
    }

    /// Whether this affect signals the learner is struggling.
    pub fn is_struggling(&self) -> bool {
        matches!(self, Self::Confused | Self::Unsure | Self::Frustrated)
    }
}

impl std::fmt::Display for Affect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confused => write!(f, "confused"),
            Self::Unsure => write!(f, "unsure"),
            Self::Engaged => write!(f, "engaged"),
            Self::Frustrated => write!(f, "frustrated"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Validated classifier output for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub affect: Affect,
    pub concept: String,
    pub confidence: f64,
    pub needs_escalation: bool,
}

impl Classification {
    /// The neutral degraded-path classification.
    pub fn degraded(default_concept: &str) -> Self {
        Self {
            intent: Intent::Unknown,
            affect: Affect::Neutral,
            concept: default_concept.to_owned(),
            confidence: 0.3,
            needs_escalation: false,
        }
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Classify a learner message.
///
/// The default concept falls back from the last focused concept to the first
/// explicit target, matching what the session would otherwise keep teaching.
pub async fn classify_message(
    capability: &CapabilityClient,
    message: &str,
    target_concepts: &[String],
    last_concept: Option<&str>,
) -> Classification {
    let default_concept = last_concept
        .map(String::from)
        .or_else(|| target_concepts.first().cloned())
        .unwrap_or_default();

    let prompt = format!(
        "Classify the student's message for a tutoring session.\n\
         Message: {message}\n\
         Target concepts: {}\n\
         Last concept discussed: {}\n\
         Respond with JSON: {{\"intent\": one of question|answer|reflection|off_topic|greeting|unknown, \
         \"affect\": one of confused|unsure|engaged|frustrated|neutral, \
         \"concept\": string, \"confidence\": number in [0,1], \"needs_escalation\": bool}}",
        format_concept_list(target_concepts),
        last_concept.unwrap_or("none"),
    );

    let default_payload = json!({
        "intent": "unknown",
        "affect": "neutral",
        "concept": default_concept,
        "confidence": 0.3,
        "needs_escalation": false,
    });

    let result = capability.complete_json_or(&prompt, default_payload).await;

    let concept = result
        .get("concept")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .unwrap_or(default_concept);

    Classification {
        intent: result
            .get("intent")
            .and_then(|value| value.as_str())
            .map(Intent::from_str_lossy)
            .unwrap_or(Intent::Unknown),
        affect: result
            .get("affect")
            .and_then(|value| value.as_str())
            .map(Affect::from_str_lossy)
            .unwrap_or(Affect::Neutral),
        concept,
        confidence: clamp_unit(
            result
                .get("confidence")
                .and_then(|value| value.as_f64())
                .unwrap_or(0.0),
        ),
        needs_escalation: result
            .get("needs_escalation")
            .and_then(|value| value.as_bool())
            .unwrap_or(false),
    }
}

/// Short comma-joined list for prompt interpolation.
pub fn format_concept_list(concepts: &[String]) -> String {
    if concepts.is_empty() {
        return "None".into();
    }
    concepts
        .iter()
        .take(6)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn degraded_path_returns_neutral_defaults() {
        // The mock returns the default payload — the degraded classification.
        let capability = CapabilityClient::Mock;
        let targets = vec!["derivatives".to_owned()];
        let result = classify_message(&capability, "what is a derivative?", &targets, None).await;
        assert_eq!(result.intent, Intent::Unknown);
        assert_eq!(result.affect, Affect::Neutral);
        assert_eq!(result.concept, "derivatives");
        assert!((result.confidence - 0.3).abs() < 1e-9);
        assert!(!result.needs_escalation);
    }

    #[tokio::test]
    async fn out_of_vocabulary_labels_coerce_to_defaults() {
        let capability = CapabilityClient::canned(vec![json!({
            "intent": "meta_commentary",
            "affect": "ecstatic",
            "concept": "limits",
            "confidence": 1.7,
        })]);
        let result = classify_message(&capability, "hm", &[], Some("limits")).await;
        assert_eq!(result.intent, Intent::Unknown);
        assert_eq!(result.affect, Affect::Neutral);
        assert_eq!(result.concept, "limits");
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn valid_payload_parses_through() {
        let capability = CapabilityClient::canned(vec![json!({
            "intent": "question",
            "affect": "confused",
            "concept": "heat flux",
            "confidence": 0.82,
            "needs_escalation": false,
        })]);
        let result = classify_message(&capability, "what is heat flux?", &[], None).await;
        assert_eq!(result.intent, Intent::Question);
        assert_eq!(result.affect, Affect::Confused);
        assert_eq!(result.concept, "heat flux");
        assert!((result.confidence - 0.82).abs() < 1e-9);
    }

    #[test]
    fn last_concept_beats_first_target_as_default() {
        let degraded = Classification::degraded("momentum");
        assert_eq!(degraded.concept, "momentum");
        assert_eq!(degraded.intent, Intent::Unknown);
    }

    #[test]
    fn struggling_affects() {
        assert!(Affect::Confused.is_struggling());
        assert!(Affect::Frustrated.is_struggling());
        assert!(!Affect::Engaged.is_struggling());
        assert!(!Affect::Neutral.is_struggling());
    }
}
