//! Independent critic scorer.
//!
//! Judges a response through a separate evaluation path from the reward
//! scorer — its own prompt, its own heuristic baseline — so it cannot simply
//! echo the reward's internal signals. Always returns all four numeric
//! fields plus the hallucination verdict; missing grounding data degrades
//! `support` toward zero instead of failing.

use crate::capability::CapabilityClient;
use crate::classify::clamp_unit;
use crate::observation::Observation;
use crate::reward::round4;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Support baseline when the turn had no retrieval at all.
const SUPPORT_NO_RETRIEVAL: f64 = 0.15;

/// Support baseline when chunks were retrieved but none were cited.
const SUPPORT_UNCITED: f64 = 0.45;

/// The critic's judgment of one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticJudgment {
    pub clarity: f64,
    pub accuracy: f64,
    pub support: f64,
    pub confidence: f64,
    pub hallucination: bool,
    pub notes: String,
}

/// Which candidate a critic preferred, with per-candidate scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceDecision {
    pub chosen: usize,
    pub scores: Vec<f64>,
    pub confidence: f64,
    pub reason: String,
}

/// Candidate summary handed to the preference critic.
#[derive(Debug, Clone)]
pub struct PreferenceCandidate<'a> {
    pub action_type: String,
    pub response: &'a str,
    pub reward_total: Option<f64>,
    pub critic_confidence: Option<f64>,
}

/// Numbered snippet block rendering the turn's retrieved context for the
/// critic prompt. Mirrors the emitter convention: `[Chunk N | id] snippet`.
fn retrieved_context(observation: &Observation) -> String {
    let mut parts = Vec::new();
    for (index, chunk) in observation.retrieval.chunks.iter().enumerate() {
        let snippet = chunk.snippet.trim();
        if snippet.is_empty() {
            continue;
        }
        parts.push(format!("[Chunk {} | {}] {snippet}", index + 1, chunk.id));
    }
    parts.join("\n\n")
}

/// Score a response with the critic capability, falling back to the
/// heuristic baseline when the capability degrades.
pub async fn score_with_critic(
    capability: &CapabilityClient,
    observation: &Observation,
    response_text: &str,
    cited_ids: &[String],
) -> CriticJudgment {
    let default = heuristic_judgment(observation, response_text, cited_ids);
    let prompt = format!(
        "Judge this tutoring response on clarity, accuracy, and support.\n\
         Focus concept: {}\n\
         Student intent: {}\n\
         Retrieved context:\n{}\n\
         Response:\n{}\n\
         Respond with JSON: {{\"clarity\": number, \"accuracy\": number, \
         \"support\": number, \"confidence\": number, \"hallucination\": bool, \
         \"notes\": string}} with numbers in [0,1].",
        observation.tutor.focus_concept.as_deref().unwrap_or(""),
        observation.classifier.intent,
        retrieved_context(observation),
        if response_text.trim().is_empty() {
            "(empty response)"
        } else {
            response_text.trim()
        },
    );

    let default_payload = json!({
        "clarity": default.clarity,
        "accuracy": default.accuracy,
        "support": default.support,
        "confidence": default.confidence,
        "hallucination": default.hallucination,
        "notes": default.notes,
    });
    let result = capability.complete_json_or(&prompt, default_payload).await;

    let field = |name: &str, fallback: f64| {
        round4(clamp_unit(
            result.get(name).and_then(|v| v.as_f64()).unwrap_or(fallback),
        ))
    };
    CriticJudgment {
        clarity: field("clarity", default.clarity),
        accuracy: field("accuracy", default.accuracy),
        support: field("support", default.support),
        confidence: field("confidence", default.confidence),
        hallucination: result
            .get("hallucination")
            .and_then(|v| v.as_bool())
            .unwrap_or(default.hallucination),
        notes: result
            .get("notes")
            .and_then(|v| v.as_str())
            .unwrap_or(&default.notes)
            .chars()
            .take(280)
            .collect(),
    }
}

/// Heuristic judgment computed without any capability call.
pub fn heuristic_judgment(
    observation: &Observation,
    response_text: &str,
    cited_ids: &[String],
) -> CriticJudgment {
    let word_count = response_text.split_whitespace().count();
    let clarity = if word_count == 0 {
        0.2
    } else {
        clamp_unit(word_count as f64 / 120.0)
    };

    let focus = observation
        .tutor
        .focus_concept
        .as_deref()
        .unwrap_or("")
        .to_lowercase();
    let accuracy = if !focus.is_empty() && response_text.to_lowercase().contains(&focus) {
        0.85
    } else {
        0.6
    };

    let retrieved = observation.retrieval.chunk_ids();
    let support = if retrieved.is_empty() {
        SUPPORT_NO_RETRIEVAL
    } else if cited_ids.is_empty() {
        SUPPORT_UNCITED
    } else {
        let overlap = cited_ids.iter().filter(|id| retrieved.contains(id)).count();
        0.6 + 0.4 * (overlap as f64 / retrieved.len() as f64)
    };

    let hallucination = support < 0.5 || accuracy < 0.5;
    let confidence = clamp_unit((clarity + accuracy + support) / 3.0);

    let mut notes: Vec<String> = Vec::new();
    if !focus.is_empty() {
        notes.push(format!("focus={focus}"));
    }
    if !cited_ids.is_empty() {
        notes.push(format!("cited={}", cited_ids.len()));
    }
    if hallucination {
        notes.push("check grounding".into());
    }

    CriticJudgment {
        clarity: round4(clarity),
        accuracy: round4(accuracy),
        support: round4(clamp_unit(support)),
        confidence: round4(confidence),
        hallucination,
        notes: notes.join(", "),
    }
}

/// Pick the preferred candidate across a set, via the capability with a
/// reward-surrogate default.
pub async fn preference_with_critic(
    capability: &CapabilityClient,
    observation: &Observation,
    candidates: &[PreferenceCandidate<'_>],
) -> PreferenceDecision {
    let default = surrogate_preference(candidates);
    if candidates.is_empty() {
        return default;
    }

    let summaries: Vec<String> = candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            format!(
                "[{index}] action={} reward={:?} critic_conf={:?} -> {}",
                candidate.action_type,
                candidate.reward_total,
                candidate.critic_confidence,
                candidate.response.chars().take(180).collect::<String>(),
            )
        })
        .collect();
    let prompt = format!(
        "Choose the best tutoring response for this student.\n\
         Focus concept: {}\n\
         Student intent: {}\n\
         Candidates:\n{}\n\
         Respond with JSON: {{\"chosen\": int, \"scores\": [number in [0,1]], \
         \"confidence\": number in [0,1], \"reason\": string}}.",
        observation.tutor.focus_concept.as_deref().unwrap_or(""),
        observation.classifier.intent,
        summaries.join("\n"),
    );

    let default_payload = json!({
        "chosen": default.chosen,
        "scores": default.scores,
        "confidence": default.confidence,
        "reason": default.reason,
    });
    let result = capability.complete_json_or(&prompt, default_payload).await;

    let chosen = result
        .get("chosen")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default.chosen)
        .min(candidates.len() - 1);
    let scores = match result.get("scores").and_then(|v| v.as_array()) {
        Some(values) if values.len() == candidates.len() => values
            .iter()
            .map(|v| round4(clamp_unit(v.as_f64().unwrap_or(0.0))))
            .collect(),
        _ => default.scores.clone(),
    };

    PreferenceDecision {
        chosen,
        scores,
        confidence: round4(clamp_unit(
            result
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(default.confidence),
        )),
        reason: result
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or(&default.reason)
            .chars()
            .take(200)
            .collect(),
    }
}

/// Reward-surrogate baseline: a blend of reward total and critic confidence.
fn surrogate_preference(candidates: &[PreferenceCandidate<'_>]) -> PreferenceDecision {
    let mut scores: Vec<f64> = Vec::with_capacity(candidates.len());
    let mut best_index = 0;
    let mut best_score = -1.0;
    for (index, candidate) in candidates.iter().enumerate() {
        let baseline = clamp_unit(
            0.4 + 0.5 * candidate.reward_total.unwrap_or(0.0)
                + 0.1 * candidate.critic_confidence.unwrap_or(0.0),
        );
        scores.push(round4(baseline));
        if baseline > best_score {
            best_index = index;
            best_score = baseline;
        }
    }
    if scores.is_empty() {
        scores.push(0.5);
        best_score = 0.5;
    }
    PreferenceDecision {
        chosen: best_index,
        scores,
        confidence: round4(clamp_unit(best_score.max(0.0))),
        reason: "selected highest reward surrogate".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ActionType;
    use crate::reward::test_support::{observation, summary};

    #[test]
    fn heuristic_degrades_support_toward_zero_without_retrieval() {
        let mut observation = observation(Vec::new());
        observation.retrieval.chunks.clear();
        let judgment = heuristic_judgment(&observation, "Heat flux is energy flow.", &[]);
        assert!(judgment.support <= 0.2);
        assert!(judgment.hallucination);
    }

    #[test]
    fn heuristic_rewards_cited_overlap() {
        let observation = observation(vec![summary("c-1", "snippet")]);
        let cited = heuristic_judgment(&observation, "Heat flux explained.", &["c-1".into()]);
        let uncited = heuristic_judgment(&observation, "Heat flux explained.", &[]);
        assert!(cited.support > uncited.support);
        assert_eq!(cited.support, 1.0);
    }

    #[test]
    fn heuristic_always_returns_all_fields_in_unit_range() {
        let observation = observation(vec![summary("c-1", "snippet")]);
        let judgment = heuristic_judgment(&observation, "", &[]);
        for value in [
            judgment.clarity,
            judgment.accuracy,
            judgment.support,
            judgment.confidence,
        ] {
            assert!((0.0..=1.0).contains(&value));
        }
    }

    #[tokio::test]
    async fn capability_judgment_is_clamped() {
        let capability = CapabilityClient::canned(vec![json!({
            "clarity": 3.0,
            "accuracy": -1.0,
            "support": 0.8,
            "confidence": 0.9,
            "hallucination": false,
            "notes": "fine",
        })]);
        let observation = observation(vec![summary("c-1", "snippet")]);
        let judgment = score_with_critic(&capability, &observation, "text", &["c-1".into()]).await;
        assert_eq!(judgment.clarity, 1.0);
        assert_eq!(judgment.accuracy, 0.0);
        assert_eq!(judgment.support, 0.8);
    }

    #[tokio::test]
    async fn surrogate_preference_picks_highest_reward() {
        let capability = CapabilityClient::Mock;
        let observation = observation(vec![summary("c-1", "snippet")]);
        let candidates = vec![
            PreferenceCandidate {
                action_type: ActionType::Explain.to_string(),
                response: "weak",
                reward_total: Some(0.3),
                critic_confidence: Some(0.5),
            },
            PreferenceCandidate {
                action_type: ActionType::Ask.to_string(),
                response: "strong",
                reward_total: Some(0.9),
                critic_confidence: Some(0.6),
            },
        ];
        let decision = preference_with_critic(&capability, &observation, &candidates).await;
        assert_eq!(decision.chosen, 1);
        assert_eq!(decision.scores.len(), 2);
        assert!(decision.scores[1] > decision.scores[0]);
    }

    #[tokio::test]
    async fn out_of_range_chosen_index_is_clamped() {
        let capability = CapabilityClient::canned(vec![json!({
            "chosen": 99,
            "scores": [0.5, 0.6],
            "confidence": 0.7,
            "reason": "best",
        })]);
        let observation = observation(vec![summary("c-1", "snippet")]);
        let candidates = vec![
            PreferenceCandidate {
                action_type: "explain".into(),
                response: "a",
                reward_total: Some(0.5),
                critic_confidence: None,
            },
            PreferenceCandidate {
                action_type: "ask".into(),
                response: "b",
                reward_total: Some(0.6),
                critic_confidence: None,
            },
        ];
        let decision = preference_with_critic(&capability, &observation, &candidates).await;
        assert_eq!(decision.chosen, 1);
    }
}
