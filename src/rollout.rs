//! Rollout orchestrator: N scored candidates per observation.
//!
//! Each candidate runs as its own task with no shared mutable state — one
//! candidate failing or being cancelled never affects its siblings. Mock
//! mode produces deterministic seeded candidates without touching the agent,
//! which is what offline dataset generation and tests use.

use crate::agent::{TurnOutcome, TurnRequest, TutorAgent};
use crate::critic::{self, CriticJudgment, PreferenceDecision};
use crate::dataset::SCHEMA_VERSION;
use crate::error::{Result, TutorError};
use crate::observation::{Observation, ObservationBuilder};
use crate::policy::{Action, ActionType, ConceptLevel, MasterySnapshot, PrerequisiteChecker};
use crate::retrieval::{ComponentScores, RankedChunk};
use crate::reward::{self, RewardPayload};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use serde::{Deserialize, Serialize};

use std::sync::Arc;

/// Actions cycled through when the caller doesn't pin them per candidate.
pub const DEFAULT_ACTIONS: &[&str] = &[
    "explain",
    "ask",
    "hint",
    "reflect",
    "worked_example",
    "review",
];

/// One observation entry in a rollout batch. `payload` drives the live agent
/// path; a pre-built observation short-circuits it for mock mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RolloutEntry {
    pub payload: TurnRequest,
    pub observation: Option<Observation>,
}

/// Per-candidate model/action override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CandidateOverride {
    pub action: Option<String>,
    pub model: Option<String>,
}

/// Rollout batch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RolloutConfig {
    /// Action names cycled per candidate; "auto" leaves the policy free.
    pub actions: Vec<String>,
    pub candidates: usize,
    pub mock: bool,
    pub seed: Option<u64>,
    pub model_per_candidate: Vec<CandidateOverride>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            actions: DEFAULT_ACTIONS.iter().map(|a| (*a).to_owned()).collect(),
            candidates: 3,
            mock: true,
            seed: None,
            model_per_candidate: Vec::new(),
        }
    }
}

/// One scored candidate. Created in memory, persisted once validated, never
/// mutated after persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub schema_version: String,
    pub record_id: String,
    pub candidate_index: usize,
    pub model: String,
    pub observation: Observation,
    pub action: Action,
    pub response: String,
    pub reward: RewardPayload,
    pub critic: CriticJudgment,
}

/// What decided a preference pair's label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceBasis {
    RewardTotal,
    CriticConfidence,
    CriticClarity,
}

/// Chosen/rejected pair of rollout records for one observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferencePair {
    pub schema_version: String,
    pub pair_id: String,
    pub chosen: RolloutRecord,
    pub rejected: RolloutRecord,
    pub basis: PreferenceBasis,
    pub margin: f64,
}

/// Batch output: flat SFT-style records plus preference pairs, with the
/// critic's own panel decision per observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutOutput {
    pub sft: Vec<RolloutRecord>,
    pub prefs: Vec<PreferencePair>,
    pub panel: Vec<PreferenceDecision>,
}

/// Run a rollout batch.
pub async fn run_rollout(
    agent: &Arc<TutorAgent>,
    entries: &[RolloutEntry],
    config: &RolloutConfig,
) -> Result<RolloutOutput> {
    if entries.is_empty() {
        return Err(TutorError::Config("observations list must not be empty".into()));
    }
    if config.candidates == 0 || config.actions.is_empty() {
        return Err(TutorError::Config(
            "at least one candidate and one action are required".into(),
        ));
    }

    let base_seed = config.seed.unwrap_or(0);
    let mut tasks: tokio::task::JoinSet<Option<(usize, RolloutRecord)>> =
        tokio::task::JoinSet::new();

    for (entry_index, entry) in entries.iter().enumerate() {
        for candidate_index in 0..config.candidates {
            let (action_name, model) = candidate_plan(config, candidate_index);
            let agent = agent.clone();
            let entry = entry.clone();
            let seed = base_seed
                .wrapping_add(entry_index as u64 * 31)
                .wrapping_add(candidate_index as u64);
            let mock = config.mock;
            tasks.spawn(async move {
                let result = run_candidate(
                    &agent,
                    &entry,
                    entry_index,
                    candidate_index,
                    &action_name,
                    model,
                    mock,
                    seed,
                )
                .await;
                match result {
                    Ok(record) => Some((entry_index, record)),
                    Err(error) => {
                        // A failed candidate drops out; siblings proceed.
                        tracing::warn!(%error, entry_index, candidate_index, "candidate failed");
                        None
                    }
                }
            });
        }
    }

    let mut grouped: Vec<Vec<RolloutRecord>> = vec![Vec::new(); entries.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some((entry_index, record))) => grouped[entry_index].push(record),
            Ok(None) => {}
            Err(error) => tracing::warn!(%error, "candidate task aborted"),
        }
    }

    let mut sft: Vec<RolloutRecord> = Vec::new();
    let mut prefs: Vec<PreferencePair> = Vec::new();
    let mut panel: Vec<PreferenceDecision> = Vec::new();

    for records in &mut grouped {
        records.sort_by_key(|record| record.candidate_index);
        if records.is_empty() {
            continue;
        }

        let candidates: Vec<critic::PreferenceCandidate<'_>> = records
            .iter()
            .map(|record| critic::PreferenceCandidate {
                action_type: record.action.applied_type.to_string(),
                response: &record.response,
                reward_total: record.reward.total,
                critic_confidence: Some(record.critic.confidence),
            })
            .collect();
        panel.push(
            critic::preference_with_critic(
                agent.capability(),
                &records[0].observation,
                &candidates,
            )
            .await,
        );

        for left in 0..records.len() {
            for right in (left + 1)..records.len() {
                if let Some(pair) = build_pair(&records[left], &records[right]) {
                    prefs.push(pair);
                }
            }
        }
        sft.append(records);
    }

    Ok(RolloutOutput { sft, prefs, panel })
}

/// Resolve the action name and model for a candidate slot.
fn candidate_plan(config: &RolloutConfig, candidate_index: usize) -> (String, String) {
    let mut action = config.actions[candidate_index % config.actions.len()].clone();
    let mut model = "default".to_owned();
    if let Some(over) = config.model_per_candidate.get(candidate_index) {
        if let Some(forced) = over.action.as_deref().filter(|name| !name.is_empty()) {
            action = forced.to_owned();
        }
        if let Some(name) = over.model.as_deref().filter(|name| !name.is_empty()) {
            model = name.to_owned();
        }
    }
    (action, model)
}

#[allow(clippy::too_many_arguments)]
async fn run_candidate(
    agent: &Arc<TutorAgent>,
    entry: &RolloutEntry,
    entry_index: usize,
    candidate_index: usize,
    action_name: &str,
    model: String,
    mock: bool,
    seed: u64,
) -> Result<RolloutRecord> {
    let action_override = parse_action(action_name);
    let (observation, action, response) = if mock {
        mock_candidate(entry, entry_index, candidate_index, action_override, seed)?
    } else {
        let mut payload = entry.payload.clone();
        payload.action_override = action_override;
        let outcome: TurnOutcome = agent.run_turn(payload).await?;
        (outcome.observation, outcome.action, outcome.response_text)
    };

    let config = agent.config();
    let checker = PrerequisiteChecker::from_config(&config.policy);
    let reward = reward::score_response(
        &observation,
        &action,
        &response,
        &[],
        &config.reward,
        &config.validator,
        &checker,
    );
    let critic = critic::score_with_critic(
        agent.capability(),
        &observation,
        &response,
        &action.source_chunk_ids,
    )
    .await;

    Ok(RolloutRecord {
        schema_version: SCHEMA_VERSION.to_owned(),
        record_id: uuid::Uuid::new_v4().to_string(),
        candidate_index,
        model,
        observation,
        action,
        response,
        reward,
        critic,
    })
}

/// "auto" leaves the policy free; anything else forces the action.
fn parse_action(name: &str) -> Option<ActionType> {
    match name.trim().to_lowercase().as_str() {
        "" | "auto" => None,
        other => Some(ActionType::from_str_lossy(other)),
    }
}

/// Deterministic candidate without touching the live agent.
fn mock_candidate(
    entry: &RolloutEntry,
    entry_index: usize,
    candidate_index: usize,
    action_override: Option<ActionType>,
    seed: u64,
) -> Result<(Observation, Action, String)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let applied = action_override.unwrap_or(ActionType::Explain);

    let observation = match &entry.observation {
        Some(observation) => observation.clone(),
        None => synthesize_observation(&entry.payload, entry_index)?,
    };

    let focus = observation
        .tutor
        .focus_concept
        .clone()
        .unwrap_or_else(|| "concept".into());
    let snippet = observation
        .retrieval
        .chunks
        .first()
        .map(|chunk| chunk.snippet.clone())
        .unwrap_or_else(|| observation.user.message.clone());
    let response = format!(
        "[{}] {focus}: {}",
        applied.to_string().to_uppercase(),
        snippet.chars().take(120).collect::<String>(),
    );
    let confidence = reward::round4(0.55 + 0.1 * rng.gen_range(0.0..1.0));

    let action = Action {
        applied_type: applied,
        override_type: action_override,
        confidence,
        cold_start: false,
        source_chunk_ids: observation.retrieval.chunk_ids(),
        prereq_gating_failed: false,
        concept: Some(focus),
        level: observation.tutor.concept_level,
    };
    Ok((observation, action, response))
}

/// Minimal observation for mock entries that arrive with only a payload.
fn synthesize_observation(payload: &TurnRequest, entry_index: usize) -> Result<Observation> {
    let message = if payload.message.is_empty() {
        "Review the focus concept.".to_owned()
    } else {
        payload.message.clone()
    };
    let concept = payload
        .target_concepts
        .first()
        .cloned()
        .unwrap_or_else(|| "concept".into());
    let chunk = RankedChunk {
        id: "chunk-mock-1".into(),
        resource_id: payload.resource_id.clone(),
        page_number: Some(1),
        seq: 1,
        snippet: message.clone(),
        pedagogy_role: Some("definition".into()),
        scores: ComponentScores {
            similarity: 0.5,
            lexical: 0.3,
            fused: 0.44,
        },
    };

    ObservationBuilder {
        message,
        user_id: if payload.user_id.is_empty() {
            "mock-user".into()
        } else {
            payload.user_id.clone()
        },
        target_concepts: payload.target_concepts.clone(),
        classification: Some(crate::classify::Classification {
            intent: crate::classify::Intent::Question,
            affect: crate::classify::Affect::Confused,
            concept: concept.clone(),
            confidence: 0.5,
            needs_escalation: false,
        }),
        retrieval_query: Some(concept.clone()),
        pedagogy_roles: vec!["definition".into()],
        chunks: vec![chunk],
        focus_concept: Some(concept.clone()),
        concept_level: ConceptLevel::Beginner,
        learning_path: if payload.target_concepts.is_empty() {
            vec![concept]
        } else {
            payload.target_concepts.clone()
        },
        mastery_snapshot: Some(MasterySnapshot {
            mastery: Some(0.2),
            attempts: 0,
            correct: 0,
        }),
        path_mastery: Default::default(),
        cold_start: false,
        consecutive_explains: 0,
        session_id: payload
            .session_id
            .clone()
            .unwrap_or_else(|| format!("mock-session-{entry_index}")),
        turn_index: 0,
        resource_id: payload.resource_id.clone(),
    }
    .build()
}

/// Label a pair of candidates, or discard it when no preference can be
/// derived. Reward totals are authoritative; the critic tie-break applies
/// only when a total is missing, and an exact tie at every level emits no
/// pair at all.
pub fn build_pair(a: &RolloutRecord, b: &RolloutRecord) -> Option<PreferencePair> {
    let (chosen, rejected, basis, margin) = match (a.reward.total, b.reward.total) {
        (Some(total_a), Some(total_b)) => {
            if total_a == total_b {
                return None;
            }
            if total_a > total_b {
                (a, b, PreferenceBasis::RewardTotal, total_a - total_b)
            } else {
                (b, a, PreferenceBasis::RewardTotal, total_b - total_a)
            }
        }
        _ => {
            let conf_a = a.critic.confidence;
            let conf_b = b.critic.confidence;
            if conf_a != conf_b {
                let (chosen, rejected) = if conf_a > conf_b { (a, b) } else { (b, a) };
                (
                    chosen,
                    rejected,
                    PreferenceBasis::CriticConfidence,
                    (conf_a - conf_b).abs(),
                )
            } else if a.critic.clarity != b.critic.clarity {
                let (chosen, rejected) = if a.critic.clarity > b.critic.clarity {
                    (a, b)
                } else {
                    (b, a)
                };
                (
                    chosen,
                    rejected,
                    PreferenceBasis::CriticClarity,
                    (a.critic.clarity - b.critic.clarity).abs(),
                )
            } else {
                return None;
            }
        }
    };

    Some(PreferencePair {
        schema_version: SCHEMA_VERSION.to_owned(),
        pair_id: uuid::Uuid::new_v4().to_string(),
        chosen: chosen.clone(),
        rejected: rejected.clone(),
        basis,
        margin: reward::round4(margin),
    })
}
