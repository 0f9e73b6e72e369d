//! Self-reflective loop: plan, execute, critique.
//!
//! An optional wrapper around the policy, enabled per request. Three
//! sequential phases, single pass. The plan is produced before any response
//! text exists and is never mutated afterwards; execution runs the plan's
//! steps in order with per-step retrieval; the critique may request at most
//! one regeneration. Every phase degrades to "no plan / no critique" on
//! capability failure — only response generation itself is mandatory.

use crate::capability::CapabilityClient;
use crate::classify::{Affect, Classification, Intent, clamp_unit};
use crate::config::{RetrievalConfig, SrlConfig};
use crate::policy::{ActionType, ConceptLevel, MasteryMap};
use crate::respond::generate_action;
use crate::retrieval::{self, ChunkCandidate, RankWeights, RankedChunk};

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One step of a multi-step plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: ActionType,
    pub rationale: String,
    pub pedagogy_focus: Vec<String>,
    pub target_concept: Option<String>,
}

/// Internal reasoning plan produced before execution. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub intended_action: ActionType,
    pub rationale: String,
    pub confidence: f64,
    pub retrieval_query: String,
    pub pedagogy_focus: Vec<String>,
    pub steps: Vec<PlanStep>,
    pub target_sequence: Vec<String>,
}

/// Post-response critique. `should_revise` is `None` when the critique phase
/// never ran, distinct from an explicit "no revision needed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub quality: f64,
    pub should_revise: Option<bool>,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub reasoning: String,
}

impl Critique {
    /// Critique placeholder for turns where the phase was skipped or failed.
    pub fn not_evaluated() -> Self {
        Self {
            quality: 0.6,
            should_revise: None,
            issues: Vec::new(),
            suggestions: Vec::new(),
            reasoning: "Critique unavailable".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Generate a plan from the turn context.
///
/// Falls back to the rule-based planner when the capability degrades and
/// `fallback_to_rules` is set; otherwise returns a minimal default plan so
/// the turn can proceed.
pub async fn generate_plan(
    capability: &CapabilityClient,
    message: &str,
    classification: &Classification,
    focus_concept: Option<&str>,
    level: ConceptLevel,
    learning_path: &[String],
    mastery_map: &MasteryMap,
    last_action: Option<ActionType>,
    config: &SrlConfig,
) -> Plan {
    let focus = focus_concept.unwrap_or("unknown");
    let prompt = format!(
        "Plan the next tutoring move before responding.\n\
         Student message: {message}\n\
         Intent: {} | Affect: {}\n\
         Focus concept: {focus} | Student level: {level}\n\
         Mastery:\n{}\n\
         Learning path: {}\n\
         Previous action: {}\n\
         Available actions: explain, ask, hint, reflect, worked_example, review.\n\
         Respond with JSON: {{\"intended_action\": string, \"rationale\": string, \
         \"retrieval_query\": string, \"pedagogy_focus\": [string], \
         \"confidence\": number in [0,1], \
         \"steps\": [{{\"action\": string, \"rationale\": string, \
         \"pedagogy_focus\": [string], \"target_concept\": string?}}], \
         \"target_sequence\": [string]}}",
        classification.intent,
        classification.affect,
        format_mastery(mastery_map),
        classification_path(learning_path),
        last_action.map(|action| action.to_string()).unwrap_or_else(|| "none".into()),
    );

    let rule_plan = rule_based_plan(classification, focus_concept, level);
    let default_payload = plan_to_payload(&rule_plan);
    let result = capability.complete_json_or(&prompt, default_payload).await;

    match parse_plan(&result, focus_concept) {
        Some(plan) => plan,
        None if config.fallback_to_rules => rule_plan,
        None => Plan {
            intended_action: ActionType::Explain,
            rationale: String::new(),
            confidence: 0.5,
            retrieval_query: focus.to_owned(),
            pedagogy_focus: vec!["explanation".into()],
            steps: default_steps(ActionType::Explain, &["explanation".to_owned()]),
            target_sequence: Vec::new(),
        },
    }
}

/// Deterministic planner used when the capability is down.
pub fn rule_based_plan(
    classification: &Classification,
    focus_concept: Option<&str>,
    level: ConceptLevel,
) -> Plan {
    let (action, rationale) = if matches!(
        classification.affect,
        Affect::Confused | Affect::Frustrated
    ) {
        (ActionType::Hint, "Student is confused, provide gentle hint")
    } else if classification.intent == Intent::Answer {
        (ActionType::Reflect, "Student answered, prompt reflection")
    } else {
        (ActionType::Explain, "Default explanation")
    };

    let pedagogy: Vec<String> = match level {
        ConceptLevel::Beginner | ConceptLevel::Developing => {
            vec!["definition".into(), "explanation".into(), "example".into()]
        }
        ConceptLevel::Proficient => vec!["example".into(), "application".into()],
        ConceptLevel::Mastering => vec!["derivation".into(), "application".into()],
    };

    Plan {
        intended_action: action,
        rationale: rationale.into(),
        confidence: 0.7,
        retrieval_query: focus_concept.unwrap_or_default().to_owned(),
        pedagogy_focus: pedagogy.clone(),
        steps: default_steps(action, &pedagogy),
        target_sequence: Vec::new(),
    }
}

fn default_steps(action: ActionType, pedagogy: &[String]) -> Vec<PlanStep> {
    vec![
        PlanStep {
            action,
            rationale: "Cover basics clearly".into(),
            pedagogy_focus: pedagogy.to_vec(),
            target_concept: None,
        },
        PlanStep {
            action: ActionType::Ask,
            rationale: "Check fluency and misconceptions".into(),
            pedagogy_focus: vec!["concept_check".into()],
            target_concept: None,
        },
    ]
}

fn parse_plan(value: &JsonValue, focus_concept: Option<&str>) -> Option<Plan> {
    let intended = value.get("intended_action")?.as_str()?;
    let intended_action = ActionType::from_str_lossy(intended);
    let pedagogy_focus = string_list(value.get("pedagogy_focus"));
    let steps = value
        .get("steps")
        .and_then(|steps| steps.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let action = entry.get("action")?.as_str()?;
                    Some(PlanStep {
                        action: ActionType::from_str_lossy(action),
                        rationale: entry
                            .get("rationale")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_owned(),
                        pedagogy_focus: string_list(entry.get("pedagogy_focus")),
                        target_concept: entry
                            .get("target_concept")
                            .and_then(|v| v.as_str())
                            .map(str::trim)
                            .filter(|v| !v.is_empty())
                            .map(String::from),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Some(Plan {
        intended_action,
        rationale: value
            .get("rationale")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned(),
        confidence: clamp_unit(value.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.6)),
        retrieval_query: value
            .get("retrieval_query")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(focus_concept.unwrap_or_default())
            .to_owned(),
        pedagogy_focus: if pedagogy_focus.is_empty() {
            vec!["explanation".into()]
        } else {
            pedagogy_focus
        },
        steps,
        target_sequence: string_list(value.get("target_sequence")),
    })
}

fn plan_to_payload(plan: &Plan) -> JsonValue {
    serde_json::to_value(plan).unwrap_or_else(|_| json!({}))
}

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn format_mastery(mastery_map: &MasteryMap) -> String {
    if mastery_map.is_empty() {
        return "No mastery data".into();
    }
    let mut entries: Vec<(&String, f64)> = mastery_map
        .iter()
        .map(|(concept, snapshot)| (concept, snapshot.mastery.unwrap_or(0.0)))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .iter()
        .take(5)
        .map(|(concept, mastery)| format!("- {concept}: {mastery:.2}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn classification_path(learning_path: &[String]) -> String {
    if learning_path.is_empty() {
        return "none".into();
    }
    learning_path.join(", ")
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Trace entry for one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub index: usize,
    pub action: ActionType,
    pub query: String,
    pub roles: Vec<String>,
    pub chunk_ids: Vec<String>,
}

/// Result of running a multi-step plan.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub text: String,
    pub confidence: f64,
    pub source_chunk_ids: Vec<String>,
    pub last_action: ActionType,
    /// Union of all chunks retrieved across steps, first occurrence kept.
    pub chunks: Vec<RankedChunk>,
    pub trace: Vec<StepTrace>,
}

/// Execute the plan's steps in declared order.
///
/// Each step re-queries the ranker with its own sub-query — the step's target
/// concept, then the plan's retrieval query, then the focus concept, and only
/// as a last resort the raw message — and accumulates its chunk ids and roles
/// into the step trace alongside its response fragment.
#[allow(clippy::too_many_arguments)]
pub async fn execute_plan_steps(
    capability: &CapabilityClient,
    plan: &Plan,
    focus_concept: Option<&str>,
    level: ConceptLevel,
    message: &str,
    pool: &[ChunkCandidate],
    scope: Option<&str>,
    retrieval_config: &RetrievalConfig,
    srl_config: &SrlConfig,
) -> StepExecution {
    let weights = RankWeights::from_config(retrieval_config);
    let mut text_parts: Vec<String> = Vec::new();
    let mut confidences: Vec<f64> = Vec::new();
    let mut source_chunk_ids: Vec<String> = Vec::new();
    let mut union_chunks: Vec<RankedChunk> = Vec::new();
    let mut trace: Vec<StepTrace> = Vec::new();
    let mut last_action = plan.intended_action;

    for (index, step) in plan.steps.iter().take(srl_config.max_steps).enumerate() {
        let query = step
            .target_concept
            .as_deref()
            .filter(|q| !q.is_empty())
            .or_else(|| Some(plan.retrieval_query.as_str()).filter(|q| !q.is_empty()))
            .or(focus_concept)
            .unwrap_or(message);
        let roles = if step.pedagogy_focus.is_empty() {
            plan.pedagogy_focus.clone()
        } else {
            step.pedagogy_focus.clone()
        };

        let step_chunks = retrieve_for_step(
            capability,
            query,
            &roles,
            pool,
            scope,
            weights,
            retrieval_config,
        )
        .await;

        for chunk in &step_chunks {
            if !union_chunks.iter().any(|existing| existing.id == chunk.id) {
                union_chunks.push(chunk.clone());
            }
        }

        let fragment = generate_action(
            capability,
            step.action,
            focus_concept,
            level,
            &step_chunks,
            message,
            Some(plan),
        )
        .await;

        if !fragment.text.is_empty() {
            text_parts.push(fragment.text.trim().to_owned());
        }
        confidences.push(fragment.confidence);
        for id in fragment.source_chunk_ids {
            if !source_chunk_ids.contains(&id) {
                source_chunk_ids.push(id);
            }
        }

        trace.push(StepTrace {
            index,
            action: step.action,
            query: query.to_owned(),
            roles,
            chunk_ids: step_chunks.iter().map(|chunk| chunk.id.clone()).collect(),
        });
        last_action = step.action;
    }

    let confidence = if confidences.is_empty() {
        0.6
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    StepExecution {
        text: text_parts.join("\n\n"),
        confidence,
        source_chunk_ids,
        last_action,
        chunks: union_chunks,
        trace,
    }
}

/// Per-step retrieval. A failed ranking (empty pool, embed failure) yields an
/// empty chunk set rather than aborting the step.
async fn retrieve_for_step(
    capability: &CapabilityClient,
    query: &str,
    roles: &[String],
    pool: &[ChunkCandidate],
    scope: Option<&str>,
    weights: RankWeights,
    config: &RetrievalConfig,
) -> Vec<RankedChunk> {
    let query_embedding = capability.embed(query).await.ok();
    let outcome = match retrieval::rank(
        query,
        query_embedding.as_deref(),
        pool,
        weights,
        scope,
        config.default_k.max(5),
        config,
    ) {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(%error, query, "step retrieval degraded to empty set");
            return Vec::new();
        }
    };
    let mut chunks = retrieval::filter_relevant(outcome.chunks, config);
    retrieval::boost_by_pedagogy(&mut chunks, roles);
    let mut chunks = retrieval::diversify_by_page(chunks, config.per_page);
    chunks.truncate(config.default_k);
    chunks
}

// ---------------------------------------------------------------------------
// Critique
// ---------------------------------------------------------------------------

/// Critique an assembled response against the plan that produced it.
pub async fn critique_response(
    capability: &CapabilityClient,
    plan: &Plan,
    response: &str,
    level: ConceptLevel,
) -> Critique {
    let prompt = format!(
        "Critique this tutoring response against its plan.\n\
         Intended action: {} | Plan rationale: {}\n\
         Student level: {level}\n\
         Response:\n{response}\n\
         Respond with JSON: {{\"quality\": number in [0,1], \"issues\": [string], \
         \"suggestions\": [string], \"should_revise\": bool, \"reasoning\": string}}",
        plan.intended_action, plan.rationale,
    );
    let default_payload = json!({
        "quality": 0.7,
        "issues": [],
        "suggestions": [],
        "should_revise": false,
        "reasoning": "Response seems adequate.",
    });
    let result = capability.complete_json_or(&prompt, default_payload).await;

    Critique {
        quality: clamp_unit(result.get("quality").and_then(|v| v.as_f64()).unwrap_or(0.7)),
        should_revise: Some(
            result
                .get("should_revise")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        ),
        issues: string_list(result.get("issues")),
        suggestions: string_list(result.get("suggestions")),
        reasoning: result
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned(),
    }
}
