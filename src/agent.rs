//! The tutor turn pipeline.
//!
//! One call per learner message: classify, assemble context, decide the
//! pedagogical action, generate the response (optionally through the SRL
//! plan/execute/critique loop), persist the turn, and return the outcome
//! with its full observation for downstream scoring.
//!
//! Concurrency: the session lock is held from the first counter read to the
//! final policy write, so concurrent turns for one session serialize while
//! different sessions run in parallel.

use crate::capability::CapabilityClient;
use crate::classify::classify_message;
use crate::config::TutorConfig;
use crate::error::{Result, TutorError};
use crate::observation::{Observation, ObservationBuilder};
use crate::policy::{
    Action, ActionType, ConceptLevel, DecisionCause, DecisionContext, MasteryMap,
    PrerequisiteCheck, PrerequisiteChecker, decide, needs_cold_start, role_sequence_for_level,
    select_focus_concept,
};
use crate::respond::{GeneratedResponse, generate_action, generate_prereq_review};
use crate::retrieval::{self, RankWeights, RankedChunk};
use crate::session::SessionRegistry;
use crate::srl::{self, Critique, Plan, StepTrace};
use crate::store::TutorStore;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use std::sync::Arc;

/// One turn request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TurnRequest {
    pub message: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub resource_id: Option<String>,
    pub target_concepts: Vec<String>,
    pub action_override: Option<ActionType>,
    /// Enable the self-reflective plan/execute/critique loop for this turn.
    pub srl: bool,
}

/// One stage of the turn's progress trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub stage: String,
    pub detail: JsonValue,
}

/// Everything a turn produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub turn_id: String,
    pub turn_index: u64,
    pub response_text: String,
    pub action: Action,
    pub cold_start: bool,
    pub plan: Option<Plan>,
    pub critique: Option<Critique>,
    /// Regenerations performed this turn; bounded by the revision budget.
    pub revisions: u32,
    pub step_trace: Vec<StepTrace>,
    pub progress: Vec<ProgressEntry>,
    pub observation: Observation,
}

/// The tutor agent. Cheap to share; all state lives in the store and the
/// session registry.
pub struct TutorAgent {
    store: Arc<TutorStore>,
    capability: Arc<CapabilityClient>,
    config: TutorConfig,
    sessions: SessionRegistry,
    checker: PrerequisiteChecker,
}

impl TutorAgent {
    pub fn new(
        store: Arc<TutorStore>,
        capability: Arc<CapabilityClient>,
        config: TutorConfig,
    ) -> Self {
        let checker = PrerequisiteChecker::from_config(&config.policy);
        Self {
            store,
            capability,
            config,
            sessions: SessionRegistry::new(),
            checker,
        }
    }

    pub fn store(&self) -> &Arc<TutorStore> {
        &self.store
    }

    pub fn capability(&self) -> &Arc<CapabilityClient> {
        &self.capability
    }

    pub fn config(&self) -> &TutorConfig {
        &self.config
    }

    /// Run one tutoring turn.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let message = request.message.trim().to_owned();
        if message.is_empty() {
            return Err(TutorError::MissingContext("message is required"));
        }
        if request.user_id.trim().is_empty() {
            return Err(TutorError::MissingContext(
                "user_id is required for mastery tracking",
            ));
        }

        let session_id = self
            .store
            .ensure_session(
                &request.user_id,
                request.session_id.as_deref(),
                &request.target_concepts,
                request.resource_id.as_deref(),
            )
            .await?;

        // Single atomic section per session: counter reads, the decision, and
        // the policy write all happen under this lock.
        let handle = self.sessions.handle(&session_id);
        let _guard = handle.lock().await;

        let session = self
            .store
            .get_session(&session_id)
            .await?
            .ok_or_else(|| TutorError::Config(format!("session {session_id} vanished")))?;
        let turn_index = self.store.next_turn_index(&session_id).await?;
        let resource_id = request.resource_id.clone().or(session.resource_id.clone());
        let targets = if request.target_concepts.is_empty() {
            session.target_concepts.clone()
        } else {
            request.target_concepts.clone()
        };

        let mut progress: Vec<ProgressEntry> = Vec::new();

        let classification = classify_message(
            &self.capability,
            &message,
            &targets,
            session.last_concept.as_deref(),
        )
        .await;
        progress.push(ProgressEntry {
            stage: "classification".into(),
            detail: json!({
                "intent": classification.intent.to_string(),
                "affect": classification.affect.to_string(),
                "concept": classification.concept,
                "confidence": classification.confidence,
            }),
        });

        let mastery_map = self.store.fetch_mastery_map(&request.user_id).await?;
        let mut seeds: Vec<String> = Vec::new();
        if !classification.concept.is_empty() {
            seeds.push(classification.concept.clone());
        }
        seeds.extend(targets.iter().cloned());
        let learning_path = self.store.fetch_prereq_chain(&seeds, 4).await?;

        let focus_concept = select_focus_concept(
            &classification.concept,
            &learning_path,
            &mastery_map,
            &targets,
            &self.config.policy,
        );
        let concept_level = ConceptLevel::from_mastery(
            focus_concept
                .as_deref()
                .and_then(|concept| mastery_map.get(concept))
                .and_then(|snapshot| snapshot.mastery),
        );

        let prereq = match focus_concept.as_deref() {
            Some(focus) => self.checker.check_readiness(focus, &learning_path, &mastery_map),
            None => PrerequisiteCheck::ready(),
        };
        let mut policy = session.policy.clone();
        let cold_start = needs_cold_start(
            focus_concept.as_deref(),
            &mastery_map,
            &policy,
            &self.config.policy,
        );

        tracing::info!(
            session_id = %session_id,
            turn_index,
            focus_concept = focus_concept.as_deref().unwrap_or(""),
            %concept_level,
            prereq_ready = prereq.ready,
            cold_start,
            "policy stage resolved"
        );

        // Plan before retrieval so the plan's query can guide it.
        let plan: Option<Plan> = if request.srl {
            let plan = srl::generate_plan(
                &self.capability,
                &message,
                &classification,
                focus_concept.as_deref(),
                concept_level,
                &learning_path,
                &mastery_map,
                policy.last_action,
                &self.config.srl,
            )
            .await;
            progress.push(ProgressEntry {
                stage: "planning".into(),
                detail: json!({
                    "intended_action": plan.intended_action.to_string(),
                    "confidence": plan.confidence,
                    "steps": plan.steps.len(),
                }),
            });
            Some(plan)
        } else {
            None
        };

        // Retrieval. An empty scope is a hard error — the learner gets an
        // explicit "no material" failure, never a silent empty context.
        let pool = self.store.fetch_candidates(resource_id.as_deref()).await?;
        let role_sequence = plan
            .as_ref()
            .map(|plan| plan.pedagogy_focus.clone())
            .filter(|roles| !roles.is_empty())
            .unwrap_or_else(|| role_sequence_for_level(concept_level));
        let query = plan
            .as_ref()
            .map(|plan| plan.retrieval_query.clone())
            .filter(|query| !query.is_empty())
            .or_else(|| focus_concept.clone())
            .unwrap_or_else(|| message.clone());
        let chunks = self
            .retrieve(&query, &role_sequence, &pool, resource_id.as_deref())
            .await?;
        progress.push(ProgressEntry {
            stage: "retrieval".into(),
            detail: json!({
                "query": query,
                "roles": role_sequence,
                "count": chunks.len(),
                "chunk_ids": chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            }),
        });

        let decision = decide(&DecisionContext {
            override_type: request.action_override,
            planned_type: plan.as_ref().map(|plan| plan.intended_action),
            cold_start,
            consecutive_explains: policy.consecutive_explains,
            intent: classification.intent,
            affect: classification.affect,
            level: concept_level,
            prereq: &prereq,
            config: &self.config.policy,
        });
        progress.push(ProgressEntry {
            stage: "decision".into(),
            detail: json!({
                "applied_type": decision.applied_type.to_string(),
                "cause": decision.cause,
                "gated": decision.prereq_gating_failed,
            }),
        });

        // Generate the response along the path the decision picked.
        let mut applied_type = decision.applied_type;
        let mut observation_chunks = chunks.clone();
        let mut step_trace: Vec<StepTrace> = Vec::new();
        let mut generated: GeneratedResponse = match decision.cause {
            DecisionCause::OverrideGated | DecisionCause::PrereqReview => {
                let prereq_chunks = match prereq.missing_prereqs.first() {
                    Some(prereq_concept) => {
                        let roles = vec!["definition".to_owned(), "explanation".to_owned()];
                        match self
                            .retrieve(prereq_concept, &roles, &pool, resource_id.as_deref())
                            .await
                        {
                            Ok(chunks) => chunks,
                            Err(_) => chunks.clone(),
                        }
                    }
                    None => chunks.clone(),
                };
                for chunk in &prereq_chunks {
                    if !observation_chunks.iter().any(|existing| existing.id == chunk.id) {
                        observation_chunks.push(chunk.clone());
                    }
                }
                generate_prereq_review(
                    &self.capability,
                    focus_concept.as_deref(),
                    &prereq.missing_prereqs,
                    &prereq_chunks,
                )
                .await
            }
            DecisionCause::PlannerChoice
                if plan.as_ref().is_some_and(|plan| plan.steps.len() >= 2) =>
            {
                let plan_ref = plan.as_ref().expect("planner choice implies a plan");
                let execution = srl::execute_plan_steps(
                    &self.capability,
                    plan_ref,
                    focus_concept.as_deref(),
                    concept_level,
                    &message,
                    &pool,
                    resource_id.as_deref(),
                    &self.config.retrieval,
                    &self.config.srl,
                )
                .await;
                for chunk in &execution.chunks {
                    if !observation_chunks.iter().any(|existing| existing.id == chunk.id) {
                        observation_chunks.push(chunk.clone());
                    }
                }
                applied_type = execution.last_action;
                step_trace = execution.trace.clone();
                for entry in &execution.trace {
                    progress.push(ProgressEntry {
                        stage: "step".into(),
                        detail: json!({
                            "index": entry.index,
                            "action": entry.action.to_string(),
                            "query": entry.query,
                            "retrieved": entry.chunk_ids.len(),
                        }),
                    });
                }
                GeneratedResponse {
                    text: execution.text,
                    confidence: execution.confidence,
                    source_chunk_ids: execution.source_chunk_ids,
                }
            }
            _ => {
                generate_action(
                    &self.capability,
                    applied_type,
                    focus_concept.as_deref(),
                    concept_level,
                    &chunks,
                    &message,
                    plan.as_ref(),
                )
                .await
            }
        };

        if decision.cause == DecisionCause::ColdStart {
            policy.mark_cold_start(focus_concept.as_deref());
            self.store
                .log_event(
                    &session_id,
                    "cold_start_triggered",
                    Some(&json!({"concept": focus_concept})),
                )
                .await?;
        }

        // Critique and the single bounded revision.
        let mut critique: Option<Critique> = None;
        let mut revisions: u32 = 0;
        if request.srl
            && self.config.srl.self_critique
            && let Some(plan_ref) = plan.as_ref()
        {
            let mut verdict = srl::critique_response(
                &self.capability,
                plan_ref,
                &generated.text,
                concept_level,
            )
            .await;
            progress.push(ProgressEntry {
                stage: "critique".into(),
                detail: json!({
                    "quality": verdict.quality,
                    "should_revise": verdict.should_revise,
                }),
            });
            if verdict.should_revise == Some(true) && revisions < self.config.srl.revision_budget {
                revisions += 1;
                generated = generate_action(
                    &self.capability,
                    applied_type,
                    focus_concept.as_deref(),
                    concept_level,
                    &chunks,
                    &message,
                    plan.as_ref(),
                )
                .await;
                // One revision per turn. The second critique is recorded but
                // can no longer trigger a regeneration.
                verdict = srl::critique_response(
                    &self.capability,
                    plan_ref,
                    &generated.text,
                    concept_level,
                )
                .await;
                progress.push(ProgressEntry {
                    stage: "critique".into(),
                    detail: json!({
                        "quality": verdict.quality,
                        "should_revise": verdict.should_revise,
                        "revision": revisions,
                    }),
                });
            }
            critique = Some(verdict);
        }

        // Decision-time counter value travels into the observation; the
        // updated value is what the next turn reads.
        let consecutive_before = policy.consecutive_explains;
        policy.learning_path = learning_path.clone();
        policy.focus_concept = focus_concept.clone();
        policy.focus_level = Some(concept_level);
        policy.cold_start = decision.cause == DecisionCause::ColdStart;
        policy.update_action(applied_type);

        let turn_id = self
            .store
            .insert_turn(
                &session_id,
                turn_index,
                &message,
                &classification.intent.to_string(),
                &classification.affect.to_string(),
                focus_concept.as_deref(),
                applied_type,
                &generated.text,
                &generated.source_chunk_ids,
                generated.confidence,
            )
            .await?;
        self.store
            .update_session(&session_id, focus_concept.as_deref(), applied_type, &policy)
            .await?;

        let action = Action {
            applied_type,
            override_type: decision.override_type,
            confidence: generated.confidence,
            cold_start: decision.cause == DecisionCause::ColdStart,
            source_chunk_ids: generated.source_chunk_ids.clone(),
            prereq_gating_failed: decision.prereq_gating_failed,
            concept: focus_concept.clone(),
            level: concept_level,
        };

        let observation = ObservationBuilder {
            message: message.clone(),
            user_id: request.user_id.clone(),
            target_concepts: targets,
            classification: Some(classification.clone()),
            retrieval_query: Some(query),
            pedagogy_roles: role_sequence,
            chunks: observation_chunks,
            focus_concept: focus_concept.clone(),
            concept_level,
            learning_path: learning_path.clone(),
            mastery_snapshot: focus_concept
                .as_deref()
                .and_then(|concept| mastery_map.get(concept))
                .cloned(),
            path_mastery: path_mastery(&mastery_map, &learning_path),
            cold_start: decision.cause == DecisionCause::ColdStart,
            consecutive_explains: consecutive_before,
            session_id: session_id.clone(),
            turn_index,
            resource_id: resource_id.clone(),
        }
        .build()?;

        tracing::info!(
            session_id = %session_id,
            %turn_id,
            turn_index,
            action = %applied_type,
            intent = %observation.classifier.intent,
            confidence = generated.confidence,
            cold_start = action.cold_start,
            "turn committed"
        );

        Ok(TurnOutcome {
            session_id,
            turn_id,
            turn_index,
            response_text: generated.text,
            action,
            cold_start: decision.cause == DecisionCause::ColdStart,
            plan,
            critique,
            revisions,
            step_trace,
            progress,
            observation,
        })
    }

    /// Rank, filter, and shape the candidate pool for one query.
    async fn retrieve(
        &self,
        query: &str,
        roles: &[String],
        pool: &[crate::retrieval::ChunkCandidate],
        scope: Option<&str>,
    ) -> Result<Vec<RankedChunk>> {
        let config = &self.config.retrieval;
        let query_embedding = self.capability.embed(query).await.ok();
        let outcome = retrieval::rank(
            query,
            query_embedding.as_deref(),
            pool,
            RankWeights::from_config(config),
            scope,
            config.default_k.max(5),
            config,
        )?;
        let mut chunks = retrieval::filter_relevant(outcome.chunks, config);
        retrieval::boost_by_pedagogy(&mut chunks, roles);
        let mut chunks = retrieval::diversify_by_page(chunks, config.per_page);
        chunks.truncate(config.default_k);
        Ok(chunks)
    }
}

impl std::fmt::Debug for TutorAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TutorAgent")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

/// Mastery snapshot restricted to the learning-path concepts.
fn path_mastery(mastery_map: &MasteryMap, learning_path: &[String]) -> MasteryMap {
    learning_path
        .iter()
        .filter_map(|concept| {
            mastery_map
                .get(concept)
                .map(|snapshot| (concept.clone(), snapshot.clone()))
        })
        .collect()
}
