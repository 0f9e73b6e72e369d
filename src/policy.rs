//! Action policy: per-session state, mastery levels, prerequisite gating,
//! and the decision state machine.
//!
//! The decision walks an explicit state trajectory
//! (`AwaitingDecision → Planned → Executing → Gated | Applied`) so the gating
//! invariant is checkable from the recorded trajectory rather than inferred
//! from nested conditionals. Rule order: caller override (subject to the hard
//! prerequisite gate), cold start, consecutive-explain ceiling, prerequisite
//! review, planner intention, rule table.

use crate::classify::{Affect, Intent};
use crate::config::PolicyConfig;

use serde::{Deserialize, Serialize};

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Action vocabulary
// ---------------------------------------------------------------------------

/// The pedagogical move taken for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Explain,
    Ask,
    Hint,
    Reflect,
    WorkedExample,
    Review,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        Self::Explain,
        Self::Ask,
        Self::Hint,
        Self::Reflect,
        Self::WorkedExample,
        Self::Review,
    ];

    /// Parse from a string, defaulting to Explain.
    pub fn from_str_lossy(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "ask" => Self::Ask,
            "hint" => Self::Hint,
            "reflect" => Self::Reflect,
            "worked_example" => Self::WorkedExample,
            "review" => Self::Review,
            _ => Self::Explain,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explain => write!(f, "explain"),
            Self::Ask => write!(f, "ask"),
            Self::Hint => write!(f, "hint"),
            Self::Reflect => write!(f, "reflect"),
            Self::WorkedExample => write!(f, "worked_example"),
            Self::Review => write!(f, "review"),
        }
    }
}

/// The decision taken for a turn, with enough bookkeeping for the reward
/// scorer to audit it. `override_type` differs from `applied_type` only when
/// the hard gate rejected the override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub applied_type: ActionType,
    pub override_type: Option<ActionType>,
    pub confidence: f64,
    pub cold_start: bool,
    /// Must be a subset of the observation's retrieved chunk ids.
    pub source_chunk_ids: Vec<String>,
    /// Set by the policy when its own gate fired. The reward scorer
    /// re-derives this independently from the mastery snapshot.
    pub prereq_gating_failed: bool,
    pub concept: Option<String>,
    pub level: ConceptLevel,
}

// ---------------------------------------------------------------------------
// Mastery levels
// ---------------------------------------------------------------------------

/// Learner level for a concept, bucketed from the mastery score.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConceptLevel {
    #[default]
    Beginner,
    Developing,
    Proficient,
    Mastering,
}

impl ConceptLevel {
    /// Bucket a mastery score. Absent mastery is a beginner.
    pub fn from_mastery(mastery: Option<f64>) -> Self {
        match mastery {
            Some(score) if score >= 0.8 => Self::Mastering,
            Some(score) if score >= 0.6 => Self::Proficient,
            Some(score) if score >= 0.3 => Self::Developing,
            Some(_) => Self::Beginner,
            None => Self::Beginner,
        }
    }
}

impl std::fmt::Display for ConceptLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Beginner => write!(f, "beginner"),
            Self::Developing => write!(f, "developing"),
            Self::Proficient => write!(f, "proficient"),
            Self::Mastering => write!(f, "mastering"),
        }
    }
}

/// Mastery state for one (user, concept) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterySnapshot {
    pub mastery: Option<f64>,
    pub attempts: u32,
    pub correct: u32,
}

/// Per-user mastery keyed by concept.
pub type MasteryMap = HashMap<String, MasterySnapshot>;

/// Pedagogy roles to retrieve for, ordered by priority for the level.
pub fn role_sequence_for_level(level: ConceptLevel) -> Vec<String> {
    let roles: &[&str] = match level {
        ConceptLevel::Beginner | ConceptLevel::Developing => {
            &["definition", "explanation", "example"]
        }
        ConceptLevel::Proficient => &["example", "application", "derivation"],
        ConceptLevel::Mastering => &["derivation", "proof", "application"],
    };
    roles.iter().map(|role| (*role).to_owned()).collect()
}

// ---------------------------------------------------------------------------
// Session policy state
// ---------------------------------------------------------------------------

/// The only shared mutable state in the pipeline. One instance per session,
/// accessed through the session registry's serialized handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SessionPolicy {
    pub learning_path: Vec<String>,
    pub focus_concept: Option<String>,
    pub focus_level: Option<ConceptLevel>,
    pub cold_start: bool,
    pub cold_start_completed: Vec<String>,
    pub consecutive_explains: u32,
    pub last_action: Option<ActionType>,
}

impl SessionPolicy {
    pub fn mark_cold_start(&mut self, concept: Option<&str>) {
        if let Some(concept) = concept
            && !self.cold_start_completed.iter().any(|done| done == concept)
        {
            self.cold_start_completed.push(concept.to_owned());
        }
        self.cold_start = true;
    }

    /// Track consecutive explains so the ceiling can force an assessment.
    pub fn update_action(&mut self, action: ActionType) {
        if action == ActionType::Explain {
            if self.last_action == Some(ActionType::Explain) {
                self.consecutive_explains += 1;
            } else {
                self.consecutive_explains = 1;
            }
        } else {
            self.consecutive_explains = 0;
        }
        self.last_action = Some(action);
    }
}

/// Whether the focus concept still needs its introductory turn.
pub fn needs_cold_start(
    concept: Option<&str>,
    mastery_map: &MasteryMap,
    policy: &SessionPolicy,
    config: &PolicyConfig,
) -> bool {
    let Some(concept) = concept else {
        return false;
    };
    if policy.cold_start_completed.iter().any(|done| done == concept) {
        return false;
    }
    match mastery_map.get(concept) {
        None => true,
        Some(snapshot) => {
            snapshot.attempts < 1
                || snapshot.mastery.unwrap_or(0.0) < config.cold_start_mastery_floor
        }
    }
}

/// Pick the concept this turn should teach: the classifier's concept while it
/// is unmastered, else the first unfinished learning-path entry, else the
/// first fallback target.
pub fn select_focus_concept(
    classifier_concept: &str,
    learning_path: &[String],
    mastery_map: &MasteryMap,
    fallback_concepts: &[String],
    config: &PolicyConfig,
) -> Option<String> {
    let primary = classifier_concept.trim();
    if !primary.is_empty() {
        let mastered = mastery_map
            .get(primary)
            .and_then(|snapshot| snapshot.mastery)
            .is_some_and(|mastery| mastery >= config.focus_mastered_cutoff);
        if !mastered {
            return Some(primary.to_owned());
        }
    }
    for concept in learning_path {
        let mastery = mastery_map.get(concept).and_then(|snapshot| snapshot.mastery);
        if mastery.is_none_or(|value| value < config.path_advance_cutoff) {
            return Some(concept.clone());
        }
    }
    if let Some(fallback) = fallback_concepts.iter().find(|concept| !concept.is_empty()) {
        return Some(fallback.clone());
    }
    if !primary.is_empty() {
        return Some(primary.to_owned());
    }
    learning_path.first().cloned()
}

// ---------------------------------------------------------------------------
// Prerequisite checking
// ---------------------------------------------------------------------------

/// Readiness verdict for a target concept against the learning path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrerequisiteCheck {
    pub ready: bool,
    pub confidence: f64,
    pub missing_prereqs: Vec<String>,
    pub weak_prereqs: Vec<String>,
    pub recommendation: String,
    pub should_review: bool,
}

impl PrerequisiteCheck {
    /// A check that always passes, used when gating is disabled or the
    /// concept has no known position in the path.
    pub fn ready() -> Self {
        Self {
            ready: true,
            confidence: 1.0,
            recommendation: "Student is ready for this concept".into(),
            ..Default::default()
        }
    }
}

/// Walks the learning path up to the target concept and buckets each
/// prerequisite as missing, weak, or satisfied.
#[derive(Debug, Clone)]
pub struct PrerequisiteChecker {
    mastery_threshold: f64,
    weak_threshold: f64,
}

impl PrerequisiteChecker {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            mastery_threshold: config.prereq_mastery_threshold,
            weak_threshold: config.prereq_weak_threshold,
        }
    }

    pub fn check_readiness(
        &self,
        concept: &str,
        learning_path: &[String],
        mastery_map: &MasteryMap,
    ) -> PrerequisiteCheck {
        let prereqs: &[String] = match learning_path.iter().position(|entry| entry == concept) {
            Some(index) => &learning_path[..index],
            None => &[],
        };

        let mut missing = Vec::new();
        let mut weak = Vec::new();
        for prereq in prereqs {
            let mastery = mastery_map
                .get(prereq)
                .and_then(|snapshot| snapshot.mastery)
                .unwrap_or(0.0);
            if mastery == 0.0 {
                missing.push(prereq.clone());
            } else if mastery < self.weak_threshold || mastery < self.mastery_threshold {
                weak.push(prereq.clone());
            }
        }

        if !missing.is_empty() {
            let recommendation = format!(
                "Review prerequisites first: {}",
                missing.iter().take(2).cloned().collect::<Vec<_>>().join(", ")
            );
            return PrerequisiteCheck {
                ready: false,
                confidence: 0.0,
                missing_prereqs: missing,
                weak_prereqs: weak,
                recommendation,
                should_review: true,
            };
        }
        if weak.len() > 2 {
            let recommendation = format!(
                "Strengthen understanding of: {}",
                weak.iter().take(2).cloned().collect::<Vec<_>>().join(", ")
            );
            return PrerequisiteCheck {
                ready: false,
                confidence: 0.3,
                missing_prereqs: missing,
                weak_prereqs: weak,
                recommendation,
                should_review: true,
            };
        }
        if !weak.is_empty() {
            let recommendation = format!("Proceed with caution; review {} if needed", weak[0]);
            return PrerequisiteCheck {
                ready: true,
                confidence: 0.7,
                missing_prereqs: missing,
                weak_prereqs: weak,
                recommendation,
                should_review: false,
            };
        }
        PrerequisiteCheck::ready()
    }
}

// ---------------------------------------------------------------------------
// Decision state machine
// ---------------------------------------------------------------------------

/// States the decision passes through. Recorded on the decision so tests can
/// assert the gate actually fired rather than trusting the outcome flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    AwaitingDecision,
    Planned,
    Executing,
    Gated,
    Applied,
}

/// Why the applied action was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCause {
    OverrideApplied,
    OverrideGated,
    ColdStart,
    ExplainCeiling,
    PrereqReview,
    PlannerChoice,
    RuleTable,
}

/// Inputs to one decision.
#[derive(Debug)]
pub struct DecisionContext<'a> {
    pub override_type: Option<ActionType>,
    pub planned_type: Option<ActionType>,
    pub cold_start: bool,
    pub consecutive_explains: u32,
    pub intent: Intent,
    pub affect: Affect,
    pub level: ConceptLevel,
    pub prereq: &'a PrerequisiteCheck,
    pub config: &'a PolicyConfig,
}

/// The resolved decision plus its state trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub applied_type: ActionType,
    pub override_type: Option<ActionType>,
    pub cause: DecisionCause,
    pub prereq_gating_failed: bool,
    pub trajectory: Vec<DecisionStage>,
}

/// Resolve the action for a turn.
///
/// When both an override and a plan are present and the gate passes, the
/// override wins — an explicit caller request outranks self-planning. The
/// plan still travels on the trace for training signal.
pub fn decide(context: &DecisionContext<'_>) -> Decision {
    let mut trajectory = vec![DecisionStage::AwaitingDecision];
    if context.planned_type.is_some() {
        trajectory.push(DecisionStage::Planned);
    }
    trajectory.push(DecisionStage::Executing);

    if let Some(requested) = context.override_type {
        let gate_blocks = requested != ActionType::Review
            && context.prereq.should_review
            && !context.prereq.missing_prereqs.is_empty();
        if gate_blocks {
            trajectory.push(DecisionStage::Gated);
            return Decision {
                applied_type: ActionType::Review,
                override_type: Some(requested),
                cause: DecisionCause::OverrideGated,
                prereq_gating_failed: true,
                trajectory,
            };
        }
        trajectory.push(DecisionStage::Applied);
        return Decision {
            applied_type: requested,
            override_type: Some(requested),
            cause: DecisionCause::OverrideApplied,
            prereq_gating_failed: false,
            trajectory,
        };
    }

    let (applied, cause) = if context.cold_start && context.config.cold_start_enabled {
        // The first encounter with a concept always opens with an
        // introductory explanation, whatever the classifier saw.
        (ActionType::Explain, DecisionCause::ColdStart)
    } else if context.consecutive_explains >= context.config.consecutive_explain_ceiling {
        let action = match context.intent {
            Intent::Answer | Intent::Reflection => ActionType::Reflect,
            _ => ActionType::Ask,
        };
        (action, DecisionCause::ExplainCeiling)
    } else if context.prereq.should_review && !context.prereq.missing_prereqs.is_empty() {
        (ActionType::Review, DecisionCause::PrereqReview)
    } else if let Some(planned) = context.planned_type {
        (planned, DecisionCause::PlannerChoice)
    } else {
        (
            rule_table(context.intent, context.affect, context.level),
            DecisionCause::RuleTable,
        )
    };

    trajectory.push(DecisionStage::Applied);
    Decision {
        applied_type: applied,
        override_type: None,
        cause,
        prereq_gating_failed: false,
        trajectory,
    }
}

/// Fallback action table keyed on (intent, affect, mastery bucket).
fn rule_table(intent: Intent, affect: Affect, level: ConceptLevel) -> ActionType {
    if affect.is_struggling() {
        return if level == ConceptLevel::Beginner {
            ActionType::Explain
        } else {
            ActionType::Hint
        };
    }
    match intent {
        Intent::Answer => ActionType::Reflect,
        Intent::Reflection => ActionType::Ask,
        Intent::Question => {
            if level >= ConceptLevel::Proficient {
                ActionType::WorkedExample
            } else {
                ActionType::Explain
            }
        }
        Intent::Greeting => ActionType::Ask,
        Intent::OffTopic => ActionType::Review,
        Intent::Unknown => ActionType::Explain,
    }
}
