//! Multi-component reward scoring.
//!
//! A pure function of (observation, action, response text, execution trace).
//! Each component is computed independently so a single bad signal cannot
//! silently zero out the others; the total is the normalized fixed-weight sum
//! clamped to [0,1]. The gating component re-derives prerequisite
//! satisfaction from the mastery data instead of trusting the policy's own
//! flag — the scorer audits the policy, it doesn't echo it.

mod gating;
mod grounding;
mod intent;
mod rubric;
mod style;

pub use gating::gating_check;
pub use grounding::grounding_check;
pub use intent::intent_alignment;
pub use rubric::rubric_check;
pub use style::style_check;

use crate::config::{NormalizedWeights, RewardWeights, ValidatorConfig};
use crate::observation::Observation;
use crate::policy::{Action, PrerequisiteChecker};
use crate::srl::StepTrace;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Flag set when grounding collapses while the response still asserts
/// specifics absent from every retrieved snippet.
pub const HALLUCINATION_FLAG: &str = "hallucination_flag";

/// One component's verdict. `score` is `None` when the component does not
/// apply to this turn (e.g. grounding with no retrieval at all); inapplicable
/// components drop out of the total instead of dragging it down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentResult {
    pub name: String,
    pub score: Option<f64>,
    pub flags: Vec<String>,
    pub details: JsonValue,
}

impl ComponentResult {
    pub(crate) fn new(name: &str, score: f64) -> Self {
        Self {
            name: name.to_owned(),
            score: Some(round4(score.clamp(0.0, 1.0))),
            flags: Vec::new(),
            details: JsonValue::Null,
        }
    }

    pub(crate) fn not_applicable(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            score: None,
            flags: Vec::new(),
            details: JsonValue::Null,
        }
    }

    pub(crate) fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}

/// The five component verdicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardComponents {
    pub rubric: ComponentResult,
    pub intent: ComponentResult,
    pub gating: ComponentResult,
    pub grounding: ComponentResult,
    pub style: ComponentResult,
}

impl RewardComponents {
    fn iter(&self) -> [&ComponentResult; 5] {
        [
            &self.rubric,
            &self.intent,
            &self.gating,
            &self.grounding,
            &self.style,
        ]
    }
}

/// The complete reward for one response candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardPayload {
    pub components: RewardComponents,
    /// Normalized weighted sum over applicable components, clamped to [0,1].
    /// `None` only when no component applied at all.
    pub total: Option<f64>,
    pub weights: RewardWeights,
    pub normalized_weights: NormalizedWeights,
    pub flags: Vec<String>,
}

/// Score one response candidate.
pub fn score_response(
    observation: &Observation,
    action: &Action,
    response_text: &str,
    trace: &[StepTrace],
    weights: &RewardWeights,
    validator: &ValidatorConfig,
    prereq_checker: &PrerequisiteChecker,
) -> RewardPayload {
    let components = RewardComponents {
        rubric: rubric_check(observation, action, response_text, trace, validator),
        intent: intent_alignment(observation, action),
        gating: gating_check(observation, action, response_text, validator, prereq_checker),
        grounding: grounding_check(observation, action, response_text),
        style: style_check(response_text, validator),
    };

    let normalized = weights.normalized();
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    let mut flags: Vec<String> = Vec::new();

    for component in components.iter() {
        flags.extend(component.flags.iter().cloned());
        let Some(score) = component.score else {
            continue;
        };
        let weight = component_weight(&normalized, &component.name);
        weighted_sum += score * weight;
        weight_sum += weight;

        let threshold = component_threshold(validator, &component.name);
        if score < threshold {
            flags.push(format!("{}_below_threshold", component.name));
        }
    }

    let total = if weight_sum > f64::EPSILON {
        Some(round4((weighted_sum / weight_sum).clamp(0.0, 1.0)))
    } else {
        None
    };

    // Hallucination: grounding collapsed while the response still asserts
    // specific facts no retrieved snippet contains.
    if components.grounding.score.is_some_and(|score| score < 0.2)
        && grounding::asserts_unsupported_specifics(observation, response_text)
    {
        flags.push(HALLUCINATION_FLAG.to_owned());
    }

    flags.dedup();

    RewardPayload {
        components,
        total,
        weights: weights.clone(),
        normalized_weights: normalized,
        flags,
    }
}

fn component_weight(weights: &NormalizedWeights, name: &str) -> f64 {
    match name {
        "rubric" => weights.rubric,
        "intent" => weights.intent,
        "gating" => weights.gating,
        "grounding" => weights.grounding,
        "style" => weights.style,
        _ => 0.0,
    }
}

fn component_threshold(validator: &ValidatorConfig, name: &str) -> f64 {
    match name {
        "rubric" => validator.thresholds.rubric,
        "intent" => validator.thresholds.intent,
        "gating" => validator.thresholds.gating,
        "grounding" => validator.thresholds.grounding,
        "style" => validator.thresholds.style,
        _ => 0.0,
    }
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}


#[cfg(test)]
mod tests {
    use super::test_support::{action, observation, summary};
    use super::*;
    use crate::config::PolicyConfig;
    use crate::policy::{ActionType, MasterySnapshot};

    fn checker() -> PrerequisiteChecker {
        PrerequisiteChecker::from_config(&PolicyConfig::default())
    }

    fn grounded_response() -> &'static str {
        "Heat flux is the rate of heat energy transfer per unit area, because energy \
         flows from hot to cold regions. For example, a wall conducts heat when the \
         two sides differ in temperature. Can you restate heat flux in your own words?"
    }

    #[test]
    fn total_is_the_normalized_weighted_component_sum() {
        let observation = observation(vec![summary(
            "c-1",
            "heat flux is the rate of heat energy transfer per unit area",
        )]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let weights = RewardWeights::default();
        let payload = score_response(
            &observation,
            &action,
            grounded_response(),
            &[],
            &weights,
            &ValidatorConfig::default(),
            &checker(),
        );

        let normalized = weights.normalized();
        let components = &payload.components;
        let expected = components.rubric.score.unwrap() * normalized.rubric
            + components.intent.score.unwrap() * normalized.intent
            + components.gating.score.unwrap() * normalized.gating
            + components.grounding.score.unwrap() * normalized.grounding
            + components.style.score.unwrap() * normalized.style;
        assert!((payload.total.unwrap() - round4(expected)).abs() < 1e-9);
    }

    #[test]
    fn every_component_is_scored_independently() {
        let observation = observation(vec![summary("c-1", "heat flux definition snippet")]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let payload = score_response(
            &observation,
            &action,
            grounded_response(),
            &[],
            &RewardWeights::default(),
            &ValidatorConfig::default(),
            &checker(),
        );
        for component in payload.components.iter() {
            assert!(component.score.is_some(), "{} missing", component.name);
        }
    }

    #[test]
    fn below_threshold_components_are_flagged() {
        let observation = observation(vec![summary("c-1", "heat flux definition")]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        // A terse response fails rubric and style floors.
        let payload = score_response(
            &observation,
            &action,
            "no.",
            &[],
            &RewardWeights::default(),
            &ValidatorConfig::default(),
            &checker(),
        );
        assert!(payload.flags.iter().any(|f| f == "rubric_below_threshold"));
        assert!(payload.flags.iter().any(|f| f == "response_too_short"));
    }

    #[test]
    fn gating_failure_is_rederived_not_trusted() {
        // The mastery data shows an unmet prerequisite while the applied
        // action barrels ahead with an explain — the scorer must flag it even
        // though the policy's own flag is unset.
        let mut observation = observation(vec![summary("c-1", "heat flux definition")]);
        observation.tutor.path_mastery.insert(
            "temperature".into(),
            MasterySnapshot {
                mastery: Some(0.0),
                attempts: 0,
                correct: 0,
            },
        );
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        assert!(!action.prereq_gating_failed);
        let payload = score_response(
            &observation,
            &action,
            grounded_response(),
            &[],
            &RewardWeights::default(),
            &ValidatorConfig::default(),
            &checker(),
        );
        assert!(payload.flags.iter().any(|f| f == "prereq_gating_failed"));
    }

    #[test]
    fn hallucination_flag_requires_both_conditions() {
        let observation = observation(vec![summary("c-1", "heat flux moves energy")]);
        // Cites a chunk that was never retrieved and asserts a specific
        // number nowhere in the snippets.
        let action = action(ActionType::Explain, vec!["c-999".into()]);
        let payload = score_response(
            &observation,
            &action,
            "Heat flux is always exactly 42 watts per square meter.",
            &[],
            &RewardWeights::default(),
            &ValidatorConfig::default(),
            &checker(),
        );
        assert!(payload.flags.iter().any(|f| f == HALLUCINATION_FLAG));
    }

    #[test]
    fn grounded_response_is_not_flagged_as_hallucination() {
        let observation = observation(vec![summary(
            "c-1",
            "heat flux is the rate of heat energy transfer per unit area",
        )]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let payload = score_response(
            &observation,
            &action,
            grounded_response(),
            &[],
            &RewardWeights::default(),
            &ValidatorConfig::default(),
            &checker(),
        );
        assert!(!payload.flags.iter().any(|f| f == HALLUCINATION_FLAG));
    }

    #[test]
    fn total_stays_in_unit_interval() {
        let observation = observation(vec![summary("c-1", "snippet")]);
        let action = action(ActionType::Ask, vec!["c-1".into()]);
        let payload = score_response(
            &observation,
            &action,
            "Can you explain heat flux in your own words?",
            &[],
            &RewardWeights::default(),
            &ValidatorConfig::default(),
            &checker(),
        );
        let total = payload.total.unwrap();
        assert!((0.0..=1.0).contains(&total));
    }
}
