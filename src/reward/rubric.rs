//! Rubric component: structural adherence of the response.
//!
//! Four shared features — direct answer, example, reasoning, formative
//! close — plus per-action structure: a worked example must show numbered
//! steps, an ask must actually contain a question.

use super::ComponentResult;
use crate::config::ValidatorConfig;
use crate::observation::Observation;
use crate::policy::{Action, ActionType};
use crate::srl::StepTrace;

use regex::Regex;
use serde_json::json;

use std::sync::LazyLock;

static EXAMPLE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bexample\b").expect("hardcoded regex"));

static STEP_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bstep\s*\d").expect("hardcoded regex"));

/// Formative feature carries slightly less weight so a purely declarative
/// turn isn't automatically capped.
const FORMATIVE_WEIGHT: f64 = 0.75;
const WEIGHT_SUM: f64 = 3.0 + FORMATIVE_WEIGHT;

pub fn rubric_check(
    observation: &Observation,
    action: &Action,
    response_text: &str,
    trace: &[StepTrace],
    validator: &ValidatorConfig,
) -> ComponentResult {
    let lowered = response_text.to_lowercase();
    let focus_concept = observation
        .tutor
        .focus_concept
        .as_deref()
        .map(str::to_lowercase);

    let direct_answer = focus_concept
        .as_deref()
        .is_some_and(|concept| !concept.is_empty() && lowered.contains(concept))
        || has_any_marker(&lowered, &validator.direct_answer_markers);
    let example =
        has_any_marker(&lowered, &validator.example_markers) || EXAMPLE_WORD.is_match(&lowered);
    let reasoning = has_any_marker(&lowered, &validator.reasoning_markers);
    let formative = response_text.trim_end().ends_with('?')
        || has_any_marker(&lowered, &validator.suggestion_markers);

    let weighted_total = feature(direct_answer)
        + feature(example)
        + feature(reasoning)
        + feature(formative) * FORMATIVE_WEIGHT;
    let mut score = weighted_total / WEIGHT_SUM;

    let mut flags: Vec<String> = Vec::new();
    match action.applied_type {
        ActionType::WorkedExample if !STEP_MARKER.is_match(&lowered) => {
            score *= 0.5;
            flags.push("missing_worked_steps".into());
        }
        ActionType::Ask if !response_text.contains('?') => {
            score *= 0.5;
            flags.push("missing_followup_question".into());
        }
        _ => {}
    }

    if score < 0.5 {
        flags.push("rubric_incomplete".into());
    }

    ComponentResult::new("rubric", score)
        .with_flags(flags)
        .with_details(json!({
            "focus_concept": observation.tutor.focus_concept,
            "features": {
                "direct_answer": direct_answer,
                "example": example,
                "reasoning": reasoning,
                "formative": formative,
            },
            "steps_executed": trace.len(),
        }))
}

fn feature(present: bool) -> f64 {
    if present { 1.0 } else { 0.0 }
}

fn has_any_marker(lowered: &str, markers: &[String]) -> bool {
    markers.iter().any(|marker| lowered.contains(marker.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::test_support::{action, observation};

    #[test]
    fn complete_response_scores_full() {
        let observation = observation(Vec::new());
        let action = action(ActionType::Explain, Vec::new());
        let result = rubric_check(
            &observation,
            &action,
            "Heat flux is the rate of energy transfer, because hot regions push energy \
             toward cold ones. For example, a wall conducts heat. Can you restate that?",
            &[],
            &ValidatorConfig::default(),
        );
        assert_eq!(result.score, Some(1.0));
    }

    #[test]
    fn bare_statement_scores_low() {
        let observation = observation(Vec::new());
        let action = action(ActionType::Explain, Vec::new());
        let result = rubric_check(
            &observation,
            &action,
            "Thermodynamics chapter three.",
            &[],
            &ValidatorConfig::default(),
        );
        assert!(result.score.unwrap() < 0.5);
        assert!(result.flags.iter().any(|f| f == "rubric_incomplete"));
    }

    #[test]
    fn worked_example_without_steps_is_halved() {
        let observation = observation(Vec::new());
        let action = action(ActionType::WorkedExample, Vec::new());
        let without_steps = rubric_check(
            &observation,
            &action,
            "Here is an example of heat flux, because energy flows across the wall.",
            &[],
            &ValidatorConfig::default(),
        );
        let with_steps = rubric_check(
            &observation,
            &action,
            "Here is an example of heat flux. Step 1: compute the gradient, because the \
             flux follows it. Step 2: multiply by conductivity.",
            &[],
            &ValidatorConfig::default(),
        );
        assert!(without_steps.flags.iter().any(|f| f == "missing_worked_steps"));
        assert!(with_steps.score.unwrap() > without_steps.score.unwrap());
    }

    #[test]
    fn ask_without_a_question_is_flagged() {
        let observation = observation(Vec::new());
        let action = action(ActionType::Ask, Vec::new());
        let result = rubric_check(
            &observation,
            &action,
            "Think about heat flux for a while.",
            &[],
            &ValidatorConfig::default(),
        );
        assert!(result.flags.iter().any(|f| f == "missing_followup_question"));
    }

    #[test]
    fn follow_up_question_satisfies_formative_feature() {
        let observation = observation(Vec::new());
        let action = action(ActionType::Ask, Vec::new());
        let result = rubric_check(
            &observation,
            &action,
            "Can you explain heat flux in your own words?",
            &[],
            &ValidatorConfig::default(),
        );
        assert!(!result.flags.iter().any(|f| f == "missing_followup_question"));
        assert!(result.score.unwrap() > 0.4);
    }
}
