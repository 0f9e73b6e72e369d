//! Gating component: independent audit of prerequisite enforcement.
//!
//! Re-derives prerequisite satisfaction from the observation's mastery data
//! rather than trusting the policy's own flag — the policy marks gating
//! failures, and this component validates that bookkeeping from first
//! principles. Also penalizes advanced-concept drift: learning-path concepts
//! beyond the focus showing up in the response.

use super::ComponentResult;
use crate::observation::Observation;
use crate::policy::{Action, ActionType, PrerequisiteChecker};
use crate::config::ValidatorConfig;

use serde_json::json;

pub fn gating_check(
    observation: &Observation,
    action: &Action,
    response_text: &str,
    validator: &ValidatorConfig,
    checker: &PrerequisiteChecker,
) -> ComponentResult {
    let tutor = &observation.tutor;
    let focus_concept = tutor.focus_concept.as_deref().unwrap_or("").trim();
    let response_lower = response_text.to_lowercase();

    let mut score: f64 = 1.0;
    let mut flags: Vec<String> = Vec::new();
    let mut violations: Vec<String> = Vec::new();

    if !focus_concept.is_empty() && !response_lower.contains(&focus_concept.to_lowercase()) {
        score -= 0.4;
        violations.push("focus_concept_missing".into());
    }

    // Concepts later in the learning path than the focus are too advanced
    // for this turn.
    let advanced_terms: &[String] = match tutor
        .learning_path
        .iter()
        .position(|entry| entry == focus_concept)
    {
        Some(index) => &tutor.learning_path[index + 1..],
        None => &[],
    };
    let drifting: Vec<&String> = advanced_terms
        .iter()
        .filter(|term| !term.is_empty() && response_lower.contains(&term.to_lowercase()))
        .collect();
    if !drifting.is_empty() {
        score -= validator.advanced_term_penalty.min(0.6);
        violations.push(format!(
            "advanced_terms:{}",
            drifting
                .iter()
                .map(|term| term.as_str())
                .collect::<Vec<_>>()
                .join(",")
        ));
        flags.push("advanced_concept_drift".into());
    }

    // Independent re-derivation of the hard gate: unmet prerequisites plus a
    // non-review action is a gating failure whatever the policy claimed.
    let check = if focus_concept.is_empty() {
        crate::policy::PrerequisiteCheck::ready()
    } else {
        checker.check_readiness(focus_concept, &tutor.learning_path, &tutor.path_mastery)
    };
    let rederived_failure = check.should_review
        && !check.missing_prereqs.is_empty()
        && action.applied_type != ActionType::Review;
    if rederived_failure {
        score = 0.0;
    }

    score = score.max(0.0);
    if rederived_failure || score < 0.5 {
        flags.push("prereq_gating_failed".into());
    }

    ComponentResult::new("gating", score)
        .with_flags(flags)
        .with_details(json!({
            "focus_concept": focus_concept,
            "learning_path": tutor.learning_path,
            "missing_prereqs": check.missing_prereqs,
            "advanced_terms_detected": drifting,
            "violations": violations,
            "policy_claimed_failure": action.prereq_gating_failed,
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::policy::{ActionType, MasterySnapshot};
    use crate::reward::test_support::{action, observation, summary};

    fn checker() -> PrerequisiteChecker {
        PrerequisiteChecker::from_config(&PolicyConfig::default())
    }

    #[test]
    fn satisfied_prereqs_and_on_topic_response_score_full() {
        let observation = observation(vec![summary("c-1", "snippet")]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let result = gating_check(
            &observation,
            &action,
            "Heat flux is energy transfer per unit area.",
            &ValidatorConfig::default(),
            &checker(),
        );
        assert_eq!(result.score, Some(1.0));
        assert!(result.flags.is_empty());
    }

    #[test]
    fn missing_prereqs_with_non_review_action_zero_the_component() {
        let mut observation = observation(vec![summary("c-1", "snippet")]);
        observation.tutor.path_mastery.insert(
            "temperature".into(),
            MasterySnapshot {
                mastery: Some(0.0),
                attempts: 0,
                correct: 0,
            },
        );
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let result = gating_check(
            &observation,
            &action,
            "Heat flux is energy transfer per unit area.",
            &ValidatorConfig::default(),
            &checker(),
        );
        assert_eq!(result.score, Some(0.0));
        assert!(result.flags.iter().any(|f| f == "prereq_gating_failed"));
    }

    #[test]
    fn review_action_satisfies_the_rederived_gate() {
        let mut observation = observation(vec![summary("c-1", "snippet")]);
        observation.tutor.path_mastery.insert(
            "temperature".into(),
            MasterySnapshot {
                mastery: Some(0.0),
                attempts: 0,
                correct: 0,
            },
        );
        let action = action(ActionType::Review, vec!["c-1".into()]);
        let result = gating_check(
            &observation,
            &action,
            "Let's review heat flux together before moving on.",
            &ValidatorConfig::default(),
            &checker(),
        );
        assert!(!result.flags.iter().any(|f| f == "prereq_gating_failed"));
    }

    #[test]
    fn advanced_concept_drift_is_penalized_and_flagged() {
        let mut observation = observation(vec![summary("c-1", "snippet")]);
        observation.tutor.learning_path = vec![
            "temperature".into(),
            "heat flux".into(),
            "entropy".into(),
        ];
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let result = gating_check(
            &observation,
            &action,
            "Heat flux relates to entropy production in irreversible processes.",
            &ValidatorConfig::default(),
            &checker(),
        );
        assert!(result.flags.iter().any(|f| f == "advanced_concept_drift"));
        assert!(result.score.unwrap() < 1.0);
    }

    #[test]
    fn off_focus_response_loses_points() {
        let observation = observation(vec![summary("c-1", "snippet")]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let result = gating_check(
            &observation,
            &action,
            "Let's talk about something else entirely.",
            &ValidatorConfig::default(),
            &checker(),
        );
        assert!((result.score.unwrap() - 0.6).abs() < 1e-9);
    }
}
