//! Intent component: agreement between the applied action and the
//! classifier's intent/affect.

use super::ComponentResult;
use crate::classify::{Affect, Intent};
use crate::observation::Observation;
use crate::policy::{Action, ActionType};

use serde_json::json;

/// Action priorities per intent, best first.
fn priorities(intent: Intent) -> &'static [ActionType] {
    match intent {
        Intent::Question => &[ActionType::Explain, ActionType::Hint, ActionType::WorkedExample],
        Intent::Answer | Intent::Reflection => {
            &[ActionType::Reflect, ActionType::Ask, ActionType::Review]
        }
        Intent::OffTopic => &[ActionType::Review, ActionType::Ask, ActionType::Explain],
        Intent::Greeting => &[ActionType::Ask, ActionType::Explain],
        Intent::Unknown => &[ActionType::Explain, ActionType::Ask, ActionType::Review],
    }
}

pub fn intent_alignment(observation: &Observation, action: &Action) -> ComponentResult {
    let intent = observation.classifier.intent;
    let affect = observation.classifier.affect;
    let applied = action.applied_type;

    let allowed = priorities(intent);
    let (mut score, mut band): (f64, &str) = match allowed.iter().position(|candidate| *candidate == applied) {
        Some(0) => (1.0, "preferred"),
        Some(1) => (0.8, "acceptable"),
        Some(_) => (0.6, "fallback"),
        None => (0.2, "mismatch"),
    };

    // A struggling student getting an explanation is never a mismatch, even
    // when the intent table would rank it lower.
    if matches!(affect, Affect::Frustrated | Affect::Unsure) && applied == ActionType::Explain {
        score = score.max(0.7);
        band = "affect_override";
    }

    let flags = if score < 0.6 {
        vec!["intent_action_mismatch".into()]
    } else {
        Vec::new()
    };

    ComponentResult::new("intent", score)
        .with_flags(flags)
        .with_details(json!({
            "intent": intent.to_string(),
            "affect": affect.to_string(),
            "applied_type": applied.to_string(),
            "band": band,
            "allowed_actions": allowed.iter().map(ToString::to_string).collect::<Vec<_>>(),
        }))
}
