//! Grounding component: are the response's claims traceable to chunks the
//! action actually cited?
//!
//! Citing a chunk id that was never retrieved is a scoring inconsistency —
//! it is logged and the component drops to its worst case rather than being
//! silently skipped.

use super::{ComponentResult, round4};
use crate::observation::Observation;
use crate::policy::Action;
use crate::retrieval::keyword_overlap;

use serde_json::json;

/// Minimum token overlap for a claim sentence to count as supported.
const CLAIM_SUPPORT_OVERLAP: f64 = 0.1;

/// Sentences shorter than this many words are not treated as claims.
const CLAIM_MIN_WORDS: usize = 4;

pub fn grounding_check(
    observation: &Observation,
    action: &Action,
    response_text: &str,
) -> ComponentResult {
    let retrieved = observation.retrieval.chunk_ids();
    let cited = &action.source_chunk_ids;

    let unknown: Vec<String> = cited
        .iter()
        .filter(|id| !retrieved.contains(id))
        .cloned()
        .collect();

    if !unknown.is_empty() {
        tracing::warn!(
            session_id = %observation.session.session_id,
            unknown_ids = ?unknown,
            "scoring inconsistency: response cites chunks outside the retrieval set"
        );
        return ComponentResult::new("grounding", 0.0)
            .with_flags(vec![
                "scoring_inconsistency".into(),
                "unknown_grounding_ids".into(),
                "low_grounding".into(),
            ])
            .with_details(json!({
                "retrieved_ids": retrieved,
                "cited_ids": cited,
                "unknown_ids": unknown,
            }));
    }

    if retrieved.is_empty() && cited.is_empty() {
        // Nothing was retrieved and nothing was cited — there is no
        // grounding question to answer for this turn.
        return ComponentResult::not_applicable("grounding");
    }

    let missing: Vec<String> = retrieved
        .iter()
        .filter(|id| !cited.contains(id))
        .cloned()
        .collect();

    let base = if !cited.is_empty() {
        if missing.is_empty() { 1.0 } else { 0.85 }
    } else {
        0.6
    };

    // Fraction of claim sentences supported by the cited snippets (all
    // retrieved snippets when nothing was cited).
    let snippets: Vec<&str> = observation
        .retrieval
        .chunks
        .iter()
        .filter(|chunk| cited.is_empty() || cited.contains(&chunk.id))
        .map(|chunk| chunk.snippet.as_str())
        .collect();
    let coverage = claim_coverage(response_text, &snippets);
    let score = match coverage {
        Some(coverage) => base * (0.5 + 0.5 * coverage),
        None => base,
    };

    let mut flags = Vec::new();
    if score < 0.6 {
        flags.push("low_grounding".into());
    }

    ComponentResult::new("grounding", score)
        .with_flags(flags)
        .with_details(json!({
            "retrieved_ids": retrieved,
            "cited_ids": cited,
            "missing_ids": missing,
            "claim_coverage": coverage.map(round4),
        }))
}

/// Fraction of claim sentences with token overlap against any snippet.
/// `None` when the response contains no claim-length sentences.
fn claim_coverage(response_text: &str, snippets: &[&str]) -> Option<f64> {
    if snippets.is_empty() {
        return None;
    }
    let claims: Vec<&str> = split_sentences(response_text)
        .into_iter()
        .filter(|sentence| sentence.split_whitespace().count() >= CLAIM_MIN_WORDS)
        .collect();
    if claims.is_empty() {
        return None;
    }
    let supported = claims
        .iter()
        .filter(|claim| {
            snippets
                .iter()
                .any(|snippet| keyword_overlap(claim, snippet) >= CLAIM_SUPPORT_OVERLAP)
        })
        .count();
    Some(supported as f64 / claims.len() as f64)
}

/// Whether the response asserts specifics no retrieved snippet contains:
/// numeric values absent from every snippet, or definitional phrasing with
/// near-zero lexical overlap against the retrieval set.
pub(crate) fn asserts_unsupported_specifics(
    observation: &Observation,
    response_text: &str,
) -> bool {
    let snippet_text: String = observation
        .retrieval
        .chunks
        .iter()
        .map(|chunk| chunk.snippet.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    let has_unsupported_number = response_text
        .split_whitespace()
        .map(|token| token.trim_matches(|character: char| !character.is_alphanumeric()))
        .filter(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()))
        .any(|number| !snippet_text.contains(number));
    if has_unsupported_number {
        return true;
    }

    let lowered = response_text.to_lowercase();
    let definitional = lowered.contains(" is ") || lowered.contains(" means ");
    definitional && keyword_overlap(&lowered, &snippet_text) < 0.05
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ActionType;
    use crate::reward::test_support::{action, observation, summary};

    #[test]
    fn full_citation_with_supported_claims_scores_high() {
        let observation = observation(vec![summary(
            "c-1",
            "heat flux is the rate of heat energy transfer per unit area",
        )]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let result = grounding_check(
            &observation,
            &action,
            "Heat flux is the rate of heat energy transfer per unit area of surface.",
        );
        assert!(result.score.unwrap() > 0.9);
        assert!(result.flags.is_empty());
    }

    #[test]
    fn unknown_cited_ids_are_worst_case() {
        let observation = observation(vec![summary("c-1", "snippet")]);
        let action = action(ActionType::Explain, vec!["c-1".into(), "c-404".into()]);
        let result = grounding_check(&observation, &action, "anything");
        assert_eq!(result.score, Some(0.0));
        assert!(result.flags.iter().any(|f| f == "scoring_inconsistency"));
        assert!(result.flags.iter().any(|f| f == "unknown_grounding_ids"));
    }

    #[test]
    fn no_retrieval_and_no_citations_is_not_applicable() {
        let mut observation = observation(Vec::new());
        observation.retrieval.chunks.clear();
        let action = action(ActionType::Ask, Vec::new());
        let result = grounding_check(&observation, &action, "What do you remember?");
        assert!(result.score.is_none());
    }

    #[test]
    fn uncited_retrieval_sits_in_the_middle() {
        let observation = observation(vec![summary("c-1", "heat flux snippet")]);
        let action = action(ActionType::Ask, Vec::new());
        let result = grounding_check(
            &observation,
            &action,
            "Can you explain heat flux in your own words today?",
        );
        let score = result.score.unwrap();
        assert!((0.2..0.9).contains(&score), "got {score}");
    }

    #[test]
    fn unsupported_claims_pull_the_score_down() {
        let observation = observation(vec![summary("c-1", "heat flux definition text")]);
        let action = action(ActionType::Explain, vec!["c-1".into()]);
        let ungrounded = grounding_check(
            &observation,
            &action,
            "Napoleon invaded Russia during the winter campaign of the war.",
        );
        let grounded = grounding_check(
            &observation,
            &action,
            "The heat flux definition text covers the core idea of heat flux here.",
        );
        assert!(ungrounded.score.unwrap() < grounded.score.unwrap());
    }

    #[test]
    fn unsupported_numbers_count_as_specifics() {
        let observation = observation(vec![summary("c-1", "heat flux moves energy")]);
        assert!(asserts_unsupported_specifics(
            &observation,
            "The answer is exactly 42 watts."
        ));
        assert!(!asserts_unsupported_specifics(
            &observation,
            "Heat flux is how energy moves, as the heat flux materials explain."
        ));
    }
}
