//! Style component: length and tone heuristics against the configured
//! target window.

use super::ComponentResult;
use crate::config::ValidatorConfig;

use serde_json::json;

pub fn style_check(response_text: &str, validator: &ValidatorConfig) -> ComponentResult {
    let words: Vec<&str> = response_text.split_whitespace().collect();
    let word_count = words.len();
    let sentence_lengths = sentence_lengths(response_text);
    let avg_sentence =
        sentence_lengths.iter().sum::<usize>() as f64 / sentence_lengths.len() as f64;

    let mut score: f64 = 1.0;
    let mut flags: Vec<String> = Vec::new();

    if word_count < validator.min_words {
        let shortfall = (validator.min_words - word_count) as f64 / validator.min_words as f64;
        score -= shortfall.min(0.5);
        flags.push("response_too_short".into());
    }
    if word_count > validator.max_words {
        let overflow = (word_count - validator.max_words) as f64 / validator.max_words as f64;
        score -= overflow.min(0.4);
        flags.push("response_too_long".into());
    }

    if avg_sentence > 32.0 {
        score -= 0.1;
        flags.push("long_sentences".into());
    }

    let lowered = response_text.to_lowercase();
    let banned_hits: Vec<&String> = validator
        .banned_phrases
        .iter()
        .filter(|phrase| lowered.contains(phrase.as_str()))
        .collect();
    if !banned_hits.is_empty() {
        score = score.min(0.2);
        flags.push("banned_phrase".into());
    }

    ComponentResult::new("style", score)
        .with_flags(flags)
        .with_details(json!({
            "word_count": word_count,
            "avg_sentence_length": avg_sentence,
            "banned_hits": banned_hits,
        }))
}

fn sentence_lengths(text: &str) -> Vec<usize> {
    let lengths: Vec<usize> = text
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .map(|sentence| sentence.split_whitespace().count())
        .collect();
    if lengths.is_empty() {
        vec![text.split_whitespace().count()]
    } else {
        lengths
    }
}
