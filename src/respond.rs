//! Response generation for each pedagogical action.
//!
//! Every generator goes through the capability with a grounded default
//! payload, so a dead or slow model still produces a usable answer built from
//! the retrieved snippets. Source chunk ids are the ids of the chunks the
//! prompt was grounded on.

use crate::capability::CapabilityClient;
use crate::classify::clamp_unit;
use crate::policy::{ActionType, ConceptLevel};
use crate::retrieval::RankedChunk;
use crate::srl::Plan;

use serde_json::json;

/// A generated turn response with its grounding.
#[derive(Debug, Clone)]
pub struct GeneratedResponse {
    pub text: String,
    pub confidence: f64,
    pub source_chunk_ids: Vec<String>,
}

/// Generate the response for an action.
pub async fn generate_action(
    capability: &CapabilityClient,
    action: ActionType,
    concept: Option<&str>,
    level: ConceptLevel,
    chunks: &[RankedChunk],
    message: &str,
    plan: Option<&Plan>,
) -> GeneratedResponse {
    let concept_label = concept.unwrap_or("the concept");
    let context = format_context_snippets(chunks);
    let source_chunk_ids: Vec<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();

    let (prompt, default_text, default_confidence, answer_field) = match action {
        ActionType::Explain => {
            let guidance = plan
                .map(|plan| format!("\nPlan rationale: {}", plan.rationale))
                .unwrap_or_default();
            (
                format!(
                    "Explain {concept_label} to a {level} student using only the context below.\n\
                     Student message: {message}{guidance}\n\
                     Context:\n{context}\n\
                     Respond with JSON: {{\"response\": string, \"confidence\": number in [0,1]}}"
                ),
                fallback_explain_text(concept, chunks),
                0.5,
                "response",
            )
        }
        ActionType::Ask => (
            format!(
                "Write one follow-up question checking a {level} student's understanding of \
                 {concept_label}.\nContext:\n{context}\n\
                 Respond with JSON: {{\"question\": string, \"confidence\": number in [0,1]}}"
            ),
            default_question(concept),
            0.7,
            "question",
        ),
        ActionType::Hint => (
            format!(
                "The student is stuck on {concept_label}. Give a gentle hint for a {level} \
                 student without revealing the full answer.\nStudent message: {message}\n\
                 Context:\n{context}\n\
                 Respond with JSON: {{\"response\": string, \"confidence\": number in [0,1]}}"
            ),
            fallback_explain_text(concept, chunks),
            0.5,
            "response",
        ),
        ActionType::Reflect => (
            format!(
                "The student just answered about {concept_label}. Prompt them to reflect on \
                 their reasoning.\nStudent message: {message}\nContext:\n{context}\n\
                 Respond with JSON: {{\"response\": string, \"confidence\": number in [0,1]}}"
            ),
            "Could you summarize what you learned just now?".into(),
            0.6,
            "response",
        ),
        ActionType::WorkedExample => (
            format!(
                "Walk a {level} student through a worked example of {concept_label}, \
                 numbered step by step.\nContext:\n{context}\n\
                 Respond with JSON: {{\"response\": string, \"confidence\": number in [0,1]}}"
            ),
            fallback_worked_example_text(concept_label, chunks),
            0.55,
            "response",
        ),
        ActionType::Review => (
            format!(
                "Review {concept_label} with a {level} student, summarizing the essentials \
                 from the context.\nContext:\n{context}\n\
                 Respond with JSON: {{\"response\": string, \"confidence\": number in [0,1]}}"
            ),
            fallback_review_text(concept_label, chunks),
            0.6,
            "response",
        ),
    };

    let mut default_payload = serde_json::Map::new();
    default_payload.insert(
        answer_field.to_owned(),
        serde_json::Value::String(default_text.clone()),
    );
    default_payload.insert("confidence".to_owned(), json!(default_confidence));
    let result = capability
        .complete_json_or(&prompt, serde_json::Value::Object(default_payload))
        .await;

    let text = result
        .get(answer_field)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .unwrap_or(default_text);
    let confidence = result
        .get("confidence")
        .and_then(|value| value.as_f64())
        .map(clamp_unit)
        .filter(|value| *value > 0.0)
        .unwrap_or(default_confidence);

    GeneratedResponse {
        text,
        confidence,
        source_chunk_ids,
    }
}

/// Response for a gate-downgraded turn: review the first missing
/// prerequisite before returning to the requested concept.
pub async fn generate_prereq_review(
    capability: &CapabilityClient,
    target_concept: Option<&str>,
    missing_prereqs: &[String],
    chunks: &[RankedChunk],
) -> GeneratedResponse {
    let prereq = missing_prereqs.first().map(String::as_str).unwrap_or("the basics");
    let target = target_concept.unwrap_or("that topic");
    let context = format_context_snippets(chunks);
    let default_text = format!(
        "Before we tackle {target}, let's make sure {prereq} is solid. {}",
        chunks
            .first()
            .map(|chunk| chunk.snippet.trim())
            .unwrap_or("Can you tell me what you already know about it?")
    );
    let prompt = format!(
        "The student asked about {target} but has not yet covered {prereq}. Write a short \
         review of {prereq} that bridges toward {target}.\nContext:\n{context}\n\
         Respond with JSON: {{\"response\": string, \"confidence\": number in [0,1]}}"
    );
    let result = capability
        .complete_json_or(&prompt, json!({"response": default_text, "confidence": 0.6}))
        .await;

    GeneratedResponse {
        text: result
            .get("response")
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(String::from)
            .unwrap_or(default_text),
        confidence: clamp_unit(
            result
                .get("confidence")
                .and_then(|value| value.as_f64())
                .unwrap_or(0.6),
        ),
        source_chunk_ids: chunks.iter().map(|chunk| chunk.id.clone()).collect(),
    }
}

fn default_question(concept: Option<&str>) -> String {
    match concept {
        Some(concept) => format!("Can you explain {concept} in your own words?"),
        None => "Can you summarize what you learned?".into(),
    }
}

fn fallback_explain_text(concept: Option<&str>, chunks: &[RankedChunk]) -> String {
    if let Some(top) = chunks.first() {
        let snippet = top.snippet.trim();
        if !snippet.is_empty() {
            return format!(
                "Here's what your materials say about {}:\n\n{snippet}\n\n\
                 Let me know if you'd like a different angle.",
                concept.unwrap_or("this topic")
            );
        }
    }
    "I couldn't find a grounded snippet yet. Let's review the relevant materials together. \
     Do you recall which section covers this concept?"
        .into()
}

fn fallback_worked_example_text(concept: &str, chunks: &[RankedChunk]) -> String {
    let grounding = chunks
        .first()
        .map(|chunk| chunk.snippet.trim())
        .unwrap_or("the definition");
    format!(
        "Let's work through {concept} step by step.\n\n\
         Step 1: Recall the key idea — {grounding}\n\
         Step 2: Apply it to a concrete case and check each intermediate result.\n\
         Step 3: Compare your result against the definition to confirm it holds."
    )
}

fn fallback_review_text(concept: &str, chunks: &[RankedChunk]) -> String {
    match chunks.first() {
        Some(top) => format!(
            "Quick review of {concept}: {}\n\nDoes that match what you remember?",
            top.snippet.trim()
        ),
        None => format!(
            "Let's take a step back and review {concept}. What do you remember about it?"
        ),
    }
}

/// Numbered snippet block for prompt interpolation.
pub fn format_context_snippets(chunks: &[RankedChunk]) -> String {
    let mut parts = Vec::new();
    for (index, chunk) in chunks.iter().enumerate() {
        let snippet = chunk.snippet.trim();
        if snippet.is_empty() {
            continue;
        }
        parts.push(format!("[Chunk {} | {}] {snippet}", index + 1, chunk.id));
    }
    parts.join("\n\n")
}
