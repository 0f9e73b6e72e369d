//! Immutable per-turn decision context.
//!
//! An `Observation` is assembled exactly once per turn and never mutated in
//! place — downstream components (policy, scorers, emitter) only ever read
//! it. Corrections produce a new turn record, not an edited snapshot.

use crate::classify::Classification;
use crate::error::{Result, TutorError};
use crate::policy::{ConceptLevel, MasteryMap, MasterySnapshot};
use crate::retrieval::{ComponentScores, RankedChunk};

use serde::{Deserialize, Serialize};

/// Maximum snippet length carried into an observation. Full text stays in
/// the chunk store; observations only need enough for grounding checks and
/// critic context.
const SNIPPET_LIMIT: usize = 320;

/// The learner's side of the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBlock {
    pub message: String,
    pub user_id: String,
    pub target_concepts: Vec<String>,
}

/// One retrieved chunk reference with its component score breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub id: String,
    pub pedagogy_role: Option<String>,
    pub page_number: Option<u32>,
    pub snippet: String,
    pub scores: ComponentScores,
}

impl From<&RankedChunk> for ChunkSummary {
    fn from(chunk: &RankedChunk) -> Self {
        Self {
            id: chunk.id.clone(),
            pedagogy_role: chunk.pedagogy_role.clone(),
            page_number: chunk.page_number,
            snippet: truncate_chars(&chunk.snippet, SNIPPET_LIMIT),
            scores: chunk.scores,
        }
    }
}

/// Retrieval results as seen by this turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalBlock {
    pub query: Option<String>,
    pub pedagogy_roles: Vec<String>,
    pub chunks: Vec<ChunkSummary>,
}

impl RetrievalBlock {
    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.iter().map(|chunk| chunk.id.clone()).collect()
    }

    pub fn contains_chunk(&self, id: &str) -> bool {
        self.chunks.iter().any(|chunk| chunk.id == id)
    }
}

/// Tutor-side policy state captured at decision time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TutorBlock {
    pub focus_concept: Option<String>,
    pub concept_level: ConceptLevel,
    pub learning_path: Vec<String>,
    pub mastery_snapshot: Option<MasterySnapshot>,
    /// Mastery for every learning-path concept at decision time. The reward
    /// scorer re-derives prerequisite gating from this rather than trusting
    /// the policy's own flag.
    pub path_mastery: MasteryMap,
    pub cold_start: bool,
    pub consecutive_explains: u32,
}

/// Session coordinates for this turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBlock {
    pub session_id: String,
    /// Monotonic and unique per session.
    pub turn_index: u64,
    pub resource_id: Option<String>,
}

/// The full decision context for one turn. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub user: UserBlock,
    pub classifier: Classification,
    pub retrieval: RetrievalBlock,
    pub tutor: TutorBlock,
    pub session: SessionBlock,
}

/// Assembles an [`Observation`]. The builder is the single place that
/// enforces the identity requirement — mastery tracking is meaningless
/// without a user id, so an empty one fails the turn.
#[derive(Debug, Default)]
pub struct ObservationBuilder {
    pub message: String,
    pub user_id: String,
    pub target_concepts: Vec<String>,
    pub classification: Option<Classification>,
    pub retrieval_query: Option<String>,
    pub pedagogy_roles: Vec<String>,
    pub chunks: Vec<RankedChunk>,
    pub focus_concept: Option<String>,
    pub concept_level: ConceptLevel,
    pub learning_path: Vec<String>,
    pub mastery_snapshot: Option<MasterySnapshot>,
    pub path_mastery: MasteryMap,
    pub cold_start: bool,
    pub consecutive_explains: u32,
    pub session_id: String,
    pub turn_index: u64,
    pub resource_id: Option<String>,
}

impl ObservationBuilder {
    pub fn build(self) -> Result<Observation> {
        if self.user_id.trim().is_empty() {
            return Err(TutorError::MissingContext(
                "user_id is required for mastery tracking",
            ));
        }
        let classification = self
            .classification
            .unwrap_or_else(|| Classification::degraded(self.focus_concept.as_deref().unwrap_or("")));

        Ok(Observation {
            user: UserBlock {
                message: self.message,
                user_id: self.user_id,
                target_concepts: self.target_concepts,
            },
            classifier: classification,
            retrieval: RetrievalBlock {
                query: self.retrieval_query,
                pedagogy_roles: self.pedagogy_roles,
                chunks: self.chunks.iter().map(ChunkSummary::from).collect(),
            },
            tutor: TutorBlock {
                focus_concept: self.focus_concept,
                concept_level: self.concept_level,
                learning_path: self.learning_path,
                mastery_snapshot: self.mastery_snapshot,
                path_mastery: self.path_mastery,
                cold_start: self.cold_start,
                consecutive_explains: self.consecutive_explains,
            },
            session: SessionBlock {
                session_id: self.session_id,
                turn_index: self.turn_index,
                resource_id: self.resource_id,
            },
        })
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_index, _)) => text[..byte_index].to_owned(),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::ComponentScores;

    fn ranked(id: &str, snippet: &str) -> RankedChunk {
        RankedChunk {
            id: id.into(),
            resource_id: None,
            page_number: Some(3),
            seq: 1,
            snippet: snippet.into(),
            pedagogy_role: Some("definition".into()),
            scores: ComponentScores {
                similarity: 0.4,
                lexical: 0.2,
                fused: 0.34,
            },
        }
    }

    #[test]
    fn missing_user_id_fails_the_build() {
        let builder = ObservationBuilder {
            message: "what is heat flux?".into(),
            session_id: "s-1".into(),
            ..Default::default()
        };
        match builder.build() {
            Err(TutorError::MissingContext(_)) => {}
            other => panic!("expected MissingContext, got {other:?}"),
        }
    }

    #[test]
    fn build_without_classification_uses_degraded_defaults() {
        let builder = ObservationBuilder {
            message: "hello".into(),
            user_id: "u-1".into(),
            session_id: "s-1".into(),
            focus_concept: Some("limits".into()),
            ..Default::default()
        };
        let observation = builder.build().expect("valid observation");
        assert_eq!(observation.classifier.concept, "limits");
        assert!((observation.classifier.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn chunk_summaries_carry_component_scores_and_truncate_snippets() {
        let long_snippet = "x".repeat(1000);
        let builder = ObservationBuilder {
            message: "q".into(),
            user_id: "u-1".into(),
            session_id: "s-1".into(),
            chunks: vec![ranked("c-1", &long_snippet)],
            ..Default::default()
        };
        let observation = builder.build().expect("valid observation");
        let summary = &observation.retrieval.chunks[0];
        assert_eq!(summary.snippet.chars().count(), 320);
        assert!((summary.scores.fused - 0.34).abs() < 1e-9);
        assert!(observation.retrieval.contains_chunk("c-1"));
        assert!(!observation.retrieval.contains_chunk("c-2"));
    }
}
