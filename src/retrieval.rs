//! Hybrid retrieval ranker.
//!
//! Fuses a semantic similarity score and a lexical relevance score into one
//! ranked chunk list: `fused = sim_weight * sim + lexical_weight * lexical`,
//! multiplied by the resource boost for in-scope chunks and, when enabled,
//! raised by a proximity bonus for chunks on pages near already-selected high
//! scorers. Ties break on chunk creation order, so identical inputs always
//! produce the identical ordered id list. Callers always get the component
//! breakdown, never just the fused number — the grounding scorer and humans
//! debugging a bad ranking both need it.

use crate::config::RetrievalConfig;
use crate::error::{Result, TutorError};

use serde::{Deserialize, Serialize};

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "have", "has",
    "had", "do", "does", "did", "will", "would", "could", "it", "its", "of",
    "in", "to", "for", "on", "at", "by", "with", "from", "this", "that", "and",
    "or", "but",
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One chunk in the candidate pool, as persisted by the ingestion side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkCandidate {
    pub id: String,
    pub resource_id: Option<String>,
    pub page_number: Option<u32>,
    /// Creation order. Deterministic tie-break for equal fused scores.
    pub seq: u64,
    pub snippet: String,
    pub pedagogy_role: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

/// Ranker weights. Each is independently configurable per call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RankWeights {
    pub sim_weight: f64,
    pub lexical_weight: f64,
    pub resource_boost: f64,
    pub page_proximity: bool,
}

impl RankWeights {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            sim_weight: config.sim_weight,
            lexical_weight: config.lexical_weight,
            resource_boost: config.resource_boost,
            page_proximity: config.page_proximity,
        }
    }
}

/// Per-chunk component scores. `fused` is the score the ordering used,
/// including boost adjustments; with neutral boosts it equals the weighted
/// sum of `similarity` and `lexical` exactly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComponentScores {
    pub similarity: f64,
    pub lexical: f64,
    pub fused: f64,
}

/// One ranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedChunk {
    pub id: String,
    pub resource_id: Option<String>,
    pub page_number: Option<u32>,
    pub seq: u64,
    pub snippet: String,
    pub pedagogy_role: Option<String>,
    pub scores: ComponentScores,
}

/// The ranker's output: top-k chunks plus wall-clock spent ranking.
#[derive(Debug, Clone)]
pub struct RankOutcome {
    pub chunks: Vec<RankedChunk>,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Rank a candidate pool against a query.
///
/// `scope` identifies the caller's resource; chunks belonging to it receive
/// the multiplicative `resource_boost`. `query_embedding` may be absent
/// (embedding capability down), in which case the lexical component carries
/// the ranking alone.
///
/// Fails with [`TutorError::EmptyPool`] when the pool is empty — an empty
/// result is never silently padded.
pub fn rank(
    query: &str,
    query_embedding: Option<&[f32]>,
    pool: &[ChunkCandidate],
    weights: RankWeights,
    scope: Option<&str>,
    k: usize,
    config: &RetrievalConfig,
) -> Result<RankOutcome> {
    let started = Instant::now();
    if pool.is_empty() {
        return Err(TutorError::EmptyPool(scope.map(String::from)));
    }

    let mut scored: Vec<RankedChunk> = pool
        .iter()
        .map(|chunk| {
            let similarity = match (query_embedding, chunk.embedding.as_deref()) {
                (Some(query_vec), Some(chunk_vec)) => {
                    cosine_similarity(query_vec, chunk_vec).clamp(0.0, 1.0)
                }
                _ => 0.0,
            };
            let lexical = keyword_overlap(query, &chunk.snippet);
            let mut fused = weights.sim_weight * similarity + weights.lexical_weight * lexical;
            if let (Some(scope_id), Some(resource_id)) = (scope, chunk.resource_id.as_deref())
                && scope_id == resource_id
            {
                fused *= weights.resource_boost;
            }
            RankedChunk {
                id: chunk.id.clone(),
                resource_id: chunk.resource_id.clone(),
                page_number: chunk.page_number,
                seq: chunk.seq,
                snippet: chunk.snippet.clone(),
                pedagogy_role: chunk.pedagogy_role.clone(),
                scores: ComponentScores {
                    similarity,
                    lexical,
                    fused,
                },
            }
        })
        .collect();

    sort_ranked(&mut scored);

    let chunks = if weights.page_proximity {
        select_with_proximity(scored, k, config)
    } else {
        scored.truncate(k);
        scored
    };

    Ok(RankOutcome {
        chunks,
        elapsed: started.elapsed(),
    })
}

/// Descending fused score, creation order on ties.
fn sort_ranked(chunks: &mut [RankedChunk]) {
    chunks.sort_by(|a, b| {
        b.scores
            .fused
            .partial_cmp(&a.scores.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.seq.cmp(&b.seq))
    });
}

/// Greedy selection with a locality bonus: each round picks the candidate
/// with the highest fused-plus-bonus score, where the bonus applies when the
/// candidate's page sits within the proximity window of an already-selected
/// chunk of the same resource. Encourages locally coherent retrieval sets
/// over scattered single-sentence hits.
fn select_with_proximity(
    mut remaining: Vec<RankedChunk>,
    k: usize,
    config: &RetrievalConfig,
) -> Vec<RankedChunk> {
    let mut selected: Vec<RankedChunk> = Vec::with_capacity(k.min(remaining.len()));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_index = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (index, candidate) in remaining.iter().enumerate() {
            let mut adjusted = candidate.scores.fused;
            if near_selected(candidate, &selected, config.proximity_window) {
                adjusted += config.proximity_bonus;
            }
            // Strict comparison keeps the earlier (higher base, lower seq)
            // candidate on exact ties.
            if adjusted > best_score {
                best_score = adjusted;
                best_index = index;
            }
        }
        let mut chosen = remaining.remove(best_index);
        chosen.scores.fused = best_score;
        selected.push(chosen);
    }

    sort_ranked(&mut selected);
    selected
}

fn near_selected(candidate: &RankedChunk, selected: &[RankedChunk], window: u32) -> bool {
    let Some(page) = candidate.page_number else {
        return false;
    };
    selected.iter().any(|chunk| {
        chunk.resource_id == candidate.resource_id
            && chunk
                .page_number
                .is_some_and(|other| page.abs_diff(other) <= window)
    })
}

// ---------------------------------------------------------------------------
// Post-ranking shaping (pedagogy boost, page diversity, relevance floor)
// ---------------------------------------------------------------------------

/// Add a rank bonus for chunks whose pedagogy role appears in the desired
/// sequence. Earlier roles in the sequence get a larger bonus.
pub fn boost_by_pedagogy(chunks: &mut Vec<RankedChunk>, desired_roles: &[String]) {
    if desired_roles.is_empty() {
        return;
    }
    let priority: HashMap<&str, usize> = desired_roles
        .iter()
        .enumerate()
        .map(|(index, role)| (role.as_str(), index))
        .collect();
    for chunk in chunks.iter_mut() {
        if let Some(role) = chunk.pedagogy_role.as_deref()
            && let Some(&index) = priority.get(role)
        {
            let bonus = (0.25 - index as f64 * 0.05).max(0.12);
            chunk.scores.fused += bonus;
        }
    }
    sort_ranked(chunks);
}

/// Keep at most `per_page` chunks per (resource, page). Preserves order.
pub fn diversify_by_page(chunks: Vec<RankedChunk>, per_page: usize) -> Vec<RankedChunk> {
    let mut counts: HashMap<(Option<String>, Option<u32>), usize> = HashMap::new();
    chunks
        .into_iter()
        .filter(|chunk| {
            let key = (chunk.resource_id.clone(), chunk.page_number);
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count <= per_page
        })
        .collect()
}

/// Drop candidates below every relevance floor. A chunk passes if any of
/// fused, similarity, or lexical meets its minimum.
pub fn filter_relevant(chunks: Vec<RankedChunk>, config: &RetrievalConfig) -> Vec<RankedChunk> {
    chunks
        .into_iter()
        .filter(|chunk| {
            chunk.scores.fused >= config.min_fused
                || chunk.scores.similarity >= config.min_sim
                || chunk.scores.lexical >= config.min_lexical
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowercase, split on non-alphanumeric characters, and remove stop words.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|character: char| !character.is_alphanumeric())
        .filter(|token| !token.is_empty() && !STOP_WORDS.contains(token))
        .map(String::from)
        .collect()
}

/// Jaccard similarity between the token sets of two strings.
pub(crate) fn keyword_overlap(text_a: &str, text_b: &str) -> f64 {
    let tokens_a = tokenize(text_a);
    let tokens_b = tokenize(text_b);

    let intersection_size = tokens_a.intersection(&tokens_b).count();
    let union_size = tokens_a.union(&tokens_b).count();

    if union_size == 0 {
        return 0.0;
    }
    intersection_size as f64 / union_size as f64
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, seq: u64, snippet: &str) -> ChunkCandidate {
        ChunkCandidate {
            id: id.into(),
            resource_id: Some("res-1".into()),
            page_number: Some(1),
            seq,
            snippet: snippet.into(),
            pedagogy_role: None,
            embedding: None,
        }
    }

    fn default_weights() -> RankWeights {
        RankWeights {
            sim_weight: 0.7,
            lexical_weight: 0.3,
            resource_boost: 1.0,
            page_proximity: false,
        }
    }

    fn pool_about_heat_flux() -> Vec<ChunkCandidate> {
        vec![
            chunk("c1", 1, "heat flux is the rate of heat energy transfer"),
            chunk("c2", 2, "heat flux density through a surface"),
            chunk("c3", 3, "conduction moves heat through solids"),
            chunk("c4", 4, "the boundary layer affects heat flux measurement"),
            chunk("c5", 5, "radiation is one mode of heat transfer"),
            chunk("c6", 6, "entropy always increases in isolated systems"),
        ]
    }

    #[test]
    fn empty_pool_is_an_error_not_padding() {
        let result = rank(
            "heat flux",
            None,
            &[],
            default_weights(),
            Some("res-9"),
            5,
            &RetrievalConfig::default(),
        );
        match result {
            Err(TutorError::EmptyPool(scope)) => assert_eq!(scope.as_deref(), Some("res-9")),
            other => panic!("expected EmptyPool, got {other:?}"),
        }
    }

    #[test]
    fn heat_flux_scenario_returns_exactly_k_sorted_descending() {
        // Weights {0.7, 0.3, 1.0, false}, k=5 over a pool of six chunks.
        let outcome = rank(
            "heat flux",
            None,
            &pool_about_heat_flux(),
            default_weights(),
            None,
            5,
            &RetrievalConfig::default(),
        )
        .expect("non-empty pool");

        assert_eq!(outcome.chunks.len(), 5);
        for pair in outcome.chunks.windows(2) {
            assert!(pair[0].scores.fused >= pair[1].scores.fused);
        }
    }

    #[test]
    fn fused_equals_weighted_sum_with_neutral_boosts() {
        let outcome = rank(
            "heat flux",
            None,
            &pool_about_heat_flux(),
            default_weights(),
            None,
            6,
            &RetrievalConfig::default(),
        )
        .expect("non-empty pool");

        for ranked in &outcome.chunks {
            let expected = 0.7 * ranked.scores.similarity + 0.3 * ranked.scores.lexical;
            assert!(
                (ranked.scores.fused - expected).abs() < 1e-12,
                "fused must equal the weighted component sum, got {} vs {}",
                ranked.scores.fused,
                expected
            );
        }
    }

    #[test]
    fn reranking_identical_inputs_is_idempotent() {
        let pool = pool_about_heat_flux();
        let config = RetrievalConfig::default();
        let first = rank("heat flux", None, &pool, default_weights(), None, 5, &config)
            .expect("non-empty pool");
        let second = rank("heat flux", None, &pool, default_weights(), None, 5, &config)
            .expect("non-empty pool");
        let ids_first: Vec<&str> = first.chunks.iter().map(|c| c.id.as_str()).collect();
        let ids_second: Vec<&str> = second.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids_first, ids_second);
    }

    #[test]
    fn equal_scores_break_ties_by_creation_order() {
        let pool = vec![
            chunk("late", 10, "unrelated words entirely"),
            chunk("early", 2, "unrelated words entirely"),
        ];
        let outcome = rank(
            "quantum",
            None,
            &pool,
            default_weights(),
            None,
            2,
            &RetrievalConfig::default(),
        )
        .expect("non-empty pool");
        assert_eq!(outcome.chunks[0].id, "early");
        assert_eq!(outcome.chunks[1].id, "late");
    }

    #[test]
    fn resource_boost_promotes_in_scope_chunks() {
        let mut other = chunk("other", 1, "heat flux is the rate of heat energy transfer");
        other.resource_id = Some("res-2".into());
        let scoped = chunk("scoped", 2, "heat flux is the rate of heat energy transfer");
        let weights = RankWeights {
            resource_boost: 1.5,
            ..default_weights()
        };
        let outcome = rank(
            "heat flux",
            None,
            &[other, scoped],
            weights,
            Some("res-1"),
            2,
            &RetrievalConfig::default(),
        )
        .expect("non-empty pool");
        assert_eq!(outcome.chunks[0].id, "scoped");
    }

    #[test]
    fn elapsed_is_reported() {
        let outcome = rank(
            "heat flux",
            None,
            &pool_about_heat_flux(),
            default_weights(),
            None,
            3,
            &RetrievalConfig::default(),
        )
        .expect("non-empty pool");
        assert!(outcome.elapsed >= Duration::ZERO);
    }

    #[test]
    fn proximity_bonus_prefers_neighboring_pages() {
        // Two mid-score candidates: one adjacent to the top hit's page, one
        // five pages away. With proximity on, the neighbor wins the second slot.
        let mut top = chunk("top", 1, "heat flux is the rate of heat energy transfer");
        top.page_number = Some(10);
        let mut near = chunk("near", 2, "boundary conditions matter");
        near.page_number = Some(11);
        let mut far = chunk("far", 3, "boundary conditions matter");
        far.page_number = Some(40);
        // Give "far" the earlier seq advantage so only the bonus can flip it.
        far.seq = 2;
        near.seq = 3;

        let weights = RankWeights {
            page_proximity: true,
            ..default_weights()
        };
        let outcome = rank(
            "heat flux",
            None,
            &[top, near, far],
            weights,
            None,
            2,
            &RetrievalConfig::default(),
        )
        .expect("non-empty pool");
        let ids: Vec<&str> = outcome.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["top", "near"]);
    }

    #[test]
    fn diversify_caps_chunks_per_page() {
        let ranked: Vec<RankedChunk> = pool_about_heat_flux()
            .into_iter()
            .map(|c| RankedChunk {
                id: c.id,
                resource_id: c.resource_id,
                page_number: c.page_number,
                seq: c.seq,
                snippet: c.snippet,
                pedagogy_role: c.pedagogy_role,
                scores: ComponentScores {
                    similarity: 0.0,
                    lexical: 0.0,
                    fused: 0.5,
                },
            })
            .collect();
        // All six share (res-1, page 1).
        let diversified = diversify_by_page(ranked, 1);
        assert_eq!(diversified.len(), 1);
    }

    #[test]
    fn pedagogy_boost_reorders_by_desired_role() {
        let make = |id: &str, seq: u64, role: Option<&str>| RankedChunk {
            id: id.into(),
            resource_id: None,
            page_number: None,
            seq,
            snippet: String::new(),
            pedagogy_role: role.map(String::from),
            scores: ComponentScores {
                similarity: 0.0,
                lexical: 0.0,
                fused: 0.5,
            },
        };
        let mut chunks = vec![make("plain", 1, None), make("definition", 2, Some("definition"))];
        boost_by_pedagogy(&mut chunks, &["definition".into(), "example".into()]);
        assert_eq!(chunks[0].id, "definition");
        assert!(chunks[0].scores.fused > 0.5);
    }

    #[test]
    fn relevance_filter_passes_any_floor() {
        let make = |id: &str, sim: f64, lexical: f64, fused: f64| RankedChunk {
            id: id.into(),
            resource_id: None,
            page_number: None,
            seq: 0,
            snippet: String::new(),
            pedagogy_role: None,
            scores: ComponentScores {
                similarity: sim,
                lexical,
                fused,
            },
        };
        let config = RetrievalConfig::default();
        let chunks = vec![
            make("keep-sim", 0.5, 0.0, 0.1),
            make("keep-lex", 0.0, 0.2, 0.1),
            make("drop", 0.1, 0.05, 0.1),
        ];
        let kept = filter_relevant(chunks, &config);
        let ids: Vec<&str> = kept.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["keep-sim", "keep-lex"]);
    }

    #[test]
    fn keyword_overlap_ignores_stop_words_and_case() {
        let overlap = keyword_overlap("The Heat Flux", "heat flux of the surface");
        assert!(overlap > 0.0);
        assert_eq!(keyword_overlap("the of and", "in on at"), 0.0);
    }

    #[test]
    fn cosine_similarity_handles_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn embedding_similarity_orders_semantically_identical_text_first() {
        let query_vec = crate::capability::CapabilityClient::Mock;
        // Use the deterministic mock embedding for both query and chunks.
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let query_embedding = rt.block_on(query_vec.embed("heat flux")).expect("embed");
        let same = rt.block_on(query_vec.embed("heat flux")).expect("embed");
        let other = rt.block_on(query_vec.embed("entropy")).expect("embed");

        let pool = vec![
            ChunkCandidate {
                id: "same".into(),
                resource_id: None,
                page_number: None,
                seq: 1,
                snippet: "unrelated snippet text".into(),
                pedagogy_role: None,
                embedding: Some(same),
            },
            ChunkCandidate {
                id: "other".into(),
                resource_id: None,
                page_number: None,
                seq: 2,
                snippet: "unrelated snippet text".into(),
                pedagogy_role: None,
                embedding: Some(other),
            },
        ];
        let outcome = rank(
            "heat flux",
            Some(&query_embedding),
            &pool,
            default_weights(),
            None,
            2,
            &RetrievalConfig::default(),
        )
        .expect("non-empty pool");
        assert_eq!(outcome.chunks[0].id, "same");
    }
}
