//! Configuration for the tutor pipeline.
//!
//! Loaded from `config.toml` when present; every section carries a documented
//! baseline via `Default` so the daemon runs with no file at all. Reward
//! weights and validator thresholds mirror the values the scorers were tuned
//! against — change them together or preference data stops being comparable
//! across batches.

use crate::error::{Result, TutorError};

use serde::{Deserialize, Serialize};

use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TutorConfig {
    pub server: ServerConfig,
    pub retrieval: RetrievalConfig,
    pub reward: RewardWeights,
    pub validator: ValidatorConfig,
    pub policy: PolicyConfig,
    pub srl: SrlConfig,
    pub capability: CapabilityConfig,
    pub dataset: DatasetConfig,
}

impl TutorConfig {
    /// Load from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|error| TutorError::Config(error.to_string()))
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8643".into(),
            db_path: "tutord.db".into(),
        }
    }
}

/// Hybrid ranker weights and filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetrievalConfig {
    /// Weight on the semantic similarity component.
    pub sim_weight: f64,
    /// Weight on the lexical relevance component.
    pub lexical_weight: f64,
    /// Multiplier applied to chunks from the caller's resource scope.
    pub resource_boost: f64,
    /// Whether to reward page locality among selected chunks.
    pub page_proximity: bool,
    /// Page distance still counted as "near" for the proximity bonus.
    pub proximity_window: u32,
    /// Additive bonus applied per proximate selection.
    pub proximity_bonus: f64,
    /// Relevance floors — a candidate passes if any floor is met.
    pub min_fused: f64,
    pub min_sim: f64,
    pub min_lexical: f64,
    /// Maximum chunks kept per (resource, page) before backfill.
    pub per_page: usize,
    /// Default k when the caller doesn't specify one.
    pub default_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            sim_weight: 0.7,
            lexical_weight: 0.3,
            resource_boost: 1.0,
            page_proximity: false,
            proximity_window: 2,
            proximity_bonus: 0.05,
            min_fused: 0.35,
            min_sim: 0.30,
            min_lexical: 0.15,
            per_page: 1,
            default_k: 4,
        }
    }
}

/// Fixed weights for the reward total. Normalized before use so partial
/// overrides in config.toml can't silently push the total past 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RewardWeights {
    pub rubric: f64,
    pub intent: f64,
    pub gating: f64,
    pub grounding: f64,
    pub style: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            rubric: 0.4,
            intent: 0.2,
            gating: 0.2,
            grounding: 0.15,
            style: 0.05,
        }
    }
}

impl RewardWeights {
    /// Weights scaled to sum to 1.0. A zero sum normalizes as all-zero.
    pub fn normalized(&self) -> NormalizedWeights {
        let sum = self.rubric + self.intent + self.gating + self.grounding + self.style;
        if sum <= f64::EPSILON {
            return NormalizedWeights::default();
        }
        NormalizedWeights {
            rubric: self.rubric / sum,
            intent: self.intent / sum,
            gating: self.gating / sum,
            grounding: self.grounding / sum,
            style: self.style / sum,
        }
    }
}

/// Reward weights after normalization.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NormalizedWeights {
    pub rubric: f64,
    pub intent: f64,
    pub gating: f64,
    pub grounding: f64,
    pub style: f64,
}

/// Marker lists and thresholds used by the reward validators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ValidatorConfig {
    pub banned_phrases: Vec<String>,
    pub suggestion_markers: Vec<String>,
    pub example_markers: Vec<String>,
    pub reasoning_markers: Vec<String>,
    pub direct_answer_markers: Vec<String>,
    pub min_words: usize,
    pub max_words: usize,
    pub advanced_term_penalty: f64,
    pub thresholds: ComponentThresholds,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            banned_phrases: vec![
                "as an ai language model".into(),
                "i am an ai".into(),
            ],
            suggestion_markers: vec![
                "try".into(),
                "consider".into(),
                "can you".into(),
                "let's".into(),
                "what about".into(),
            ],
            example_markers: vec![
                "for example".into(),
                "for instance".into(),
                "such as".into(),
                "e.g.".into(),
            ],
            reasoning_markers: vec![
                "because".into(),
                "therefore".into(),
                "so that".into(),
                "as a result".into(),
            ],
            direct_answer_markers: vec![
                "is".into(),
                "are".into(),
                "means".into(),
                "refers".into(),
                "defines".into(),
            ],
            min_words: 30,
            max_words: 220,
            advanced_term_penalty: 0.4,
            thresholds: ComponentThresholds::default(),
        }
    }
}

/// Per-component score floors. Scores below a floor add a
/// `<component>_below_threshold` flag to the reward payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ComponentThresholds {
    pub rubric: f64,
    pub intent: f64,
    pub gating: f64,
    pub grounding: f64,
    pub style: f64,
}

impl Default for ComponentThresholds {
    fn default() -> Self {
        Self {
            rubric: 0.6,
            intent: 0.6,
            gating: 0.7,
            grounding: 0.65,
            style: 0.5,
        }
    }
}

/// Action policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PolicyConfig {
    /// Whether the first encounter with a concept forces an introduction.
    pub cold_start_enabled: bool,
    /// Mastery below this (with no attempts) counts as a cold start.
    pub cold_start_mastery_floor: f64,
    /// Consecutive explains allowed before forcing an assessment.
    pub consecutive_explain_ceiling: u32,
    /// Mastery at or above this makes a prerequisite satisfied.
    pub prereq_mastery_threshold: f64,
    /// Mastery below this marks a prerequisite as weak.
    pub prereq_weak_threshold: f64,
    /// Classifier concept is skipped as focus once mastery reaches this.
    pub focus_mastered_cutoff: f64,
    /// Learning-path concepts below this are still eligible focus targets.
    pub path_advance_cutoff: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cold_start_enabled: true,
            cold_start_mastery_floor: 0.15,
            consecutive_explain_ceiling: 2,
            prereq_mastery_threshold: 0.6,
            prereq_weak_threshold: 0.4,
            focus_mastered_cutoff: 0.85,
            path_advance_cutoff: 0.8,
        }
    }
}

/// Self-reflective loop defaults. The loop itself is enabled per request;
/// these govern its behavior once on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SrlConfig {
    /// Fall back to the rule-based planner when the capability fails.
    pub fallback_to_rules: bool,
    /// Maximum plan steps executed per turn.
    pub max_steps: usize,
    /// Regenerations permitted per turn when the critique asks for one.
    pub revision_budget: u32,
    /// Whether the critique phase runs at all.
    pub self_critique: bool,
}

impl Default for SrlConfig {
    fn default() -> Self {
        Self {
            fallback_to_rules: true,
            max_steps: 4,
            revision_budget: 1,
            self_critique: true,
        }
    }
}

/// Language capability endpoints and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CapabilityConfig {
    pub base_url: String,
    /// Hard per-call timeout. Timeouts degrade the same way as failures.
    pub timeout_secs: u64,
    /// Use the deterministic mock instead of the HTTP client.
    pub mock: bool,
    /// Seed for the mock (reproducible rollouts).
    pub mock_seed: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            timeout_secs: 20,
            mock: false,
            mock_seed: 0,
        }
    }
}

/// Dataset emitter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DatasetConfig {
    /// Directory receiving append-only batch subdirectories.
    pub out_dir: String,
    /// Strip personally identifying free text from emitted records.
    pub redact: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            out_dir: "datasets".into(),
            redact: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reward_weights_normalize_to_one() {
        let weights = RewardWeights::default().normalized();
        let sum =
            weights.rubric + weights.intent + weights.gating + weights.grounding + weights.style;
        assert!((sum - 1.0).abs() < 1e-10);
    }

    #[test]
    fn zero_weights_normalize_to_zero() {
        let weights = RewardWeights {
            rubric: 0.0,
            intent: 0.0,
            gating: 0.0,
            grounding: 0.0,
            style: 0.0,
        };
        let normalized = weights.normalized();
        assert_eq!(normalized.rubric, 0.0);
        assert_eq!(normalized.style, 0.0);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config: TutorConfig = toml::from_str(
            r#"
            [retrieval]
            sim_weight = 0.5

            [policy]
            consecutive_explain_ceiling = 3
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.retrieval.sim_weight, 0.5);
        assert_eq!(config.retrieval.lexical_weight, 0.3);
        assert_eq!(config.policy.consecutive_explain_ceiling, 3);
        assert_eq!(config.validator.min_words, 30);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = TutorConfig::load(Path::new("/nonexistent/config.toml")).expect("defaults");
        assert_eq!(config.retrieval.sim_weight, 0.7);
    }
}
