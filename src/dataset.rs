//! Dataset emitter: validation, redaction, append-only versioned batches.
//!
//! Every emitted record carries a schema version; consumers must reject
//! unknown major versions rather than guess field meaning. Batches are
//! written to fresh directories and never rewritten — corrections are new
//! batches referencing the originals by record id.

use crate::config::DatasetConfig;
use crate::error::{Result, TutorError};
use crate::rollout::{PreferencePair, RolloutOutput, RolloutRecord};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Version stamped on every emitted record.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Major version this build reads and writes.
pub const SCHEMA_MAJOR: u64 = 1;

/// Placeholder for redacted free text.
const REDACTED: &str = "[redacted]";

/// Reject record versions this build cannot interpret.
pub fn check_schema_version(version: &str) -> Result<()> {
    let major = version
        .split('.')
        .next()
        .and_then(|part| part.parse::<u64>().ok())
        .ok_or_else(|| TutorError::InvalidRecord(format!("malformed schema version {version:?}")))?;
    if major != SCHEMA_MAJOR {
        return Err(TutorError::InvalidRecord(format!(
            "unknown schema major version {major} (expected {SCHEMA_MAJOR})"
        )));
    }
    Ok(())
}

/// Validate one rollout record against the persisted schema.
pub fn validate_record(record: &RolloutRecord) -> Result<()> {
    check_schema_version(&record.schema_version)?;

    if record.observation.user.user_id.trim().is_empty() {
        return Err(TutorError::InvalidRecord("empty user_id".into()));
    }

    if let Some(total) = record.reward.total
        && !(0.0..=1.0).contains(&total)
    {
        return Err(TutorError::InvalidRecord(format!(
            "reward total {total} outside [0,1]"
        )));
    }
    for component in [
        &record.reward.components.rubric,
        &record.reward.components.intent,
        &record.reward.components.gating,
        &record.reward.components.grounding,
        &record.reward.components.style,
    ] {
        if let Some(score) = component.score
            && !(0.0..=1.0).contains(&score)
        {
            return Err(TutorError::InvalidRecord(format!(
                "component {} score {score} outside [0,1]",
                component.name
            )));
        }
    }
    for (name, value) in [
        ("clarity", record.critic.clarity),
        ("accuracy", record.critic.accuracy),
        ("support", record.critic.support),
        ("confidence", record.critic.confidence),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(TutorError::InvalidRecord(format!(
                "critic {name} {value} outside [0,1]"
            )));
        }
    }

    for id in &record.action.source_chunk_ids {
        if !record.observation.retrieval.contains_chunk(id) {
            return Err(TutorError::InvalidRecord(format!(
                "source chunk {id} not in the observation's retrieval set"
            )));
        }
    }
    Ok(())
}

/// Validate a preference pair, including the label invariant.
pub fn validate_pair(pair: &PreferencePair) -> Result<()> {
    check_schema_version(&pair.schema_version)?;
    validate_record(&pair.chosen)?;
    validate_record(&pair.rejected)?;

    if let (Some(chosen), Some(rejected)) = (pair.chosen.reward.total, pair.rejected.reward.total) {
        if chosen < rejected {
            return Err(TutorError::InvalidRecord(format!(
                "preference inversion: chosen {chosen} < rejected {rejected}"
            )));
        }
        if chosen == rejected {
            return Err(TutorError::InvalidRecord(
                "preference pair with equal totals".into(),
            ));
        }
    }
    Ok(())
}

/// Strip personally identifying free text in place: the user id becomes a
/// stable hash and the raw message is dropped.
pub fn redact_record(record: &mut RolloutRecord) {
    record.observation.user.user_id = hash_identity(&record.observation.user.user_id);
    record.observation.user.message = REDACTED.into();
}

fn hash_identity(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let hex: String = digest.iter().take(6).map(|byte| format!("{byte:02x}")).collect();
    format!("user-{hex}")
}

/// Manifest describing one emitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    pub batch_id: String,
    pub schema_version: String,
    pub created_at: String,
    pub dir: PathBuf,
    pub sft_count: usize,
    pub prefs_count: usize,
    pub redacted: bool,
}

/// Writes validated rollout outputs as append-only batch directories.
#[derive(Debug, Clone)]
pub struct DatasetEmitter {
    out_dir: PathBuf,
    redact: bool,
}

impl DatasetEmitter {
    pub fn new(config: &DatasetConfig) -> Self {
        Self {
            out_dir: PathBuf::from(&config.out_dir),
            redact: config.redact,
        }
    }

    pub fn with_out_dir(out_dir: &Path, redact: bool) -> Self {
        Self {
            out_dir: out_dir.to_owned(),
            redact,
        }
    }

    /// Validate and persist one batch. Every record must pass validation
    /// before anything is written — a batch is all-or-nothing.
    pub fn emit_batch(&self, output: &RolloutOutput) -> Result<BatchManifest> {
        let mut sft = output.sft.clone();
        let mut prefs = output.prefs.clone();
        if self.redact {
            for record in &mut sft {
                redact_record(record);
            }
            for pair in &mut prefs {
                redact_record(&mut pair.chosen);
                redact_record(&mut pair.rejected);
            }
        }
        for record in &sft {
            validate_record(record)?;
        }
        for pair in &prefs {
            validate_pair(pair)?;
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let dir = self.out_dir.join(format!("batch-{batch_id}"));
        std::fs::create_dir_all(&self.out_dir)?;
        // create_dir (not create_dir_all) so an existing batch directory is
        // an error: emitted batches are never rewritten.
        std::fs::create_dir(&dir)?;

        let sft_path = dir.join("sft.jsonl");
        let prefs_path = dir.join("prefs.jsonl");
        write_jsonl(&sft_path, &sft)?;
        write_jsonl(&prefs_path, &prefs)?;

        let manifest = BatchManifest {
            batch_id,
            schema_version: SCHEMA_VERSION.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            dir: dir.clone(),
            sft_count: sft.len(),
            prefs_count: prefs.len(),
            redacted: self.redact,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|error| TutorError::InvalidRecord(error.to_string()))?;
        std::fs::write(dir.join("manifest.json"), manifest_json)?;

        tracing::info!(
            batch_id = %manifest.batch_id,
            sft = manifest.sft_count,
            prefs = manifest.prefs_count,
            redacted = manifest.redacted,
            "emitted dataset batch"
        );
        Ok(manifest)
    }
}

fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    for row in rows {
        let line = serde_json::to_string(row)
            .map_err(|error| TutorError::InvalidRecord(error.to_string()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{TurnRequest, TutorAgent};
    use crate::capability::CapabilityClient;
    use crate::config::TutorConfig;
    use crate::rollout::{RolloutConfig, RolloutEntry, run_rollout};
    use crate::store::TutorStore;

    use std::sync::Arc;

    async fn sample_output() -> RolloutOutput {
        let store = TutorStore::connect_in_memory().await.expect("store");
        let agent = Arc::new(TutorAgent::new(
            store,
            Arc::new(CapabilityClient::Mock),
            TutorConfig::default(),
        ));
        let entry = RolloutEntry {
            payload: TurnRequest {
                message: "what is heat flux?".into(),
                user_id: "learner@example.com".into(),
                target_concepts: vec!["heat flux".into()],
                ..Default::default()
            },
            observation: None,
        };
        let config = RolloutConfig {
            candidates: 3,
            mock: true,
            seed: Some(11),
            ..Default::default()
        };
        run_rollout(&agent, &[entry], &config).await.expect("rollout")
    }

    #[test]
    fn schema_version_gate_rejects_unknown_majors() {
        assert!(check_schema_version("1.0.0").is_ok());
        assert!(check_schema_version("1.4.2").is_ok());
        assert!(check_schema_version("2.0.0").is_err());
        assert!(check_schema_version("garbage").is_err());
    }

    #[tokio::test]
    async fn valid_records_pass_validation() {
        let output = sample_output().await;
        for record in &output.sft {
            validate_record(record).expect("valid record");
        }
        for pair in &output.prefs {
            validate_pair(pair).expect("valid pair");
        }
    }

    #[tokio::test]
    async fn out_of_range_scores_fail_validation() {
        let output = sample_output().await;
        let mut record = output.sft[0].clone();
        record.reward.total = Some(1.5);
        assert!(matches!(
            validate_record(&record),
            Err(TutorError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn foreign_source_chunks_fail_validation() {
        let output = sample_output().await;
        let mut record = output.sft[0].clone();
        record.action.source_chunk_ids.push("chunk-from-nowhere".into());
        assert!(validate_record(&record).is_err());
    }

    #[tokio::test]
    async fn preference_inversion_fails_validation() {
        let output = sample_output().await;
        let Some(pair) = output.prefs.first() else {
            return;
        };
        let mut inverted = pair.clone();
        inverted.chosen.reward.total = Some(0.1);
        inverted.rejected.reward.total = Some(0.9);
        assert!(validate_pair(&inverted).is_err());
    }

    #[tokio::test]
    async fn redaction_hashes_identity_and_strips_message() {
        let output = sample_output().await;
        let mut record = output.sft[0].clone();
        redact_record(&mut record);
        assert!(record.observation.user.user_id.starts_with("user-"));
        assert!(!record.observation.user.user_id.contains("learner"));
        assert_eq!(record.observation.user.message, REDACTED);

        // The hash is stable so records from one learner stay linkable.
        let mut again = output.sft[1].clone();
        redact_record(&mut again);
        assert_eq!(record.observation.user.user_id, again.observation.user.user_id);
    }

    #[tokio::test]
    async fn emit_batch_writes_jsonl_and_manifest() {
        let output = sample_output().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let emitter = DatasetEmitter::with_out_dir(dir.path(), false);
        let manifest = emitter.emit_batch(&output).expect("emit");

        assert_eq!(manifest.sft_count, 3);
        let sft_raw = std::fs::read_to_string(manifest.dir.join("sft.jsonl")).expect("sft");
        assert_eq!(sft_raw.lines().count(), 3);
        assert!(manifest.dir.join("manifest.json").exists());
        assert!(manifest.dir.join("prefs.jsonl").exists());

        // Every line round-trips through the schema gate.
        for line in sft_raw.lines() {
            let record: RolloutRecord = serde_json::from_str(line).expect("parse");
            validate_record(&record).expect("valid");
        }
    }

    #[tokio::test]
    async fn batches_are_append_only() {
        let output = sample_output().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let emitter = DatasetEmitter::with_out_dir(dir.path(), false);
        let first = emitter.emit_batch(&output).expect("emit");
        let first_contents =
            std::fs::read_to_string(first.dir.join("sft.jsonl")).expect("read");

        let second = emitter.emit_batch(&output).expect("emit");
        assert_ne!(first.dir, second.dir);
        // The first batch is byte-identical after the second emit.
        let reread = std::fs::read_to_string(first.dir.join("sft.jsonl")).expect("read");
        assert_eq!(first_contents, reread);
    }

    #[tokio::test]
    async fn redacting_emitter_persists_redacted_records() {
        let output = sample_output().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let emitter = DatasetEmitter::with_out_dir(dir.path(), true);
        let manifest = emitter.emit_batch(&output).expect("emit");
        assert!(manifest.redacted);
        let raw = std::fs::read_to_string(manifest.dir.join("sft.jsonl")).expect("read");
        assert!(!raw.contains("learner@example.com"));
    }
}
