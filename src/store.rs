//! TutorStore: CRUD operations against tutord.db.
//!
//! Sessions, turns, events, mastery, the concept prerequisite graph, and the
//! chunk candidate pool all live in one SQLite file with WAL enabled and a
//! small pool. Schema migrations are embedded raw SQL so the daemon owns its
//! own database lifecycle.

use crate::error::{Result, TutorError};
use crate::policy::{ActionType, MasteryMap, MasterySnapshot, SessionPolicy};
use crate::retrieval::ChunkCandidate;

use sqlx::Row as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// One persisted session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub resource_id: Option<String>,
    pub target_concepts: Vec<String>,
    pub policy: SessionPolicy,
    pub last_concept: Option<String>,
    pub last_action: Option<ActionType>,
}

pub struct TutorStore {
    pool: SqlitePool,
}

impl TutorStore {
    /// Connect to (or create) the database at the given path.
    pub async fn connect(path: &Path) -> Result<Arc<Self>> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| TutorError::Config(format!("invalid db path: {error}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        Ok(Arc::new(Self { pool }))
    }

    /// In-memory store for tests. Single connection — each SQLite memory
    /// database is private to its connection.
    pub async fn connect_in_memory() -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|error| TutorError::Config(error.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Arc::new(Self { pool }))
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::raw_sql(SCHEMA_V1).execute(pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- Sessions -----------------------------------------------------------

    /// Resolve or create a session. A provided id that doesn't exist yet is
    /// created as-is so callers can pre-allocate ids.
    pub async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        target_concepts: &[String],
        resource_id: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = session_id
            && self.get_session(id).await?.is_some()
        {
            return Ok(id.to_owned());
        }
        let id = session_id
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let targets_json = serde_json::to_string(target_concepts)
            .map_err(|error| TutorError::Config(error.to_string()))?;
        let policy_json = serde_json::to_string(&SessionPolicy::default())
            .map_err(|error| TutorError::Config(error.to_string()))?;
        sqlx::query(
            "INSERT INTO sessions (id, user_id, resource_id, target_concepts, policy, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, datetime('now'), datetime('now'))",
        )
        .bind(&id)
        .bind(user_id)
        .bind(resource_id)
        .bind(&targets_json)
        .bind(&policy_json)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query(
            "SELECT id, user_id, resource_id, target_concepts, policy, last_concept, \
             last_action FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let targets_json: String = row.try_get("target_concepts")?;
        let policy_json: String = row.try_get("policy")?;
        let last_action: Option<String> = row.try_get("last_action")?;
        Ok(Some(SessionRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            resource_id: row.try_get("resource_id")?,
            target_concepts: serde_json::from_str(&targets_json).unwrap_or_default(),
            policy: serde_json::from_str(&policy_json).unwrap_or_default(),
            last_concept: row.try_get("last_concept")?,
            last_action: last_action.as_deref().map(ActionType::from_str_lossy),
        }))
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        last_concept: Option<&str>,
        last_action: ActionType,
        policy: &SessionPolicy,
    ) -> Result<()> {
        let policy_json = serde_json::to_string(policy)
            .map_err(|error| TutorError::Config(error.to_string()))?;
        sqlx::query(
            "UPDATE sessions SET last_concept = ?, last_action = ?, policy = ?, \
             updated_at = datetime('now') WHERE id = ?",
        )
        .bind(last_concept)
        .bind(last_action.to_string())
        .bind(&policy_json)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Turns --------------------------------------------------------------

    /// Next monotonic turn index for a session. Callers hold the session
    /// lock across this read and the matching insert.
    pub async fn next_turn_index(&self, session_id: &str) -> Result<u64> {
        let row =
            sqlx::query("SELECT COALESCE(MAX(turn_index), -1) AS last FROM turns WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        let last: i64 = row.try_get("last")?;
        Ok((last + 1) as u64)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_turn(
        &self,
        session_id: &str,
        turn_index: u64,
        message: &str,
        intent: &str,
        affect: &str,
        concept: Option<&str>,
        action_type: ActionType,
        response: &str,
        source_chunk_ids: &[String],
        confidence: f64,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let sources_json = serde_json::to_string(source_chunk_ids)
            .map_err(|error| TutorError::Config(error.to_string()))?;
        sqlx::query(
            "INSERT INTO turns (id, session_id, turn_index, message, intent, affect, concept, \
             action_type, response, source_chunk_ids, confidence, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        )
        .bind(&id)
        .bind(session_id)
        .bind(turn_index as i64)
        .bind(message)
        .bind(intent)
        .bind(affect)
        .bind(concept)
        .bind(action_type.to_string())
        .bind(response)
        .bind(&sources_json)
        .bind(confidence)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Log a pipeline event to the audit trail.
    pub async fn log_event(
        &self,
        session_id: &str,
        event_type: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let payload_json = payload.map(|value| value.to_string());
        sqlx::query(
            "INSERT INTO events (id, session_id, event_type, payload, created_at) \
             VALUES (?, ?, ?, ?, datetime('now'))",
        )
        .bind(&id)
        .bind(session_id)
        .bind(event_type)
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Mastery ------------------------------------------------------------

    pub async fn fetch_mastery_map(&self, user_id: &str) -> Result<MasteryMap> {
        let rows = sqlx::query(
            "SELECT concept, mastery, attempts, correct FROM concept_mastery WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut map = MasteryMap::new();
        for row in rows {
            let concept: String = row.try_get("concept")?;
            let mastery: Option<f64> = row.try_get("mastery")?;
            let attempts: i64 = row.try_get("attempts")?;
            let correct: i64 = row.try_get("correct")?;
            map.insert(
                concept,
                MasterySnapshot {
                    mastery,
                    attempts: attempts.max(0) as u32,
                    correct: correct.max(0) as u32,
                },
            );
        }
        Ok(map)
    }

    pub async fn upsert_mastery(
        &self,
        user_id: &str,
        concept: &str,
        snapshot: &MasterySnapshot,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO concept_mastery (user_id, concept, mastery, attempts, correct) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, concept) DO UPDATE SET mastery = excluded.mastery, \
             attempts = excluded.attempts, correct = excluded.correct",
        )
        .bind(user_id)
        .bind(concept)
        .bind(snapshot.mastery)
        .bind(snapshot.attempts as i64)
        .bind(snapshot.correct as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Prerequisite graph --------------------------------------------------

    pub async fn insert_prereq_edge(&self, prereq: &str, concept: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO concept_edges (prereq, concept) VALUES (?, ?)",
        )
        .bind(prereq)
        .bind(concept)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ordered prerequisite chain for the given concepts: ancestors first,
    /// each concept after everything it depends on, de-duplicated. Falls back
    /// to the de-duplicated input when the graph has no edges for them.
    pub async fn fetch_prereq_chain(
        &self,
        concepts: &[String],
        max_depth: usize,
    ) -> Result<Vec<String>> {
        let mut order: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for concept in concepts {
            if concept.is_empty() {
                continue;
            }
            // Breadth-first walk up the prerequisite edges, then emit the
            // furthest ancestors first.
            let mut ancestors: Vec<String> = Vec::new();
            let mut queue: VecDeque<(String, usize)> = VecDeque::new();
            let mut visited: HashSet<String> = HashSet::new();
            queue.push_back((concept.clone(), 0));
            visited.insert(concept.clone());

            while let Some((current, depth)) = queue.pop_front() {
                if depth >= max_depth {
                    continue;
                }
                let rows = sqlx::query("SELECT prereq FROM concept_edges WHERE concept = ?")
                    .bind(&current)
                    .fetch_all(&self.pool)
                    .await?;
                for row in rows {
                    let prereq: String = row.try_get("prereq")?;
                    if visited.insert(prereq.clone()) {
                        ancestors.push(prereq.clone());
                        queue.push_back((prereq, depth + 1));
                    }
                }
            }

            for ancestor in ancestors.into_iter().rev() {
                if seen.insert(ancestor.clone()) {
                    order.push(ancestor);
                }
            }
            if seen.insert(concept.clone()) {
                order.push(concept.clone());
            }
        }
        Ok(order)
    }

    // -- Chunk candidate pool ------------------------------------------------

    pub async fn insert_chunk(&self, chunk: &ChunkCandidate) -> Result<()> {
        let embedding_json = chunk
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| TutorError::Config(error.to_string()))?;
        sqlx::query(
            "INSERT INTO chunks (id, resource_id, page_number, seq, snippet, pedagogy_role, \
             embedding) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.resource_id)
        .bind(chunk.page_number.map(|page| page as i64))
        .bind(chunk.seq as i64)
        .bind(&chunk.snippet)
        .bind(&chunk.pedagogy_role)
        .bind(&embedding_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Candidate pool for a retrieval scope, in creation order.
    pub async fn fetch_candidates(
        &self,
        resource_id: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = match resource_id {
            Some(resource_id) => {
                sqlx::query(
                    "SELECT id, resource_id, page_number, seq, snippet, pedagogy_role, embedding \
                     FROM chunks WHERE resource_id = ? ORDER BY seq",
                )
                .bind(resource_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, resource_id, page_number, seq, snippet, pedagogy_role, embedding \
                     FROM chunks ORDER BY seq",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding_json: Option<String> = row.try_get("embedding")?;
            let page_number: Option<i64> = row.try_get("page_number")?;
            let seq: i64 = row.try_get("seq")?;
            candidates.push(ChunkCandidate {
                id: row.try_get("id")?,
                resource_id: row.try_get("resource_id")?,
                page_number: page_number.map(|page| page.max(0) as u32),
                seq: seq.max(0) as u64,
                snippet: row.try_get("snippet")?,
                pedagogy_role: row.try_get("pedagogy_role")?,
                embedding: embedding_json
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok()),
            });
        }
        Ok(candidates)
    }
}

impl std::fmt::Debug for TutorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TutorStore").finish_non_exhaustive()
    }
}

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    resource_id TEXT,
    target_concepts TEXT NOT NULL DEFAULT '[]',
    policy TEXT NOT NULL DEFAULT '{}',
    last_concept TEXT,
    last_action TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    turn_index INTEGER NOT NULL,
    message TEXT NOT NULL,
    intent TEXT NOT NULL,
    affect TEXT NOT NULL,
    concept TEXT,
    action_type TEXT NOT NULL,
    response TEXT NOT NULL,
    source_chunk_ids TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, turn_index)
);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS concept_mastery (
    user_id TEXT NOT NULL,
    concept TEXT NOT NULL,
    mastery REAL,
    attempts INTEGER NOT NULL DEFAULT 0,
    correct INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, concept)
);

CREATE TABLE IF NOT EXISTS concept_edges (
    prereq TEXT NOT NULL,
    concept TEXT NOT NULL,
    PRIMARY KEY (prereq, concept)
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    resource_id TEXT,
    page_number INTEGER,
    seq INTEGER NOT NULL,
    snippet TEXT NOT NULL,
    pedagogy_role TEXT,
    embedding TEXT
);

CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id);
CREATE INDEX IF NOT EXISTS idx_chunks_resource ON chunks(resource_id);
"#;
