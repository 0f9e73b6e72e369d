//! Crate-wide error taxonomy.
//!
//! Only two variants are ever surfaced to callers: `EmptyPool` (the retrieval
//! scope has nothing to rank) and `MissingContext` (no user identity, so
//! mastery-dependent behavior cannot proceed). `CapabilityUnavailable` is
//! always recovered locally through the documented degraded defaults, and
//! `ScoringInconsistency` downgrades the affected reward component to its
//! worst case instead of failing a turn.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TutorError>;

/// Errors raised by the tutor pipeline.
#[derive(Debug, Error)]
pub enum TutorError {
    /// The retrieval scope yielded zero candidates. Never padded over.
    #[error("retrieval scope has no candidates{}", scope_suffix(.0))]
    EmptyPool(Option<String>),

    /// A user identifier is required for mastery tracking.
    #[error("missing context: {0}")]
    MissingContext(&'static str),

    /// A language capability (classifier, planner, critic, generator) was
    /// unreachable, timed out, or returned malformed output. Recovered
    /// locally, never surfaced as a turn failure.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// A scorer received a response citing chunk ids absent from the
    /// observation's retrieval set.
    #[error("scoring inconsistency: {0}")]
    ScoringInconsistency(String),

    /// An emitted record failed schema validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn scope_suffix(scope: &Option<String>) -> String {
    match scope {
        Some(resource) => format!(" (resource {resource})"),
        None => String::new(),
    }
}

impl TutorError {
    /// Whether this error must reach the caller rather than degrade.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::EmptyPool(_) | Self::MissingContext(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pool_and_context_errors_are_user_visible() {
        assert!(TutorError::EmptyPool(None).is_user_visible());
        assert!(TutorError::MissingContext("user_id").is_user_visible());
        assert!(!TutorError::CapabilityUnavailable("timeout".into()).is_user_visible());
        assert!(!TutorError::ScoringInconsistency("unknown chunk".into()).is_user_visible());
    }

    #[test]
    fn empty_pool_message_includes_scope() {
        let error = TutorError::EmptyPool(Some("res-1".into()));
        assert!(error.to_string().contains("res-1"));
    }
}
