//! Session registry: one serialized owner per session.
//!
//! Per-session policy counters are the only shared mutable state in the
//! pipeline, so concurrent turns for the same session must run one at a
//! time while turns for different sessions proceed fully in parallel. The
//! registry hands out one async mutex per session id; a turn holds that
//! lock across its whole read-decide-write section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Hands out per-session lock handles.
#[derive(Default)]
pub struct SessionRegistry {
    handles: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock handle for a session, created on first use. Clones of the
    /// same handle serialize against each other.
    pub fn handle(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut handles = self.handles.lock().expect("session registry lock poisoned");
        handles
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop handles nobody holds anymore. Called opportunistically; sessions
    /// reappear on next use.
    pub fn prune(&self) {
        let mut handles = self.handles.lock().expect("session registry lock poisoned");
        handles.retain(|_, handle| Arc::strong_count(handle) > 1);
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handles.lock().map(|map| map.len()).unwrap_or(0);
        f.debug_struct("SessionRegistry")
            .field("sessions", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn same_session_returns_the_same_handle() {
        let registry = SessionRegistry::new();
        let a = registry.handle("s-1");
        let b = registry.handle("s-1");
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.handle("s-2");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn same_session_turns_are_serialized() {
        let registry = Arc::new(SessionRegistry::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let handle = registry.handle("shared");
                let _guard = handle.lock().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while tasks.join_next().await.is_some() {}
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_sessions_run_in_parallel() {
        let registry = Arc::new(SessionRegistry::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..4 {
            let registry = registry.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let handle = registry.handle(&format!("s-{index}"));
                let _guard = handle.lock().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while tasks.join_next().await.is_some() {}
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn prune_drops_unheld_handles() {
        let registry = SessionRegistry::new();
        {
            let _held = registry.handle("held");
            registry.handle("dropped");
            registry.prune();
            let handles = registry.handles.lock().expect("lock");
            assert!(handles.contains_key("held"));
            assert!(!handles.contains_key("dropped"));
        }
    }
}
