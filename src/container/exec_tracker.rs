//! Exec tracker.
//!
//! Process-local map from exec id to the session that launched it. The agent
//! runner registers an exec here when it launches one and removes it on
//! cleanup; nothing else consults it for liveness — those checks go straight
//! to `ContainerEngine::exec_status` or `find_process`, since an exec id only
//! means anything to the process that launched it (a restart starts this
//! table empty, and the reconciler rebuilds what it needs from the engine and
//! the store, not from here).

use dashmap::DashMap;
use uuid::Uuid;

/// In-process exec tracker, keyed by exec id.
#[derive(Default)]
pub struct ExecTracker {
    owners: DashMap<String, Uuid>,
}

impl ExecTracker {
    pub fn new() -> Self {
        Self { owners: DashMap::new() }
    }

    /// Record that `exec_id` belongs to `session_id`.
    pub fn track(&self, exec_id: impl Into<String>, session_id: Uuid) {
        self.owners.insert(exec_id.into(), session_id);
    }

    pub fn forget(&self, exec_id: &str) {
        self.owners.remove(exec_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_then_forget_round_trips() {
        let tracker = ExecTracker::new();
        let session_id = Uuid::new_v4();
        tracker.track("exec-1", session_id);
        assert_eq!(tracker.owners.get("exec-1").map(|e| *e), Some(session_id));

        tracker.forget("exec-1");
        assert!(tracker.owners.get("exec-1").is_none());
    }
}
