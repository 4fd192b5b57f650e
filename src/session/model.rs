//! Session entity and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `status` field of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    /// Whether `self -> next` is a legal transition in the session state diagram.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Creating, Running) | (Creating, Error) | (Running, Stopped) | (Stopped, Running)
        )
    }
}

/// A long-lived unit of work: its own repository checkout, container, and transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub display_name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub initial_prompt: Option<String>,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub workspace_volume: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        display_name: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        initial_prompt: Option<String>,
        workspace_volume: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
            initial_prompt,
            status: SessionStatus::Creating,
            container_id: None,
            workspace_volume: workspace_volume.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn repo_coordinates(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Apply a status transition, validating it against the state machine.
    /// Returns the previous status on success.
    pub fn transition(&mut self, next: SessionStatus) -> Result<SessionStatus, String> {
        if !self.status.can_transition_to(next) {
            return Err(format!("illegal transition {:?} -> {:?}", self.status, next));
        }
        let prev = self.status;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(prev)
    }

    /// Force the status without validating the transition table; used by the
    /// reconciler, which observes ground truth rather than requesting a move.
    pub fn force_status(&mut self, next: SessionStatus) {
        self.status = next;
        self.updated_at = Utc::now();
    }

    pub fn set_container_id(&mut self, container_id: Option<String>) {
        self.container_id = container_id;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert!(SessionStatus::Creating.can_transition_to(SessionStatus::Running));
        assert!(SessionStatus::Creating.can_transition_to(SessionStatus::Error));
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Stopped));
        assert!(SessionStatus::Stopped.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(!SessionStatus::Stopped.can_transition_to(SessionStatus::Error));
        assert!(!SessionStatus::Error.can_transition_to(SessionStatus::Running));
        assert!(!SessionStatus::Running.can_transition_to(SessionStatus::Creating));
    }

    #[test]
    fn session_transition_updates_timestamp_and_rejects_illegal_moves() {
        let mut session = Session::new("demo", "acme", "widgets", "main", None, "vol-1");
        let before = session.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        session.transition(SessionStatus::Running).unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.updated_at > before);

        let err = session.transition(SessionStatus::Creating).unwrap_err();
        assert!(err.contains("illegal transition"));
    }
}
