//! Idle auth sessions.
//!
//! Bearer-token table with idle expiry and best-effort rotation. Owned here
//! rather than by the HTTP façade because rotation has to be atomic with the
//! token lookup; the façade (out of scope for this crate) is the only caller.
//! Persistence follows the same temp-then-rename idiom as `store::sessions`,
//! keyed by token instead of session-id since a token is how every request
//! arrives.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::errors::{Result, RuntimeError};

/// Default lifetime granted to a freshly issued session, absent any other
/// signal from the caller. Idle expiry and rotation bound the practical
/// lifetime far more tightly than this; it's just a generous outer ceiling.
const DEFAULT_SESSION_LIFETIME_DAYS: i64 = 30;

/// One bearer-token session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub expiry: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub device_label: Option<String>,
}

impl AuthSession {
    fn is_honored(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expiry
    }
}

/// Result of [`AuthManager::validate`]: the (possibly rotated) session, and
/// the new token the caller must hand back to the client when rotation fired.
pub struct ValidateOutcome {
    pub session: AuthSession,
    pub rotated_token: Option<String>,
}

struct AuthStore {
    path: PathBuf,
    rows: RwLock<HashMap<String, AuthSession>>,
}

impl AuthStore {
    async fn load(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rows = if path.is_file() {
            let text = tokio::fs::read_to_string(&path).await?;
            if text.trim().is_empty() { HashMap::new() } else { serde_json::from_str(&text)? }
        } else {
            HashMap::new()
        };
        Ok(Self { path, rows: RwLock::new(rows) })
    }

    async fn flush(&self, rows: &HashMap<String, AuthSession>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn insert(&self, session: AuthSession) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(session.token.clone(), session);
        self.flush(&rows).await
    }

    async fn get(&self, token: &str) -> Option<AuthSession> {
        self.rows.read().await.get(token).cloned()
    }

    async fn revoke(&self, token: &str, now: DateTime<Utc>) -> Result<AuthSession> {
        let mut rows = self.rows.write().await;
        let session = rows.get_mut(token).ok_or_else(|| RuntimeError::not_found("auth session", token))?;
        session.revoked_at = Some(now);
        let updated = session.clone();
        self.flush(&rows).await?;
        Ok(updated)
    }

    /// Fire-and-forget last-activity bump. Races with a
    /// concurrent rotation or revoke are tolerated: if the token has already
    /// moved on, there is nothing to touch.
    async fn touch(&self, token: &str, now: DateTime<Utc>) {
        let mut rows = self.rows.write().await;
        if let Some(session) = rows.get_mut(token) {
            session.last_activity = now;
        } else {
            return;
        }
        if let Err(e) = self.flush(&rows).await {
            warn!("auth: failed to persist activity touch: {e}");
        }
    }

    /// Atomically replace `old_token` with a freshly minted one.
    /// Best-effort — if `old_token` is gone by the time the write lock is
    /// acquired (a concurrent request already rotated it), returns `None` and
    /// the caller proceeds with the session it already had in hand.
    async fn rotate(&self, old_token: &str, now: DateTime<Utc>) -> Result<Option<AuthSession>> {
        let mut rows = self.rows.write().await;
        let Some(mut session) = rows.remove(old_token) else {
            return Ok(None);
        };
        session.token = Uuid::new_v4().to_string();
        session.last_activity = now;
        rows.insert(session.token.clone(), session.clone());
        self.flush(&rows).await?;
        Ok(Some(session))
    }
}

/// Owns the bearer-token table: issue, validate, revoke, and idle rotation.
pub struct AuthManager {
    config: Arc<RuntimeConfig>,
    store: AuthStore,
}

impl AuthManager {
    pub async fn open(config: Arc<RuntimeConfig>, workspace_root: &std::path::Path) -> Result<Self> {
        let store = AuthStore::load(crate::env::auth_sessions_file_path(workspace_root)).await?;
        Ok(Self { config, store })
    }

    /// Issue a new session for a freshly authenticated device/client.
    pub async fn issue(&self, device_label: Option<String>) -> Result<AuthSession> {
        let now = Utc::now();
        let session = AuthSession {
            token: Uuid::new_v4().to_string(),
            expiry: now + Duration::days(DEFAULT_SESSION_LIFETIME_DAYS),
            last_activity: now,
            revoked_at: None,
            device_label,
        };
        self.store.insert(session.clone()).await?;
        Ok(session)
    }

    pub async fn revoke(&self, token: &str) -> Result<()> {
        self.store.revoke(token, Utc::now()).await?;
        Ok(())
    }

    /// Validate a bearer token, rotating it if the idle window demands it. Run
    /// on every request carrying a token.
    pub async fn validate(&self, token: &str) -> Result<ValidateOutcome> {
        let now = Utc::now();
        let session = self.store.get(token).await.ok_or_else(|| RuntimeError::precondition("auth token unknown"))?;
        if !session.is_honored(now) {
            return Err(RuntimeError::precondition("auth token revoked or expired"));
        }

        let idle = now.signed_duration_since(session.last_activity);
        if idle > Duration::seconds(self.config.auth_idle_timeout_secs) {
            return Err(RuntimeError::precondition("auth token idle timeout exceeded"));
        }

        if idle > Duration::seconds(self.config.auth_rotation_interval_secs) {
            match self.store.rotate(token, now).await {
                Ok(Some(rotated)) => {
                    return Ok(ValidateOutcome { rotated_token: Some(rotated.token.clone()), session: rotated });
                }
                Ok(None) => {
                    // Lost the race to a concurrent rotation; fall through with the
                    // session as originally loaded.
                }
                Err(e) => warn!("auth: rotation failed, proceeding with existing token: {e}"),
            }
            return Ok(ValidateOutcome { session, rotated_token: None });
        }

        if idle > Duration::seconds(self.config.auth_activity_throttle_secs) {
            self.store.touch(token, now).await;
        }

        Ok(ValidateOutcome { session, rotated_token: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(idle_secs: i64) -> AuthSession {
        let now = Utc::now();
        AuthSession {
            token: "tok".into(),
            expiry: now + Duration::days(1),
            last_activity: now - Duration::seconds(idle_secs),
            revoked_at: None,
            device_label: None,
        }
    }

    #[test]
    fn revoked_or_expired_sessions_are_not_honored() {
        let now = Utc::now();
        let mut s = session(0);
        assert!(s.is_honored(now));
        s.revoked_at = Some(now);
        assert!(!s.is_honored(now));

        let mut expired = session(0);
        expired.expiry = now - Duration::seconds(1);
        assert!(!expired.is_honored(now));
    }

    #[tokio::test]
    async fn issue_then_validate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RuntimeConfig::default());
        let manager = AuthManager::open(config, dir.path()).await.unwrap();

        let issued = manager.issue(Some("cli".into())).await.unwrap();
        let outcome = manager.validate(&issued.token).await.unwrap();
        assert_eq!(outcome.session.token, issued.token);
        assert!(outcome.rotated_token.is_none());
    }

    #[tokio::test]
    async fn idle_past_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.auth_idle_timeout_secs = 1;
        let config = Arc::new(config);
        let manager = AuthManager::open(config, dir.path()).await.unwrap();

        let issued = manager.issue(None).await.unwrap();
        manager.store.touch(&issued.token, Utc::now() - Duration::seconds(10)).await;
        let err = manager.validate(&issued.token).await.unwrap_err();
        assert!(err.to_string().contains("idle"));
    }

    #[tokio::test]
    async fn rotation_issues_a_new_token_and_retires_the_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.auth_rotation_interval_secs = 1;
        config.auth_idle_timeout_secs = 1_000_000;
        let config = Arc::new(config);
        let manager = AuthManager::open(config, dir.path()).await.unwrap();

        let issued = manager.issue(None).await.unwrap();
        manager.store.touch(&issued.token, Utc::now() - Duration::seconds(10)).await;

        let outcome = manager.validate(&issued.token).await.unwrap();
        let new_token = outcome.rotated_token.expect("rotation should have fired");
        assert_ne!(new_token, issued.token);
        assert!(manager.validate(&issued.token).await.is_err());
        assert!(manager.validate(&new_token).await.is_ok());
    }

    #[tokio::test]
    async fn revoke_makes_the_token_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RuntimeConfig::default());
        let manager = AuthManager::open(config, dir.path()).await.unwrap();

        let issued = manager.issue(None).await.unwrap();
        manager.revoke(&issued.token).await.unwrap();
        assert!(manager.validate(&issued.token).await.is_err());
    }
}
