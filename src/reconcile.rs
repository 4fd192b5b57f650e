//! Reconciler.
//!
//! Runs once at startup and on a timer thereafter. Two independent passes:
//! align session rows with observed container state, then remove orphan
//! containers that match the session-name prefix but own no session row.
//! Orphaned `AgentExecution` rows are reconciled separately via
//! [`crate::agent::reconnect`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agent::AgentRunner;
use crate::config::RuntimeConfig;
use crate::container::{ContainerEngine, ObservedStatus};
use crate::events::EventBus;
use crate::session::model::SessionStatus;
use crate::store::Store;

pub struct Reconciler {
    config: Arc<RuntimeConfig>,
    engine: Arc<ContainerEngine>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    runner: Arc<AgentRunner>,
}

/// Tally of one reconciliation pass, useful for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub sessions_updated: u32,
    pub orphan_containers_removed: u32,
    pub executions_reconnected: u32,
    pub executions_dropped: u32,
}

impl Reconciler {
    pub fn new(config: Arc<RuntimeConfig>, engine: Arc<ContainerEngine>, store: Arc<Store>, bus: Arc<EventBus>, runner: Arc<AgentRunner>) -> Self {
        Self { config, engine, store, bus, runner }
    }

    /// Run both passes once, then reconcile orphaned agent executions.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let observed = match self.engine.list_session_containers().await {
            Ok(v) => v,
            Err(e) => {
                warn!("reconciler: failed to list session containers, skipping pass: {e}");
                return report;
            }
        };

        self.reconcile_sessions(&observed, &mut report).await;
        self.reconcile_orphan_containers(&observed, &mut report).await;
        self.reconcile_executions(&mut report).await;

        info!(
            "reconciliation pass complete: {} sessions updated, {} orphan containers removed, \
             {} executions reconnected, {} executions dropped",
            report.sessions_updated, report.orphan_containers_removed, report.executions_reconnected, report.executions_dropped
        );
        report
    }

    /// Run `run_once` forever on `reconcile_interval_secs`, starting with one
    /// immediate pass so startup state converges before the first tick.
    pub async fn run_forever(self: Arc<Self>) {
        self.run_once().await;
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_secs));
        ticker.tick().await; // first tick is immediate; the pass above already covered it
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// Apply the transition table for every non-`creating` session with a
    /// stored container-id, reconciling it against observed container state.
    async fn reconcile_sessions(&self, observed: &[crate::container::SessionContainerEntry], report: &mut ReconcileReport) {
        for session in self.store.list_sessions().await {
            if session.status == SessionStatus::Creating {
                continue;
            }
            let Some(container_id) = session.container_id.clone() else { continue };

            let found = observed.iter().find(|c| c.session_id == session.id);
            let (new_status, new_container_id) = match found {
                Some(entry) if entry.container_id != container_id => {
                    // Container was recreated under the same session; trust the new id's status.
                    let status = match entry.status {
                        ObservedStatus::Running => SessionStatus::Running,
                        _ => SessionStatus::Stopped,
                    };
                    (Some(status), Some(entry.container_id.clone()))
                }
                Some(entry) => {
                    let status = match (session.status, entry.status) {
                        (SessionStatus::Running, ObservedStatus::Running) => None,
                        (SessionStatus::Running, _) => Some(SessionStatus::Stopped),
                        (SessionStatus::Stopped, ObservedStatus::Running) => Some(SessionStatus::Running),
                        (SessionStatus::Stopped, _) => None,
                        _ => None,
                    };
                    (status, None)
                }
                None => {
                    // Not found in the snapshot at all: treat like "stopped or not_found".
                    let status = match session.status {
                        SessionStatus::Running => Some(SessionStatus::Stopped),
                        _ => None,
                    };
                    (status, None)
                }
            };

            if new_status.is_none() && new_container_id.is_none() {
                continue;
            }

            let session_id = session.id;
            let result = self
                .store
                .update_session(session_id, |s| {
                    if let Some(container_id) = &new_container_id {
                        s.set_container_id(Some(container_id.clone()));
                    }
                    if let Some(status) = new_status {
                        s.force_status(status);
                    }
                })
                .await;

            match result {
                Ok(updated) => {
                    report.sessions_updated += 1;
                    self.bus.emit_session_update(session_id, updated.status);
                }
                Err(e) => warn!("reconciler: failed to update session {session_id}: {e}"),
            }
        }
    }

    /// Any session-prefixed container with no matching session row is
    /// force-removed.
    async fn reconcile_orphan_containers(&self, observed: &[crate::container::SessionContainerEntry], report: &mut ReconcileReport) {
        for entry in observed {
            if self.store.get_session(entry.session_id).await.is_ok() {
                continue;
            }
            info!("reconciler: removing orphan container {} (session {})", entry.container_id, entry.session_id);
            if let Err(e) = self.engine.remove(&entry.container_id, true).await {
                warn!("reconciler: failed to remove orphan container {}: {e}", entry.container_id);
                continue;
            }
            report.orphan_containers_removed += 1;
        }
    }

    /// Orphan `AgentExecution` rows: run the reconnect routine for each.
    async fn reconcile_executions(&self, report: &mut ReconcileReport) {
        for execution in self.store.list_executions().await {
            if self.runner.is_running(execution.session_id) {
                continue;
            }
            match self.runner.reconnect(execution.session_id).await {
                Ok(outcome) if outcome.still_running => report.executions_reconnected += 1,
                Ok(_) => report.executions_dropped += 1,
                Err(e) => warn!("reconciler: failed to reconnect execution for session {}: {e}", execution.session_id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_default_is_zeroed() {
        let report = ReconcileReport::default();
        assert_eq!(report.sessions_updated, 0);
        assert_eq!(report.orphan_containers_removed, 0);
    }
}
