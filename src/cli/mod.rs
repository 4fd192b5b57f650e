//! Operator CLI.
//!
//! Thin dispatch layer over the same operations the runtime exposes to
//! programmatic callers: each subcommand calls straight into
//! [`crate::session::SessionManager`] or [`crate::agent::AgentRunner`] and
//! prints the result. No business logic lives here.

pub mod args;

pub use args::{AgentCommand, Args, Command, SessionCommand};

use std::sync::Arc;

use tracing::info;

use crate::agent::AgentRunner;
use crate::config::RuntimeConfig;
use crate::credentials::CredentialPropagator;
use crate::reconcile::Reconciler;
use crate::session::{CreateSessionRequest, SessionManager};

/// Everything a CLI invocation needs wired up before it can dispatch a
/// command. Built once in `main`, shared across the `serve` loop and one-shot
/// commands alike.
pub struct Runtime {
    pub config: Arc<RuntimeConfig>,
    pub sessions: Arc<SessionManager>,
    pub agent: Arc<AgentRunner>,
    pub reconciler: Arc<Reconciler>,
    pub credentials: Arc<CredentialPropagator>,
}

impl Runtime {
    /// Run the long-lived server: the reconciler loop and credential
    /// propagator, until the process receives a shutdown signal.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let reconciler = self.reconciler.clone();
        let credentials = self.credentials.clone();
        tokio::spawn(async move { reconciler.run_forever().await });
        tokio::spawn(async move { credentials.run().await });

        info!("agentrt serving; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        Ok(())
    }

    pub async fn dispatch_session(&self, command: SessionCommand) -> anyhow::Result<()> {
        match command {
            SessionCommand::Create { name, owner, repo, branch, prompt, token } => {
                let session = self
                    .sessions
                    .create(CreateSessionRequest {
                        display_name: name,
                        owner,
                        repo,
                        branch,
                        initial_prompt: prompt,
                        token,
                    })
                    .await?;
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            SessionCommand::List => {
                let sessions = self.sessions.list().await;
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            }
            SessionCommand::Get { id } => {
                let session = self.sessions.get(id).await?;
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            SessionCommand::Start { id } => {
                let session = self.sessions.start(id).await?;
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            SessionCommand::Stop { id } => {
                let session = self.sessions.stop(id).await?;
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            SessionCommand::Delete { id } => {
                self.sessions.delete(id).await?;
                println!("deleted {id}");
            }
        }
        Ok(())
    }

    pub async fn dispatch_agent(&self, command: AgentCommand) -> anyhow::Result<()> {
        match command {
            AgentCommand::Run { session_id, prompt } => {
                self.agent.run(session_id, &prompt).await?;
                println!("launched agent turn for {session_id}");
            }
            AgentCommand::Interrupt { session_id } => {
                let interrupted = self.agent.interrupt(session_id).await?;
                println!("{interrupted}");
            }
            AgentCommand::IsRunning { session_id } => {
                println!("{}", self.agent.is_running(session_id));
            }
        }
        Ok(())
    }
}
