//! Command line argument parsing.
//!
//! `agentrt` exposes the same operations as the runtime's RPC surface
//! (`sessions.*`, `agent.*`) as subcommands of a local CLI: `serve` runs the
//! long-lived runtime (reconciler, credential propagator, and whatever
//! front-end wires the event bus to clients), the rest are one-shot calls
//! against the on-disk store for operators poking at a session by hand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "agentrt")]
#[command(author = "agentrt contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent session runtime: per-session containers and crash-safe reconciliation")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Path to a config TOML file, overriding auto-discovery.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the long-lived runtime: reconciler loop and credential propagator.
    Serve,
    /// Print the discovered configuration.
    ShowConfig,
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Agent(AgentCommand),
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Create a session: clone the repo and start its container.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        prompt: Option<String>,
        /// Token used once to clone a private remote; never persisted.
        #[arg(long)]
        token: Option<String>,
    },
    /// List all sessions.
    List,
    /// Show one session.
    Get { id: Uuid },
    /// Start a stopped session's container.
    Start { id: Uuid },
    /// Stop a running session's container, keeping its workspace.
    Stop { id: Uuid },
    /// Delete a session: container, workspace volume, and history.
    Delete { id: Uuid },
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    /// Launch one agent turn in a session's container.
    Run {
        session_id: Uuid,
        prompt: String,
    },
    /// Interrupt the running agent turn, if any.
    Interrupt { session_id: Uuid },
    /// Report whether an agent turn is in flight for a session.
    IsRunning { session_id: Uuid },
}
