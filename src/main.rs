use std::sync::Arc;

use clap::Parser;
use tracing::info;

use agentrt::agent::AgentRunner;
use agentrt::cli::{Args, Command, Runtime};
use agentrt::config::ConfigDiscovery;
use agentrt::container::{ContainerEngine, ExecTracker};
use agentrt::credentials::CredentialPropagator;
use agentrt::events::EventBus;
use agentrt::reconcile::Reconciler;
use agentrt::session::SessionManager;
use agentrt::store::Store;
use agentrt::workspace::WorkspaceProvisioner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("agentrt=info").init();

    let args = Args::parse();

    if let Command::ShowConfig = args.command {
        let config = ConfigDiscovery::discover(args.config.as_deref())?;
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = Arc::new(ConfigDiscovery::discover(args.config.as_deref())?);
    info!("using namespace {} image {}", config.namespace, config.image);

    let engine = Arc::new(ContainerEngine::new(&config).await?);
    let store = Arc::new(Store::open(&config.workspace_root).await?);
    let bus = Arc::new(EventBus::new());
    let workspace = Arc::new(WorkspaceProvisioner::new(config.clone(), engine.clone()));
    let tracker = Arc::new(ExecTracker::new());

    let sessions = Arc::new(SessionManager::new(
        config.clone(),
        engine.clone(),
        store.clone(),
        bus.clone(),
        workspace.clone(),
    ));
    let agent = Arc::new(AgentRunner::new(config.clone(), engine.clone(), store.clone(), bus.clone(), tracker));
    let reconciler = Arc::new(Reconciler::new(config.clone(), engine.clone(), store.clone(), bus.clone(), agent.clone()));
    let credentials = Arc::new(CredentialPropagator::new(config.clone(), engine.clone()));

    let runtime = Runtime { config, sessions, agent, reconciler, credentials };

    match args.command {
        Command::Serve => runtime.serve().await,
        Command::ShowConfig => unreachable!("handled above"),
        Command::Session(command) => runtime.dispatch_session(command).await,
        Command::Agent(command) => runtime.dispatch_agent(command).await,
    }
}
