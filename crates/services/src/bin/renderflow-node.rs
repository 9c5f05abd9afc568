//! renderflow-node: runs one or more render pipeline services.
//!
//! Roles:
//! - `jobs`: owns the ledger, applies status updates, submits staged jobs.
//!   The ledger, engine view and identity verifier are the in-process ones,
//!   so job state lives only as long as the process; an outer API embedding
//!   [`JobsNode`] supplies real collaborators.
//! - `files`: storage allocation, staging and download packaging
//! - `proxy`: runs the engine submitter and hosts the engine callback
//!
//! # Usage
//!
//! ```bash
//! # Everything in one process against a local broker daemon
//! renderflow-node --role all
//!
//! # Only the file service, broker settings from a file
//! renderflow-node --role files --config renderflow.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use renderflow_bus::{MessagingClient, Worker, WorkerRunner, ZmqBroker};
use renderflow_services::{
    BundleArchiver, CallbackServer, JobsNode, MemoryEngine, MemoryLedger, NodeConfig,
    ObjectStoreBlobs, PackageWorker, PlaceholderRewriter, ProcessExecutor, ProxyWorker, Role,
    StaticIdentity, StorageWorker, TransitionWorker,
};

/// Render pipeline service node.
#[derive(Parser, Debug)]
#[command(name = "renderflow-node", version, about)]
struct Cli {
    /// Comma-separated roles: jobs, files, proxy or all.
    #[arg(long, env = "RENDERFLOW_ROLE", default_value = "all")]
    role: String,

    /// Path to the bus TOML config; defaults plus environment when absent.
    #[arg(long, env = "RENDERFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds each worker gets to stop.
    #[arg(long, env = "RENDERFLOW_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    renderflow_core::config::load_dotenv();
    let cli = Cli::parse();
    info!(?cli, "starting renderflow-node");

    let roles = Role::parse_list(&cli.role)?;
    let config = NodeConfig::load(
        roles,
        cli.config.as_deref(),
        Duration::from_secs(cli.shutdown_timeout),
    )?;
    config.core.log_summary();

    let transport = config.bus.broker_transport()?;
    let layout = config.core.layout();
    let mut clients: Vec<Arc<MessagingClient>> = Vec::new();
    let mut workers: Vec<Arc<dyn Worker>> = Vec::new();

    for &role in &config.roles {
        // A refused or unreachable broker ends the process before anything is served.
        let broker = ZmqBroker::connect_with_heartbeat(
            &transport,
            config.bus.credentials(),
            config.bus.connect_timeout(),
            config.bus.heartbeat_interval(),
        )
        .await?;
        let client =
            MessagingClient::create_with_broker(Arc::new(broker), config.client_options(role)).await?;
        info!(%role, reply_queue = %client.reply_queue(), "service connected");

        match role {
            Role::Jobs => {
                warn!("jobs role runs on a process-local ledger; job state is lost on exit");
                let node = JobsNode::new(
                    client.clone(),
                    Arc::new(MemoryLedger::new()),
                    Arc::new(MemoryEngine::new()),
                    Arc::new(StaticIdentity::new()),
                );
                workers.extend(node.workers());
            }
            Role::Files => {
                let blobs = Arc::new(ObjectStoreBlobs::from_config(&config.core.blob)?);
                let archiver = Arc::new(BundleArchiver::new());
                workers.push(Arc::new(StorageWorker::new(
                    client.clone(),
                    blobs.clone(),
                    layout.clone(),
                )));
                workers.push(Arc::new(TransitionWorker::new(
                    client.clone(),
                    blobs.clone(),
                    archiver.clone(),
                    Arc::new(PlaceholderRewriter::new()),
                    layout.clone(),
                    config.core.engine.submitter_path.clone(),
                )));
                workers.push(Arc::new(PackageWorker::new(
                    client.clone(),
                    blobs,
                    archiver,
                    layout.clone(),
                )));
            }
            Role::Proxy => {
                workers.push(Arc::new(ProxyWorker::new(
                    client.clone(),
                    Arc::new(ProcessExecutor::new()),
                    config.core.engine.proxy_submitter.clone(),
                    config.core.engine.proxy_project_base.clone(),
                )));
                workers.push(Arc::new(CallbackServer::new(
                    client.clone(),
                    config.callback_addr()?,
                )));
            }
        }
        clients.push(client);
    }

    WorkerRunner::run(workers, config.shutdown_timeout, None).await?;

    for client in &clients {
        client.shutdown().await;
    }
    info!("renderflow-node exited cleanly");
    Ok(())
}
