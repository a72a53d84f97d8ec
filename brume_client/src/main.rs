//! Brume Client
//!
//! Headless runner for the Brume client coordination layer. It manages the
//! privileged daemon's lifecycle and exposes the coordination layer to UI
//! surfaces; rendering is out of scope here.

use anyhow::Context;
use brume_client::config::ClientConfig;
use brume_client::lifecycle::{ProcessDaemonLauncher, ServiceLifecycleManager};
use brume_client::logging;
use brume_ipc::client::{DaemonConnection, DaemonRpcClient};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the client configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Unix socket of the daemon (overrides the configuration file)
    #[clap(short = 's', long)]
    socket: Option<PathBuf>,

    /// Log filter
    #[clap(short, long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

/// Subcommands for the client
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordination layer until interrupted
    Run,

    /// Print the daemon's tunnel state and key status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.daemon_socket = socket;
    }

    let filter = args.log_level.as_deref().unwrap_or(config.log_level.as_str());
    logging::init(filter);

    match args.command {
        Command::Run => run(config).await,
        Command::Status => status(config).await,
    }
}

async fn run(config: ClientConfig) -> anyhow::Result<()> {
    info!("Brume client starting up");

    let launcher = Arc::new(ProcessDaemonLauncher::new(config.clone()));
    let manager = ServiceLifecycleManager::new(config, launcher);

    let subscription = manager
        .session()
        .subscribe(|state| info!("Tunnel state: {:?}", state));

    manager.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for interrupt")?;
    info!("Interrupted, shutting down");

    manager.session().unsubscribe(subscription);
    manager.stop().await;

    Ok(())
}

async fn status(config: ClientConfig) -> anyhow::Result<()> {
    let client = DaemonRpcClient::connect(&config.daemon_socket)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to the daemon at {}",
                config.daemon_socket.display()
            )
        })?;

    let state = client.get_state().await.context("Failed to fetch state")?;
    println!("Tunnel state: {:?}", state);

    match client.get_key().await.context("Failed to fetch key")? {
        Some(key) => println!("Registered key: {}", key),
        None => println!("No key registered"),
    }

    Ok(())
}
