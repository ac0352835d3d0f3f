//! hived — the hive cluster daemon.
//!
//! Single binary that assembles the hive subsystems:
//! - Cluster state (local tree, installed peer datasets, liveness)
//! - Heartbeat links and the state merger
//! - Orchestration monitor
//! - Node stats refresh
//!
//! # Usage
//!
//! ```text
//! hived run --config /etc/hive/hived.toml
//! hived check --config /etc/hive/hived.toml
//! ```
//!
//! # Signals
//!
//! - `SIGINT` / `SIGTERM`: shut local instances down, then exit
//! - `SIGHUP`: reload objects, cluster nodes and heartbeat links
//! - `SIGUSR1`: drain: shut local instances down and stop orchestrating

mod config;
mod drivers;
mod stats;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hive_heartbeat::{ClearCipher, ClusterIdentity, HeartbeatService};
use hive_monitor::Monitor;
use hive_state::ClusterState;

use crate::config::DaemonConfig;
use crate::drivers::{CommandDriver, FlagFreezer, TomlConfigProvider};

const DEFAULT_FILTER: &str = "info,hived=debug,hive=debug";

#[derive(Parser)]
#[command(name = "hived", about = "hive cluster daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Configuration file.
        #[arg(long, short, default_value = "/etc/hive/hived.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file and summarize it.
    Check {
        /// Configuration file.
        #[arg(long, short, default_value = "/etc/hive/hived.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(path)?;
    println!(
        "node {} in cluster {} ({} nodes)",
        config.node.name,
        config.node.cluster_name,
        config.node.nodes.len()
    );
    for link in config.links()? {
        println!("heartbeat {} ({}) every {:?}", link.name, link.transport.kind(), link.interval);
    }
    for object in &config.object {
        println!("object {} ({:?}) on {}", object.path, object.topology, object.nodes.join(","));
    }
    Ok(())
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(path)?;
    let node = &config.node;
    info!(node = %node.name, cluster = %node.cluster_name, "hive daemon starting");
    std::fs::create_dir_all(&node.var_dir)?;

    // ── Cluster state ──────────────────────────────────────────

    let cluster = Arc::new(ClusterState::new(&node.name, &node.nodes));
    {
        let tree = cluster.local_tree();
        tree.set_as(&["compat"], &node.compat)?;
        tree.set_as(&["labels"], &node.labels)?;
        tree.set_as(&["config_csum"], &config.csum)?;
    }

    // ── Heartbeat ──────────────────────────────────────────────

    let identity = ClusterIdentity {
        name: node.cluster_name.clone(),
        id: node.cluster_id.clone(),
        compat: node.compat,
    };
    let cipher = Arc::new(ClearCipher::new(node.name.clone(), node.cluster_name.clone()));
    let heartbeat = Arc::new(HeartbeatService::new(cluster.clone(), identity, cipher));
    heartbeat.spawn_merger();
    for link in config.links()? {
        let name = link.name.clone();
        if let Err(e) = heartbeat.start_link(link).await {
            error!(link = %name, error = %e, "heartbeat link not started");
        }
    }

    // ── Monitor ────────────────────────────────────────────────

    let objects = Arc::new(TomlConfigProvider::new(
        config.object.clone(),
        node.var_dir.join("slaves.json"),
    )?);
    let driver = Arc::new(CommandDriver::new(config.monitor.command.clone(), config.action_timeout()?));
    let freezer = Arc::new(FlagFreezer::new(node.var_dir.join("frozen")));
    let monitor_config = config.monitor_config()?;
    let stats_interval = monitor_config.interval;
    let tx_wake = heartbeat.clone();
    let monitor = Monitor::new(cluster.clone(), driver.clone(), freezer, objects.clone(), driver)
        .with_config(monitor_config)
        .with_wake(heartbeat.monitor_wake())
        .with_commit_hook(Arc::new(move || tx_wake.wake_tx()));
    let handle = monitor.handle();

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));
    let stats_task = tokio::spawn(stats::run(cluster.clone(), stats_interval, shutdown_rx));

    // ── Signals ────────────────────────────────────────────────

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut drain = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                if let Err(e) = reload(path, &cluster, &heartbeat, &objects).await {
                    warn!(error = %e, "reload failed, keeping the running configuration");
                }
            }
            _ = drain.recv() => {
                info!("drain requested");
                handle.drain();
            }
        }
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = monitor_task.await;
    let _ = stats_task.await;
    heartbeat.shutdown().await;

    info!("hive daemon stopped");
    Ok(())
}

/// Apply a changed configuration file to the running daemon. Node identity
/// and monitor tunables need a restart.
async fn reload(
    path: &Path,
    cluster: &ClusterState,
    heartbeat: &HeartbeatService,
    objects: &TomlConfigProvider,
) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(path)?;
    if config.node.name != cluster.local_name() {
        anyhow::bail!("node name changed to {}, restart required", config.node.name);
    }
    cluster.set_nodes(&config.node.nodes);
    cluster.local_tree().set_as(&["labels"], &config.node.labels)?;
    cluster.local_tree().set_as(&["config_csum"], &config.csum)?;
    objects.replace(config.object.clone())?;

    let links = config.links()?;
    for running in heartbeat.links().await {
        if !links.iter().any(|l| l.name == running) {
            heartbeat.stop_link(&running).await;
        }
    }
    for link in links {
        let name = link.name.clone();
        if let Err(e) = heartbeat.start_link(link).await {
            error!(link = %name, error = %e, "heartbeat link not started");
        }
    }
    info!(objects = config.object.len(), "configuration reloaded");
    Ok(())
}
