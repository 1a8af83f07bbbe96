//! taskmesh - peer-mesh job distribution node
//!
//! This is the main entry point for the taskmesh binary. The node
//! joins a mesh of compute peers over TCP, receives and relays jobs,
//! executes them with a fixed set of local workers, and reports
//! activity so the mesh can balance load without a central scheduler.

mod cli;
mod config;
mod coordinator;
mod error;
mod job;
mod link;
mod logging;
mod protocol;
mod transport;
mod version;
mod worker;

use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands, ConfigSubcommand};
use crate::config::NodeConfig;
use crate::coordinator::{Coordinator, MeshEvent, StaticResolver};
use crate::error::{Error, Result};
use crate::job::{register_mock, FactoryRegistry, JobSink};
use crate::logging::LogGuards;
use crate::transport::{SelfStatus, TransportConfig, TransportLink};

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { ref subcommand } => {
            let _ = logging::init_simple(tracing::Level::WARN);
            handle_config_command(subcommand.clone())
        }
        Commands::Ping {
            ref addr,
            size,
            timeout_ms,
            ref secret,
        } => {
            let _ = logging::init_simple(if cli.verbose > 0 {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            });
            run_ping(addr, size, timeout_ms, secret.as_deref())
        }
        Commands::Run {
            ref config,
            ref root,
            ref listen,
        } => run_node(
            config.as_deref(),
            root.clone(),
            listen.clone(),
            cli.verbose,
            cli.quiet,
        ),
    };

    if let Err(e) = result {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

// ─────────────────────────────────────────────────────────────────
// Config Commands
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let config = NodeConfig::load(config.as_deref())?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigSubcommand::Init { path, force } => {
            let path = path.unwrap_or_else(|| "taskmesh.toml".to_string());
            let expanded = shellexpand::tilde(&path).to_string();
            NodeConfig::write_default(std::path::Path::new(&expanded), force)?;
            println!("Configuration written to {}", expanded);
            Ok(())
        }
        ConfigSubcommand::Validate { config } => {
            match NodeConfig::load(config.as_deref()) {
                Ok(_) => {
                    println!("Configuration is valid");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Ping Command
// ─────────────────────────────────────────────────────────────────

fn run_ping(addr: &str, size: usize, timeout_ms: u64, secret: Option<&str>) -> Result<()> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|_| Error::config_validation(format!("not a socket address: {addr}")))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create runtime: {}", e)))?;

    runtime.block_on(async move {
        let link = TransportLink::connect(
            addr,
            "taskmesh-ping",
            secret,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .await?;

        let rtt = link
            .ping(size, std::time::Duration::from_millis(timeout_ms))
            .await;
        link.close().await;

        if rtt < 0 {
            println!("no reply from {} within {}ms", addr, timeout_ms);
            Err(Error::connection_timeout(addr.to_string(), timeout_ms / 1000))
        } else {
            println!("reply from {}: {} bytes in {}ms", addr, size, rtt);
            Ok(())
        }
    })
}

// ─────────────────────────────────────────────────────────────────
// Run Command
// ─────────────────────────────────────────────────────────────────

/// Job output sink wired to the log stream; payload content is opaque
/// to the mesh core.
struct LogSink;

impl JobSink for LogSink {
    fn consume(&self, task_id: &str, output: &str) {
        info!(target: "taskmesh::output", task_id = %task_id, output = %output, "Job output");
    }
}

fn run_node(
    config_path: Option<&str>,
    root_override: Option<String>,
    listen_override: Option<String>,
    verbose: u8,
    quiet: bool,
) -> Result<()> {
    let mut config = NodeConfig::load(config_path)?;

    // CLI overrides beat both file and environment
    if let Some(root) = root_override {
        config.node.root_addr = Some(root);
    }
    if let Some(listen) = listen_override {
        config.node.listen_addr = listen;
    }
    config.validate()?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards: LogGuards = logging::init_logging(&config.logging, verbose, quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting taskmesh node"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(8))
        .thread_name("taskmesh")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_node_main(config))
}

async fn async_node_main(config: NodeConfig) -> Result<()> {
    // Factory registry; the mock payload is always available
    let registry = Arc::new(FactoryRegistry::new());
    register_mock(&registry)?;

    let resolver = Arc::new(StaticResolver::new(config.resources.clone()));
    let coordinator_config = config.coordinator_config();

    info!(
        node_id = %coordinator_config.node_id,
        workers = coordinator_config.worker_count,
        listen = ?coordinator_config.listen_addr,
        root = ?coordinator_config.root_addr,
        secured = coordinator_config.secret.is_some(),
        "Configuration loaded"
    );

    let (coordinator, mut events) = Coordinator::new(
        coordinator_config,
        registry,
        resolver,
        Arc::new(LogSink),
    );
    coordinator.start();

    // Surface mesh events until shutdown
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                coordinator.trigger_shutdown();
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => log_event(&event),
                    None => {
                        warn!("Event stream closed");
                        break;
                    }
                }
            }
        }
    }

    // Give the loops a moment to observe the flag
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("Node stopped");
    Ok(())
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::ListenerReady { addr } => {
            info!(addr = %addr, "Listener ready");
        }
        MeshEvent::ServerConnected { addr } => {
            info!(addr = %addr, "Server connected");
        }
        MeshEvent::ServerLost { addr, permanent } => {
            warn!(addr = %addr, permanent = *permanent, "Server lost");
        }
        MeshEvent::Isolated { idle_ticks } => {
            warn!(idle_ticks = *idle_ticks, "Node is isolated from the mesh");
        }
        MeshEvent::TaskAccepted { task_id } => {
            info!(task_id = %task_id, "Task accepted");
        }
        MeshEvent::TaskRejected { reason } => {
            warn!(reason = %reason, "Task rejected");
        }
        MeshEvent::Activity {
            mean_activity,
            queued,
            completed,
            servers,
        } => {
            debug!(
                mean_activity = %format!("{mean_activity:.3}"),
                queued = *queued,
                completed = *completed,
                servers = *servers,
                "Activity"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sink_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LogSink>();
    }
}
