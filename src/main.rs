//! Remoting endpoint server.
//!
//! Loads a TOML configuration, starts the configured realms, connectors,
//! channel services and outbound connections, and runs until SIGINT or
//! SIGTERM. A second signal during shutdown interrupts the channel drain.

use std::path::{Path, PathBuf};

use clap::Parser;

use remoting_endpoint::config::{load_config, ConfigWatcher, EndpointConfig};
use remoting_endpoint::lifecycle::{Interrupt, RunningEndpoint, SignalEvent, Signals};
use remoting_endpoint::observability;

#[derive(Parser)]
#[command(name = "remoting-endpoint")]
#[command(about = "Authenticated channel endpoint", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload outbound connections when the config file changes.
    #[arg(long)]
    watch: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EndpointConfig::default(),
    };

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if config.endpoint.worker_threads > 0 {
        runtime.worker_threads(config.endpoint.worker_threads);
    }
    let runtime = runtime.enable_all().build()?;
    runtime.block_on(run(config, cli))
}

async fn run(config: EndpointConfig, cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    observability::logging::init(&config.observability.log_level);
    tracing::info!("remoting-endpoint v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => observability::metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let running = std::sync::Arc::new(RunningEndpoint::start(config).await?);

    // keep the watcher alive for the life of the process
    let _watcher = match (&cli.config, cli.watch) {
        (Some(path), true) => Some(spawn_watcher(path, std::sync::Arc::clone(&running))?),
        _ => None,
    };

    let mut signals = Signals::install()?;
    loop {
        match signals.recv().await {
            SignalEvent::Shutdown => break,
            SignalEvent::Reload => match &cli.config {
                Some(path) => reload(path, &running),
                None => tracing::warn!("No config file to reload"),
            },
        }
    }

    tracing::info!("Shutting down");
    let interrupt = Interrupt::new();
    let drain = running.shutdown(interrupt.clone());
    tokio::pin!(drain);
    loop {
        tokio::select! {
            _ = &mut drain => break,
            event = signals.recv() => {
                if event == SignalEvent::Shutdown && !interrupt.is_interrupted() {
                    tracing::warn!("Second shutdown signal, interrupting channel drain");
                    interrupt.interrupt();
                }
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn reload(path: &Path, running: &RunningEndpoint) {
    match load_config(path) {
        Ok(config) => {
            if let Err(e) = running.reload(config) {
                tracing::error!(error = %e, "Reload failed; keeping current outbound connections");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to reload config; keeping current configuration"),
    }
}

fn spawn_watcher(
    path: &Path,
    running: std::sync::Arc<RunningEndpoint>,
) -> Result<notify::RecommendedWatcher, notify::Error> {
    let (watcher, mut updates) = ConfigWatcher::new(path, running.config().as_ref().clone());
    let watcher = watcher.run()?;
    tokio::spawn(async move {
        while let Some(config) = updates.recv().await {
            if let Err(e) = running.reload(config) {
                tracing::error!(error = %e, "Reload failed; keeping current outbound connections");
            }
        }
    });
    Ok(watcher)
}
