//! wirelink server daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────┐
//!                         │                  SERVER                      │
//!                         │                                              │
//!   TCP peer              │  ┌──────────┐   ┌───────────┐   ┌─────────┐  │
//!   ──────────────────────┼─▶│ listener │──▶│ admission │──▶│ session │  │
//!                         │  │          │   │ blacklist │   │handshake│  │
//!                         │  └──────────┘   │ capacity  │   │  + TLS  │  │
//!                         │                 └───────────┘   └────┬────┘  │
//!                         │                                      │       │
//!                         │                                      ▼       │
//!   lines ◀───────────────┼──────────────────────────────── receive loop │
//!                         │                                      │       │
//!                         │                                 events ──────┼──▶ subscribers
//!                         │                                              │
//!                         │  config watcher ──▶ blacklist swap           │
//!                         │  signals ──▶ stop (notice, drain)            │
//!                         └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;

use wirelink::config::watcher::ConfigWatcher;
use wirelink::config::{load_config, WirelinkConfig};
use wirelink::lifecycle::shutdown::stop_within;
use wirelink::lifecycle::signals::wait_for_signal;
use wirelink::lifecycle::startup::build_server;
use wirelink::lifecycle::Shutdown;
use wirelink::observability::{logging, metrics};
use wirelink::{Blacklist, Event, ServerEngine};

#[derive(Parser)]
#[command(name = "wirelink")]
#[command(about = "Line-oriented TCP session server", long_about = None)]
struct Cli {
    /// TOML configuration file. Reloaded on change (blacklist only).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Echo every received line back to its sender.
    #[arg(long)]
    echo: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => WirelinkConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.server.bind_address = bind.clone();
    }

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "wirelink starting");

    tracing::info!(
        bind_address = %config.server.bind_address,
        max_connections = config.server.max_connections,
        tls = config.tls.enabled,
        ignore_handshake = config.server.ignore_handshake,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = build_server(&config)?;
    let shutdown = Shutdown::new();

    tokio::spawn(log_events(server.subscribe(), shutdown.subscribe(), cli.echo));

    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(watcher) => {
                    tokio::spawn(apply_reloads(server.clone(), updates, shutdown.subscribe()));
                    Some(watcher)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    server.start().await?;

    wait_for_signal().await;
    shutdown.trigger();
    stop_within(&server, config.server.drain_timeout() + Duration::from_secs(5)).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<Event>, mut shutdown: broadcast::Receiver<()>, echo: bool) {
    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(Event::DataReceived { session, payload }) => {
                tracing::debug!(connection_id = %session.id(), payload = %payload, "Line received");
                if echo {
                    session.send_detached(payload);
                }
            }
            Ok(Event::ConnectionException { session, error }) => {
                tracing::warn!(connection_id = ?session.map(|s| s.id()), error = %error, "Connection exception");
            }
            Ok(event) => tracing::trace!(event = event.name(), "Event"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn apply_reloads(
    server: ServerEngine,
    mut updates: tokio::sync::mpsc::UnboundedReceiver<WirelinkConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let config = tokio::select! {
            _ = shutdown.recv() => break,
            config = updates.recv() => match config {
                Some(config) => config,
                None => break,
            },
        };
        match Blacklist::from_entries(&config.server.blacklist) {
            Ok(blacklist) => server.update_blacklist(blacklist),
            Err(e) => tracing::warn!(error = %e, "Ignoring reloaded blacklist"),
        }
    }
}
