mod config;
mod forwarder;
mod mqtt;
mod orchestrator;
mod stats;
mod ttn;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long tasks get to wind down after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "gateway-telemetry")]
#[command(about = "Publishes LoRaWAN packet-forwarder RX/TX stats and TTN gateway status to MQTT")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Force debug logging (same as DEBUG=true)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration, then let the environment override it
    // A missing file means defaults; a broken one is fatal.
    let mut config = match config::Config::load_optional(&cli.config)? {
        Some(config) => config,
        None => {
            eprintln!(
                "No config file at {}, using default configuration",
                cli.config.display()
            );
            config::Config::default()
        }
    };
    config.apply_env()?;
    if cli.debug {
        config.logging.debug = true;
    }

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.effective_level())),
        )
        .init();

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    info!("Gateway telemetry v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("MQTT Broker: {}:{}", config.mqtt.host, config.mqtt.port);
    info!(
        "MQTT User: {}",
        config.mqtt.username.as_deref().unwrap_or("(none)")
    );
    info!("Log source: {}", config.forwarder.log_command().join(" "));
    if config.ttn.enabled {
        info!(
            "TTN: cluster={}, gateway={}",
            config.ttn.cluster, config.ttn.gateway_id
        );
    } else {
        info!("TTN: disabled");
        if config.ttn.has_idle_credentials() {
            warn!("TTN credentials are set but polling is off (TTN_ENABLED=true to poll)");
        }
    }
    info!("Topic Prefix: {}", config.mqtt.topic_prefix);
    info!("Debug Mode: {}", config.logging.debug);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let aggregator = orchestrator::Aggregator::new(config);
    let handles = aggregator.start(shutdown_rx)?;

    info!("Aggregator running. Press Ctrl+C to stop.");
    wait_for_signal().await;
    info!("Shutting down...");

    shutdown_tx.send(true).ok();
    orchestrator::join_all(handles, SHUTDOWN_GRACE).await;

    let snap = aggregator.counters().snapshot();
    let remote = aggregator.remote().snapshot();
    info!(
        "Shutdown complete (RX={}, TX={}, TTN up={:?}, down={:?})",
        snap.rx_total, snap.tx_total, remote.uplink_count, remote.downlink_count
    );
    Ok(())
}

/// Ctrl-C everywhere, plus SIGTERM on unix (container stop)
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}
