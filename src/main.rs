use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lace_server::{AgentRuns, EventStreamManager, ServerConfig};
use lace_telemetry::TelemetryConfig;

/// Lace event stream server.
#[derive(Debug, Parser)]
#[command(name = "lace", version, about)]
struct Cli {
    /// Interface to bind. Overrides LACE_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on. Overrides LACE_PORT.
    #[arg(long, short)]
    port: Option<u16>,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Emit JSON log lines.
    #[arg(long, env = "LACE_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = lace_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..Default::default()
    });

    let mut config = ServerConfig::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let manager = Arc::new(EventStreamManager::new(
        config.manager_config(),
        telemetry.metrics(),
    ));
    if EventStreamManager::install_global(Arc::clone(&manager)).is_err() {
        tracing::warn!("Global event stream manager was already initialized");
    }
    let agents = Arc::new(AgentRuns::new());

    let bind_addr = config.bind_addr();
    let handle = lace_server::start(config, manager, agents)
        .await
        .with_context(|| format!("failed to start server on {bind_addr}"))?;

    tracing::info!(port = handle.port(), "Lace server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
