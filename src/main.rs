use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use parley_agent::RemoteAgentEngine;
use parley_server::{Sequencer, ServerConfig, SystemConfig};
use parley_telemetry::TelemetryConfig;
use parley_tools::{McpBackend, ProcessEnv, ToolProviderRegistry};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Conversation server with live subscriber push")]
struct Cli {
    /// HTTP and WebSocket port
    #[arg(long, env = "PARLEY_PORT", default_value_t = 8000)]
    port: u16,

    /// Directory holding the conversation database
    #[arg(long, env = "PARLEY_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Attachment storage root (defaults to <data_dir>/blobs)
    #[arg(long, env = "PARLEY_BLOB_ROOT")]
    blob_root: Option<PathBuf>,

    /// YAML file declaring tool providers
    #[arg(long, env = "PARLEY_TOOLS_CONFIG", default_value = "tool_providers.yaml")]
    tools_config: PathBuf,

    /// Base URL of the agent engine
    #[arg(long, env = "PARLEY_AGENT_URL", default_value = "http://127.0.0.1:8100")]
    agent_url: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "PARLEY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    parley_telemetry::init_telemetry(&TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    });

    let engine = RemoteAgentEngine::new(&cli.agent_url).context("failed to build agent client")?;
    let providers = ToolProviderRegistry::load(&cli.tools_config, &ProcessEnv);
    tracing::info!(providers = ?providers.names(), "tool providers configured");

    let server_config = ServerConfig {
        port: cli.port,
        ..Default::default()
    };

    let blob_root = cli.blob_root.unwrap_or_else(|| cli.data_dir.join("blobs"));
    let mut system_config = SystemConfig::new(blob_root);
    system_config.database_path = Some(cli.data_dir.join("parley.db"));
    system_config.send_timeout = server_config.send_timeout;

    let system = Sequencer::new(
        system_config,
        Arc::new(engine),
        Arc::new(McpBackend::default()),
        providers,
    )
    .start()
    .await
    .context("startup failed")?;
    let system = Arc::new(system);

    let handle = parley_server::start(server_config, Arc::clone(&system))
        .await
        .context("failed to bind server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    system.shutdown().await;
    handle.shutdown().await;
    Ok(())
}
