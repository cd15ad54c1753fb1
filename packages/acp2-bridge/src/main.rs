use std::path::PathBuf;

use acp2_bridge::config::{self, Settings};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "acp2-bridge")]
#[command(about = "HTTP bridge in front of stdio JSON-RPC agent subprocesses", version)]
struct Cli {
    /// Bind address; overrides ACP2_BIND_ADDR.
    #[arg(long)]
    host: Option<String>,

    /// Bind port; overrides ACP2_BIND_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Agents configuration file; overrides ACP2_AGENTS_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session database path; overrides ACP2_DB_PATH.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config::log_filter())),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(host) = cli.host {
        settings.bind_addr = host;
    }
    if let Some(port) = cli.port {
        settings.bind_port = port;
    }
    if let Some(config) = cli.config {
        settings.agents_config = config;
    }
    if let Some(db_path) = cli.db_path {
        settings.db_path = db_path;
    }

    if let Err(err) = acp2_bridge::run_server(settings).await {
        tracing::error!(error = %err, "acp2-bridge failed");
        std::process::exit(1);
    }
}
