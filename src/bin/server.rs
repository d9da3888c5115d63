//! HTTP server entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use worldbook_runtime::api::{serve, AppState};
use worldbook_runtime::RuntimeConfig;

#[derive(Parser, Debug)]
#[command(name = "worldbook-server", about = "Narrative knowledge-base server")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = if std::path::Path::new(&args.config).exists() {
        RuntimeConfig::from_file(&args.config)?
    } else {
        tracing::warn!(path = %args.config, "config file not found, using defaults");
        RuntimeConfig::default()
    };
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    let state = AppState::build(config)?;
    serve(state).await?;
    Ok(())
}
