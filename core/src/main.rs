/// Ripple terminal client - main entry point
use ripple_core::http::HttpCollaborator;
use ripple_core::{cli_app, Config, SyncEngine};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (stderr keeps the roster output readable)
    tracing_subscriber::fmt()
        .with_env_filter(filter_from_env())
        .with_writer(std::io::stderr)
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Connecting to messenger API at {}", config.server_addr);
    if let Some(dir) = &config.data_dir {
        info!("Roster cache: {}", dir.display());
    }

    let client = HttpCollaborator::new(&config);
    let handle = SyncEngine::spawn(config, client.clone(), client.clone(), client)
        .map_err(|e| anyhow::anyhow!("Engine error: {}", e))?;

    cli_app::run(handle).await
}

/// `RUST_LOG` first, then `RIPPLE_LOG`, then the default filter
fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    if let Some(filter) = env::var("RIPPLE_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
    {
        return filter;
    }
    EnvFilter::new(DEFAULT_FILTER)
}
