use anyhow::{Context, Result};
use server::config::ServerConfig;
use server::http::{self, AccessPolicy, AppState};
use std::sync::Arc;
use storage_backend::{BackendKind, Registry};
use tracing::{Level, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    info!("Starting configuration registry");

    let config = ServerConfig::load()?;
    info!("Server version: {}", config.server_version());

    // Create local storage directories if they don't exist
    for backend in &config.backends {
        if let BackendKind::File { root } = &backend.kind {
            info!("Using storage path: {}", root.display());
            std::fs::create_dir_all(root)
                .with_context(|| format!("Failed to create {}", root.display()))?;
        }
    }

    let registry = Registry::from_config(&config.backends, config.server_version())?;
    let access = AccessPolicy::new(config.access_tokens.iter().cloned());
    if access.is_open() {
        info!("No access tokens configured, registry is open");
    }

    let state = Arc::new(AppState::new(registry, access));

    // Start the HTTP server
    http::start_server(state, config.bind_address).await?;

    Ok(())
}
