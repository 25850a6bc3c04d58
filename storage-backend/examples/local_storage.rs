use anyhow::Result;
use shared_types::{Document, RegistryKey};
use storage_backend::{BackendConfig, Precondition, Registry, RegistryError};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Route everything to a local directory
    let storage_path = std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data".to_string());
    println!("Using storage path: {storage_path}");

    let configs = [BackendConfig::file("local", &["**"], &storage_path)];
    let registry = Registry::from_config(&configs, env!("CARGO_PKG_VERSION"))?;

    let key = RegistryKey::new("local", "platform", "monorepo");

    // Start from a fresh document if nothing is stored yet
    let loaded = registry.load(&key, true).await?;
    println!("\nLoaded {key} (version {})", loaded.document.api_version);

    let precondition = match loaded.token {
        Some(token) => Precondition::Matches(token),
        None => Precondition::Absent,
    };

    let document = Document::new(
        loaded.document.api_version,
        serde_json::json!({
            "develop": "develop",
            "main": "main",
            "releases": {"prefix": "release/"},
            "features": {"prefix": "feature/"}
        }),
    );

    let outcome = registry.save(&key, &document, &precondition).await?;
    println!("Saved with token {}", outcome.token());

    // A second writer holding the old precondition loses the race
    let changed = Document::new(
        document.api_version.clone(),
        serde_json::json!({"develop": "dev"}),
    );
    match registry.save(&key, &changed, &precondition).await {
        Err(RegistryError::PreconditionFailed { actual, .. }) => {
            println!("Stale write rejected, stored token is {actual}");
        }
        other => println!("Second save: {other:?}"),
    }

    let current = registry.load(&key, false).await?;
    println!(
        "\nContent: {}",
        serde_json::to_string_pretty(&current.document.content)?
    );

    Ok(())
}
