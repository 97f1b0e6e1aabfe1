//! Noteweave server binary
//!
//! Run with: cargo run -p noteweave --bin noteweave-server [config.toml]
//! The config path may also be given through NOTEWEAVE_CONFIG.

use std::path::PathBuf;

use noteweave::{config::AppConfig, server::NoteweaveServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "noteweave=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("NOTEWEAVE_CONFIG").ok())
        .map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    tracing::info!("Configuration loaded");
    if let Some(path) = &config_path {
        tracing::info!("  - Config file: {}", path.display());
    }
    tracing::info!("  - Data directory: {}", config.storage.data_dir.display());
    tracing::info!("  - Embedding model: {}", config.embeddings.model_id());
    tracing::info!(
        "  - Chunk size: {} (overlap {})",
        config.chunking.chunk_size,
        config.chunking.chunk_overlap
    );

    let server = NoteweaveServer::new(config).await?;

    let providers: Vec<&str> = server
        .state()
        .registry()
        .describe()
        .iter()
        .map(|p| p.kind.as_str())
        .collect();
    if providers.is_empty() {
        tracing::warn!("No AI providers configured; chat requests will fail");
        tracing::warn!("Set OPENAI_API_KEY, ANTHROPIC_API_KEY or GOOGLE_API_KEY, or a local model URL");
    } else {
        tracing::info!("Providers: {}", providers.join(", "));
    }

    println!("\nServer starting...");
    println!("  API:      http://{}/api", server.address());
    println!("  Health:   http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}

