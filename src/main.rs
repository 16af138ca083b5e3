// Main entry point for the Dockvault backend
mod archive;
mod backup;
mod compose;
mod config;
mod deploy;
mod detect;
mod engine;
mod error;
mod jobs;
mod restore;
mod rewrite;
mod scheduler;
mod server;
mod stack_restore;
mod store;
mod uploader;

use anyhow::Result;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    // Parse configuration
    let config = config::Config::parse()?;

    info!("Starting Dockvault...");
    info!("Port: {}", config.port);
    info!("Data directory: {}", config.data_dir.display());
    info!("Backup directory: {}", config.backup_dir.display());

    // Start the server
    server::serve(config).await?;

    Ok(())
}
