//! Stand-alone engine server.
//!
//! Runs the server with a logging-only engine adapter, which is useful for
//! developing clients without an engine attached.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Resolve the config file (`ENGINE_SERVER_CONFIG`, or
//!    `plover_engine_server_config.json` in the working directory)
//! 3. Start the server and log its address and public key
//! 4. Run until `Ctrl-C`, then stop and join the server thread

use std::path::PathBuf;
use std::sync::Arc;

use engine_server_bridge::{CONFIG_FILE_NAME, ConfigSource, EngineServerManager, LoggingAdapter};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable naming the config file.
const CONFIG_ENV: &str = "ENGINE_SERVER_CONFIG";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if the server fails to start or stop.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path =
        std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(CONFIG_FILE_NAME), PathBuf::from);
    info!(config = %config_path.display(), "engine-server starting");

    let manager = Arc::new(EngineServerManager::new(
        Arc::new(LoggingAdapter::default()),
        ConfigSource::File(config_path),
    ));

    let starting = Arc::clone(&manager);
    let addr = tokio::task::spawn_blocking(move || starting.start()).await??;
    info!(
        %addr,
        public_key = %manager.public_key_hex().unwrap_or_default(),
        "engine-server ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let stopping = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || stopping.stop()).await??;
    info!("engine-server shutdown complete");

    Ok(())
}
