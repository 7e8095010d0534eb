//! Error types for the engine integration layer.

use engine_server::{ConfigError, ServerError};

/// Errors from managing the engine server.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A server lifecycle error.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The server configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
