//! Shared application state for the HTTP and WebSocket routes.
//!
//! One [`AppState`] exists per running server. It is built on the event
//! loop thread once the listener is bound and dropped when the loop exits.

use std::sync::Arc;

use engine_server_types::ReceivedMessage;
use tokio::sync::watch;

use crate::cell::StatusCell;
use crate::config::{AuthMode, OriginPattern, ServerConfig};
use crate::crypto::KeyPair;
use crate::registry::RegistryHandle;

/// State shared by every request handler.
#[derive(Debug)]
pub struct AppState {
    /// The server's long-term key pair.
    pub keys: Arc<KeyPair>,
    /// Allowed request origins.
    pub origins: Arc<[OriginPattern]>,
    /// Request authentication mode.
    pub auth: AuthMode,
    /// Whether the listener speaks TLS.
    pub tls_enabled: bool,
    /// The live connection registry.
    pub registry: RegistryHandle,
    /// Inbound messages, one write per decrypted client payload.
    pub messages: StatusCell<Option<ReceivedMessage>>,
    /// Flips to `true` once the server begins shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Build state from a config snapshot and the loop-owned pieces.
    pub fn new(
        config: &ServerConfig,
        tls_enabled: bool,
        registry: RegistryHandle,
        messages: StatusCell<Option<ReceivedMessage>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            keys: Arc::clone(&config.keys),
            origins: config.origins.iter().cloned().collect(),
            auth: config.auth.clone(),
            tls_enabled,
            registry,
            messages,
            shutdown,
        }
    }

    /// Whether `origin` matches any allowed pattern.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.origins.iter().any(|pattern| pattern.matches(origin))
    }

    /// The WebSocket URL scheme clients should use.
    pub const fn protocol(&self) -> &'static str {
        if self.tls_enabled { "wss://" } else { "ws://" }
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
