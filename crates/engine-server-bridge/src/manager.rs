//! Manages the server that exposes an engine.
//!
//! [`EngineServerManager`] rebuilds the server from its configuration on
//! every start, wires inbound client commands to the [`EngineAdapter`],
//! and turns engine events into broadcasts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use engine_server::{BroadcastReport, EngineServer, ServerConfig, ServerError};
use engine_server_types::{EngineEvent, ServerStatus};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::adapter::EngineAdapter;
use crate::error::BridgeError;
use crate::routing::route_received;

/// File name of the server config inside the engine's config directory.
pub const CONFIG_FILE_NAME: &str = "plover_engine_server_config.json";

/// Where the manager gets its configuration.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Reload this JSON file on every start.
    File(PathBuf),
    /// Use this snapshot on every start.
    Fixed(ServerConfig),
}

/// Owns at most one running server and connects it to the engine.
pub struct EngineServerManager {
    adapter: Arc<dyn EngineAdapter>,
    source: ConfigSource,
    server: Mutex<Option<Arc<EngineServer>>>,
}

impl core::fmt::Debug for EngineServerManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EngineServerManager")
            .field("source", &self.source)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl EngineServerManager {
    /// Create a manager with no server running.
    pub fn new(adapter: Arc<dyn EngineAdapter>, source: ConfigSource) -> Self {
        Self {
            adapter,
            source,
            server: Mutex::new(None),
        }
    }

    fn load_config(&self) -> Result<ServerConfig, BridgeError> {
        match &self.source {
            ConfigSource::File(path) => {
                debug!(path = %path.display(), "loading server config");
                Ok(ServerConfig::from_file(path)?)
            }
            ConfigSource::Fixed(config) => Ok(config.clone()),
        }
    }

    /// Build a server from the current configuration and start it.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyRunning`] if a server is running.
    /// - [`BridgeError::Config`] if the configuration cannot be loaded.
    /// - Any start error from the server itself.
    pub fn start(&self) -> Result<SocketAddr, BridgeError> {
        let mut slot = self.server.lock();
        if slot
            .as_ref()
            .is_some_and(|server| server.status() != ServerStatus::Stopped)
        {
            return Err(ServerError::AlreadyRunning.into());
        }

        let server = Arc::new(EngineServer::new(self.load_config()?));
        let adapter = Arc::clone(&self.adapter);
        server.register_message_callback(move |received| {
            let adapter = Arc::clone(&adapter);
            async move {
                route_received(adapter.as_ref(), &received);
                Ok(())
            }
        });

        let addr = server.start()?;
        info!(%addr, "engine server started");
        *slot = Some(server);
        Ok(addr)
    }

    /// Stop the running server and wait for its thread to exit.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotRunning`] if no server is running.
    /// - [`ServerError::ThreadPanicked`] if the server thread panicked.
    pub fn stop(&self) -> Result<(), BridgeError> {
        let server = {
            let mut slot = self.server.lock();
            match slot.as_ref() {
                Some(server) if server.status() == ServerStatus::Running => slot.take(),
                _ => None,
            }
        };
        let server = server.ok_or(ServerError::NotRunning)?;

        info!("stopping engine server");
        server.stop_and_join()?;
        info!("engine server thread joined");
        Ok(())
    }

    /// Status of the managed server; `Stopped` when there is none.
    pub fn status(&self) -> ServerStatus {
        self.server
            .lock()
            .as_ref()
            .map_or(ServerStatus::Stopped, |server| server.status())
    }

    /// Broadcast an engine event to every client.
    ///
    /// Returns `None`, dropping the event, when no server is running.
    pub fn publish(&self, event: &EngineEvent) -> Option<JoinHandle<BroadcastReport>> {
        let server = self.server.lock().clone()?;
        let queued = server.queue_message(event.to_payload());
        if queued.is_none() {
            debug!(event = event.name(), "server not running, event dropped");
        }
        queued
    }

    /// The running server's bound address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().and_then(|server| server.local_addr())
    }

    /// The running server's public key, hex-encoded.
    pub fn public_key_hex(&self) -> Option<String> {
        self.server
            .lock()
            .as_ref()
            .map(|server| server.config().keys.public_key_hex())
    }

    /// Live connections on the running server.
    pub fn connection_count(&self) -> usize {
        self.server
            .lock()
            .as_ref()
            .map_or(0, |server| server.connection_count())
    }
}
