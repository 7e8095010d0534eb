//! Engine integration layer for the engine server.
//!
//! Connects an [`engine_server::EngineServer`] to a running engine:
//!
//! - [`EngineAdapter`] -- the narrow set of operations the bridge may
//!   perform on the engine
//! - [`routing`] -- how inbound client commands map onto those operations
//! - [`EngineServerManager`] -- start/stop/status of a server built from
//!   configuration, plus [`EngineEvent`](engine_server_types::EngineEvent)
//!   publishing

pub mod adapter;
pub mod error;
pub mod manager;
pub mod routing;

pub use adapter::{EngineAdapter, LoggingAdapter};
pub use error::BridgeError;
pub use manager::{CONFIG_FILE_NAME, ConfigSource, EngineServerManager};
