//! Shared type definitions for the engine server.
//!
//! Everything that crosses a crate boundary or the wire lives here: the
//! server lifecycle status, connection identifiers, the inbound command
//! record clients send, and the outbound event union the engine
//! broadcasts. Wire-facing types derive `ts-rs` bindings for browser
//! clients.
//!
//! # Modules
//!
//! - [`status`] -- [`ServerStatus`] lifecycle states
//! - [`ids`] -- [`ConnectionId`] for live WebSocket sessions
//! - [`inbound`] -- Commands received from clients
//! - [`events`] -- Engine events broadcast to clients

pub mod events;
pub mod ids;
pub mod inbound;
pub mod status;

pub use events::{EngineEvent, MachineStateChanged, Translated};
pub use ids::ConnectionId;
pub use inbound::{CLOSE_SENTINEL, InboundFrame, InboundMessage, ReceivedMessage};
pub use status::ServerStatus;
