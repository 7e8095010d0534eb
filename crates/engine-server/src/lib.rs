//! Encrypted broadcast WebSocket server with a cross-thread control bridge.
//!
//! This crate lets a host application expose its event stream and command
//! surface to remote clients:
//!
//! - **Lifecycle** ([`EngineServer`]) -- a dedicated background thread
//!   running a single-threaded tokio event loop, started and stopped from
//!   any thread
//! - **Broadcast** ([`EngineServer::queue_message`]) -- fire-and-forget
//!   fan-out of a JSON payload to every connected client, sealed per client
//! - **Inbound messages** ([`EngineServer::register_message_callback`]) --
//!   every decrypted client payload delivered to one callback
//! - **Status** ([`StatusCell`]) -- a thread-safe observable value whose
//!   listeners run on the event loop, never on the writer's thread
//!
//! # Architecture
//!
//! Caller threads never touch loop-owned state. They spawn work onto the
//! loop's runtime handle, and the loop owns the connection registry, the
//! listener, and every socket. Each connection carries its own box
//! [`MailBox`] bound to the client's declared public key, so one broadcast
//! yields a different ciphertext per client.
//!
//! Routes: `GET /`, `GET /getpublickey` (unauthenticated), `GET /protocol`
//! and `GET /websocket`, all behind the origin check, CORS and
//! authentication filters in [`filter`].
//!
//! [`MailBox`]: crypto::MailBox

pub mod cell;
pub mod config;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;
pub mod tls;
pub mod ws;

// Re-export primary types for convenience.
pub use cell::StatusCell;
pub use config::{AuthMode, ConfigError, OriginPattern, ServerConfig, TlsConfig};
pub use crypto::{CryptoError, Envelope, KeyPair, MailBox};
pub use error::{FilterError, ServerError};
pub use registry::BroadcastReport;
pub use router::build_router;
pub use server::EngineServer;
pub use state::AppState;
