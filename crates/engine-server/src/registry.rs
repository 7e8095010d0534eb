//! Live connection registry and broadcast fan-out.
//!
//! The set of active connections is owned by a single registry task on the
//! server's event loop. Everything else talks to it through a
//! [`RegistryHandle`], which sends commands over a channel, so the set is
//! never shared behind a lock.
//!
//! A broadcast serializes its payload once, then seals and sends it to
//! every connection concurrently. A failed send marks that connection
//! closed; the prune that follows each broadcast drops it from the set.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::extract::ws::{CloseFrame, Message};
use engine_server_types::ConnectionId;
use futures::future::join_all;
use futures::{Sink, SinkExt as _};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, Envelope};

/// WebSocket close code sent to every client when the server stops.
pub const GOING_AWAY: u16 = 1001;

/// WebSocket close code for an ordinary close.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close reason sent to every client when the server stops.
pub const SHUTDOWN_REASON: &str = "Server shutdown";

type WsSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// Why a send to one connection failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection was already closed.
    #[error("connection closed")]
    Closed,

    /// The payload could not be sealed for this peer.
    #[error("failed to seal payload: {0}")]
    Seal(#[from] CryptoError),

    /// The socket rejected the frame.
    #[error("socket error: {0}")]
    Socket(axum::Error),
}

/// One accepted WebSocket session.
///
/// Clones share the same socket and closed flag.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    sink: Arc<Mutex<WsSink>>,
    envelope: Arc<Envelope>,
    closed: Arc<AtomicBool>,
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("envelope", &self.envelope)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap the sending half of a socket.
    pub fn new<S>(id: ConnectionId, sink: S, envelope: Arc<Envelope>) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        let sink: WsSink = Box::pin(sink);
        Self {
            id,
            sink: Arc::new(Mutex::new(sink)),
            envelope,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// This connection's identifier.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// How bodies sent on this connection are protected.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Whether the socket has closed or failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the connection closed without sending anything.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Seal `json` for this peer and send it as one text frame.
    ///
    /// A socket error marks the connection closed.
    pub async fn send_json(&self, json: &str) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let sealed = self.envelope.seal_text(json)?;
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(sealed.into())).await {
            self.mark_closed();
            return Err(SendError::Socket(e));
        }
        Ok(())
    }

    /// Send a close frame and close the socket. Idempotent.
    pub async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(connection = %self.id, error = %e, "close frame not sent");
        }
        if let Err(e) = sink.close().await {
            debug!(connection = %self.id, error = %e, "socket already closed");
        }
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the payload was offered to.
    pub attempted: usize,
    /// Connections that accepted the frame.
    pub delivered: usize,
}

impl BroadcastReport {
    /// Connections the payload did not reach.
    pub const fn failed(&self) -> usize {
        self.attempted.saturating_sub(self.delivered)
    }
}

enum Command {
    Register(Connection),
    Unregister(ConnectionId),
    Snapshot(oneshot::Sender<Vec<Connection>>),
    Prune,
    CloseAll {
        code: u16,
        reason: String,
        done: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the registry task.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    commands: mpsc::UnboundedSender<Command>,
    live: Arc<AtomicUsize>,
}

/// Spawn the registry task on the current runtime.
///
/// The task ends once every handle has been dropped.
pub fn spawn_registry() -> (RegistryHandle, JoinHandle<()>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let live = Arc::new(AtomicUsize::new(0));
    let task = tokio::spawn(run(receiver, Arc::clone(&live)));
    (RegistryHandle { commands, live }, task)
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, live: Arc<AtomicUsize>) {
    let mut active: Vec<Connection> = Vec::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register(connection) => {
                debug!(connection = %connection.id(), "connection registered");
                active.push(connection);
            }
            Command::Unregister(id) => {
                active.retain(|connection| connection.id() != id);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(active.clone());
            }
            Command::Prune => {
                let before = active.len();
                active.retain(|connection| !connection.is_closed());
                let pruned = before.saturating_sub(active.len());
                if pruned > 0 {
                    debug!(pruned, "pruned closed connections");
                }
            }
            Command::CloseAll { code, reason, done } => {
                let closing = std::mem::take(&mut active);
                join_all(closing.iter().map(|connection| connection.close(code, &reason))).await;
                info!(closed = closing.len(), code, "closed all connections");
                let _ = done.send(closing.len());
            }
        }
        live.store(active.len(), Ordering::Release);
    }
}

/// Removes its connection from the registry when dropped.
#[derive(Debug)]
pub struct Registration {
    registry: RegistryHandle,
    connection: Connection,
}

impl Registration {
    /// The registered connection.
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.connection.mark_closed();
        self.registry.unregister(self.connection.id());
    }
}

impl RegistryHandle {
    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("registry task has stopped, command dropped");
        }
    }

    /// Add a connection to the active set.
    pub fn register(&self, connection: Connection) {
        self.submit(Command::Register(connection));
    }

    /// Remove a connection from the active set.
    pub fn unregister(&self, id: ConnectionId) {
        self.submit(Command::Unregister(id));
    }

    /// Register a connection for as long as the returned guard lives.
    pub fn enroll(&self, connection: Connection) -> Registration {
        self.register(connection.clone());
        Registration {
            registry: self.clone(),
            connection,
        }
    }

    /// Drop every connection that has reported itself closed.
    pub fn prune(&self) {
        self.submit(Command::Prune);
    }

    /// Snapshot of the active set.
    pub async fn connections(&self) -> Vec<Connection> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Snapshot(reply));
        response.await.unwrap_or_default()
    }

    /// Number of live connections, readable from any thread.
    pub fn connection_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Close every connection with `code` and `reason` and empty the set.
    ///
    /// Returns how many connections were closed.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let (done, closed) = oneshot::channel();
        self.submit(Command::CloseAll {
            code,
            reason: reason.to_owned(),
            done,
        });
        closed.await.unwrap_or_default()
    }

    /// Send `payload` to every live connection.
    ///
    /// Per-connection failures are logged and never abort the broadcast.
    pub async fn broadcast(&self, payload: &Value) -> BroadcastReport {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast payload");
                return BroadcastReport::default();
            }
        };

        let connections = self.connections().await;
        let sends = connections.iter().map(|connection| {
            let json = json.as_str();
            async move { (connection.id(), connection.send_json(json).await) }
        });

        let mut delivered: usize = 0;
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(e) => warn!(connection = %id, error = %e, "failed to deliver broadcast"),
            }
        }

        self.prune();

        let report = BroadcastReport {
            attempted: connections.len(),
            delivered,
        };
        debug!(attempted = report.attempted, delivered, "broadcast complete");
        report
    }
}
