//! Server lifecycle: the background thread and its event loop.
//!
//! [`EngineServer`] owns one dedicated OS thread per run. The thread builds
//! a single-threaded tokio runtime, binds the listener, serves the router,
//! and then waits for a stop request. All network I/O, sealing and
//! connection bookkeeping happen on that thread; other threads reach it
//! only by spawning work onto its runtime handle ([`EngineServer::queue_message`],
//! [`EngineServer::queue_stop`]).
//!
//! ```text
//!  Stopped ──start()──▶ Running ──stop()──▶ Stopped
//! ```
//!
//! `start` blocks until the listener is bound or has failed, so bind and
//! TLS errors surface to the caller with the status still `Stopped`. `stop`
//! only requests shutdown; `join` waits for the thread to finish it.
//! Teardown closes every connection with `1001 Server shutdown`, releases
//! the listener, drops inbound-message listeners, and finally writes
//! `Stopped`, waiting for status listeners to see it.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender};
use std::thread::JoinHandle;

use engine_server_types::{ReceivedMessage, ServerStatus};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cell::StatusCell;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::{BroadcastReport, GOING_AWAY, RegistryHandle, SHUTDOWN_REASON, spawn_registry};
use crate::router::build_router;
use crate::state::AppState;
use crate::tls::{self, TlsListener};

/// Name of the background thread.
const THREAD_NAME: &str = "engine-server";

/// Handles into a running loop, shared with caller threads.
#[derive(Debug, Clone)]
struct LoopControl {
    runtime: Handle,
    stop: Arc<Notify>,
    registry: RegistryHandle,
    local_addr: SocketAddr,
}

/// Everything the loop thread needs, moved in at spawn.
struct LoopContext {
    config: ServerConfig,
    acceptor: Option<TlsAcceptor>,
    status: StatusCell<ServerStatus>,
    messages: StatusCell<Option<ReceivedMessage>>,
    control: Arc<Mutex<Option<LoopControl>>>,
}

type Ready = SyncSender<Result<SocketAddr, ServerError>>;

/// An encrypted broadcast WebSocket server running on its own thread.
#[derive(Debug)]
pub struct EngineServer {
    config: ServerConfig,
    status: StatusCell<ServerStatus>,
    messages: StatusCell<Option<ReceivedMessage>>,
    control: Arc<Mutex<Option<LoopControl>>>,
    thread: Mutex<Option<JoinHandle<Result<(), ServerError>>>>,
}

impl EngineServer {
    /// Create a stopped server for `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: StatusCell::new("status", ServerStatus::Stopped),
            messages: StatusCell::new("messages", None),
            control: Arc::new(Mutex::new(None)),
            thread: Mutex::new(None),
        }
    }

    /// The configuration this server was built with.
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ServerStatus {
        self.status.read()
    }

    /// Start the background thread and wait until it is listening.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyRunning`] if the server is not stopped.
    /// - [`ServerError::Tls`] if TLS material cannot be loaded.
    /// - [`ServerError::Bind`] if the address cannot be bound.
    /// - [`ServerError::Runtime`] if the thread or runtime cannot be built.
    pub fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut thread = self.thread.lock();
        if self.status.read() != ServerStatus::Stopped {
            return Err(ServerError::AlreadyRunning);
        }

        // A previous run may still be finishing its exit.
        if let Some(previous) = thread.take() {
            if previous.thread().id() == std::thread::current().id() {
                debug!("restarting from the old loop thread, leaving it to exit");
            } else {
                match previous.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "previous run ended with an error"),
                    Err(_panic) => warn!("previous server thread panicked"),
                }
            }
        }

        let acceptor = self.config.tls.as_ref().map(tls::load_acceptor).transpose()?;

        let (ready, started) = mpsc::sync_channel(1);
        let context = LoopContext {
            config: self.config.clone(),
            acceptor,
            status: self.status.clone(),
            messages: self.messages.clone(),
            control: Arc::clone(&self.control),
        };
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || run_loop(context, &ready))
            .map_err(|e| ServerError::Runtime(format!("failed to spawn server thread: {e}")))?;

        match started.recv() {
            Ok(Ok(addr)) => {
                *thread = Some(handle);
                Ok(addr)
            }
            Ok(Err(e)) => {
                if handle.join().is_err() {
                    warn!("server thread panicked after a failed start");
                }
                Err(e)
            }
            Err(mpsc::RecvError) => Err(match handle.join() {
                Ok(Err(e)) => e,
                Ok(Ok(())) => {
                    ServerError::Runtime("server thread exited during startup".to_owned())
                }
                Err(_panic) => ServerError::ThreadPanicked,
            }),
        }
    }

    /// Request shutdown. Returns immediately; use [`join`](Self::join) to
    /// wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotRunning`] if the server is not running.
    pub fn stop(&self) -> Result<(), ServerError> {
        if self.status.read() != ServerStatus::Running {
            return Err(ServerError::NotRunning);
        }
        self.queue_stop();
        Ok(())
    }

    /// Request shutdown if a loop is running; otherwise do nothing.
    pub fn queue_stop(&self) {
        if let Some(control) = self.control.lock().as_ref() {
            let stop = Arc::clone(&control.stop);
            control.runtime.spawn(async move { stop.notify_one() });
        }
    }

    /// Block until the background thread has exited.
    ///
    /// Call [`stop`](Self::stop) first; the thread never exits on its own.
    ///
    /// # Errors
    ///
    /// - [`ServerError::JoinFromLoopThread`] when called from the loop itself.
    /// - [`ServerError::Serve`] if the run ended because serving failed.
    /// - [`ServerError::ThreadPanicked`] if the thread panicked.
    pub fn join(&self) -> Result<(), ServerError> {
        let handle = {
            let mut thread = self.thread.lock();
            if thread
                .as_ref()
                .is_some_and(|handle| handle.thread().id() == std::thread::current().id())
            {
                return Err(ServerError::JoinFromLoopThread);
            }
            thread.take()
        };

        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_panic| ServerError::ThreadPanicked)?,
            None => Ok(()),
        }
    }

    /// [`stop`](Self::stop) then [`join`](Self::join).
    ///
    /// # Errors
    ///
    /// Any error `stop` or `join` returns.
    pub fn stop_and_join(&self) -> Result<(), ServerError> {
        self.stop()?;
        self.join()
    }

    /// Broadcast `payload` to every connection without waiting.
    ///
    /// Returns `None`, dropping the payload, when no loop is running. The
    /// handle resolves to the broadcast's delivery report.
    pub fn queue_message(&self, payload: Value) -> Option<tokio::task::JoinHandle<BroadcastReport>> {
        let control = self.control.lock().clone()?;
        let registry = control.registry;
        Some(
            control
                .runtime
                .spawn(async move { registry.broadcast(&payload).await }),
        )
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.control.lock().as_ref().map(|control| control.local_addr)
    }

    /// Number of live connections; zero when stopped.
    pub fn connection_count(&self) -> usize {
        self.control
            .lock()
            .as_ref()
            .map_or(0, |control| control.registry.connection_count())
    }

    /// Observe lifecycle transitions.
    ///
    /// Listeners run on the loop thread and survive restarts.
    pub fn add_status_listener<F, Fut>(&self, listener: F)
    where
        F: Fn(ServerStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.status.add_listener(listener);
    }

    /// Receive every decrypted client payload except the close sentinel.
    ///
    /// Callbacks run on the loop thread and are dropped when the server
    /// stops; register again before restarting.
    pub fn register_message_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.messages.add_listener(move |message: Option<ReceivedMessage>| {
            let call = message.map(&callback);
            async move {
                match call {
                    Some(call) => call.await,
                    None => Ok(()),
                }
            }
        });
    }
}

impl Drop for EngineServer {
    fn drop(&mut self) {
        if self.status.read() == ServerStatus::Running {
            self.queue_stop();
        }
        if let Err(e) = self.join() {
            warn!(error = %e, "server thread did not exit cleanly");
        }
    }
}

fn run_loop(context: LoopContext, ready: &Ready) -> Result<(), ServerError> {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(ServerError::Runtime(format!(
                "failed to build event loop: {e}"
            ))));
            return Ok(());
        }
    };
    runtime.block_on(serve(context, ready))
}

/// What the serve task's completion means for the run as a whole.
fn serve_outcome(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    match result {
        Ok(Ok(())) => {
            debug!("listener released");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "server failed while serving");
            Err(ServerError::Serve(e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "server task panicked");
            Err(ServerError::Serve(format!("serve task failed: {e}")))
        }
    }
}

async fn serve(context: LoopContext, ready: &Ready) -> Result<(), ServerError> {
    let LoopContext {
        config,
        acceptor,
        status,
        messages,
        control,
    } = context;

    let listener = match TcpListener::bind((config.host.as_str(), config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(ServerError::Bind(format!(
                "bind failed on {}:{}: {e}",
                config.host, config.port
            ))));
            return Ok(());
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready.send(Err(ServerError::Bind(format!("no local address: {e}"))));
            return Ok(());
        }
    };

    let runtime = Handle::current();
    status.bind(runtime.clone());
    messages.bind(runtime.clone());

    let (registry, _registry_task) = spawn_registry();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tls_enabled = acceptor.is_some();
    let state = Arc::new(AppState::new(
        &config,
        tls_enabled,
        registry.clone(),
        messages.clone(),
        shutdown_rx,
    ));
    let router = build_router(state);

    let mut graceful = shutdown_tx.subscribe();
    let graceful = async move {
        let _ = graceful.wait_for(|stopping| *stopping).await;
    };
    let mut server = match acceptor {
        Some(acceptor) => tokio::spawn(
            axum::serve(TlsListener::new(listener, acceptor), router)
                .with_graceful_shutdown(graceful)
                .into_future(),
        ),
        None => tokio::spawn(
            axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .into_future(),
        ),
    };

    let stop = Arc::new(Notify::new());
    *control.lock() = Some(LoopControl {
        runtime,
        stop: Arc::clone(&stop),
        registry: registry.clone(),
        local_addr,
    });
    status.write(ServerStatus::Running);
    info!(%local_addr, tls = tls_enabled, public_key = %config.keys.public_key_hex(), "engine server listening");
    let _ = ready.send(Ok(local_addr));

    let finished = tokio::select! {
        () = stop.notified() => None,
        result = &mut server => Some(result),
    };
    info!("engine server stopping");

    registry.close_all(GOING_AWAY, SHUTDOWN_REASON).await;
    let _ = shutdown_tx.send(true);

    let outcome = serve_outcome(match finished {
        Some(result) => result,
        None => server.await,
    });

    messages.clear_listeners();
    *control.lock() = None;
    if let Some(notification) = status.write(ServerStatus::Stopped)
        && let Err(e) = notification.await
    {
        warn!(error = %e, "status notification did not finish");
    }
    status.unbind();
    messages.unbind();
    info!("engine server stopped");
    outcome
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn local() -> ServerConfig {
        ServerConfig::default().with_host("127.0.0.1").with_port(0)
    }

    #[test]
    fn start_twice_fails_then_stop_succeeds() {
        let server = EngineServer::new(local());
        let addr = server.start().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.status(), ServerStatus::Running);
        assert_eq!(server.local_addr(), Some(addr));

        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));

        server.stop_and_join().unwrap();
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert_eq!(server.local_addr(), None);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn stop_when_stopped_fails() {
        let server = EngineServer::new(local());
        assert!(matches!(server.stop(), Err(ServerError::NotRunning)));
        server.start().unwrap();
        server.stop_and_join().unwrap();
        assert!(matches!(server.stop(), Err(ServerError::NotRunning)));
    }

    #[test]
    fn queue_message_without_loop_is_a_no_op() {
        let server = EngineServer::new(local());
        assert!(server.queue_message(serde_json::json!({"quit": true})).is_none());
        server.queue_stop();
        assert!(server.join().is_ok());
    }

    #[test]
    fn bind_failure_leaves_server_stopped() {
        let first = EngineServer::new(local());
        let addr = first.start().unwrap();

        let second = EngineServer::new(local().with_port(addr.port()));
        assert!(matches!(second.start(), Err(ServerError::Bind(_))));
        assert_eq!(second.status(), ServerStatus::Stopped);

        first.stop_and_join().unwrap();
    }

    #[test]
    fn server_can_restart() {
        let server = EngineServer::new(local());
        server.start().unwrap();
        server.stop_and_join().unwrap();
        server.start().unwrap();
        assert_eq!(server.status(), ServerStatus::Running);
        server.stop_and_join().unwrap();
    }

    #[test]
    fn status_listeners_see_both_transitions() {
        let server = EngineServer::new(local());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        server.add_status_listener(move |status| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(status);
                Ok(())
            }
        });

        server.start().unwrap();
        server.stop_and_join().unwrap();

        assert_eq!(
            *seen.lock(),
            vec![ServerStatus::Running, ServerStatus::Stopped]
        );
    }

    #[test]
    fn serve_failure_is_reported_as_serve_error() {
        let failed = Ok(Err(std::io::Error::other("listener lost")));
        match serve_outcome(failed) {
            Err(ServerError::Serve(message)) => assert!(message.contains("listener lost")),
            other => panic!("expected a serve error, got {other:?}"),
        }
        assert!(serve_outcome(Ok(Ok(()))).is_ok());
    }

    #[test]
    fn join_after_clean_stop_is_ok() {
        let server = EngineServer::new(local());
        server.start().unwrap();
        server.stop().unwrap();
        assert!(server.join().is_ok());
        assert!(server.join().is_ok());
    }

    #[test]
    fn dropping_a_running_server_stops_it() {
        let server = EngineServer::new(local());
        let addr = server.start().unwrap();
        drop(server);

        let rebound = EngineServer::new(local().with_port(addr.port()));
        rebound.start().unwrap();
        rebound.stop_and_join().unwrap();
    }
}
