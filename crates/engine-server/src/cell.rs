//! Thread-safe observable value slot.
//!
//! A [`StatusCell`] holds one value that any thread may read or replace.
//! Each [`write`](StatusCell::write) with listeners registered spawns one
//! fan-out task on the cell's event loop; the task runs every listener
//! concurrently and waits for all of them. The writer never waits for
//! listeners, and a listener that fails or panics is logged without
//! affecting the others.
//!
//! Writes are events, not just values: writing a value equal to the
//! current one still notifies. Listeners only ever run on the loop bound
//! with [`bind`](StatusCell::bind); until then a write just stores.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt as _;
use futures::future::{BoxFuture, join_all};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A boxed async listener invoked with each written value.
pub type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Inner<T> {
    name: &'static str,
    value: RwLock<T>,
    listeners: RwLock<Vec<Listener<T>>>,
    runtime: RwLock<Option<Handle>>,
    notifications: AtomicU64,
}

/// An observable value shared between arbitrary threads and one event loop.
///
/// Cloning the cell yields another handle to the same slot.
pub struct StatusCell<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for StatusCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> core::fmt::Debug for StatusCell<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusCell")
            .field("name", &self.inner.name)
            .field("listeners", &self.inner.listeners.read().len())
            .field("notifications", &self.inner.notifications.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> StatusCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cell holding `initial`. `name` appears in log fields.
    pub fn new(name: &'static str, initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                value: RwLock::new(initial),
                listeners: RwLock::new(Vec::new()),
                runtime: RwLock::new(None),
                notifications: AtomicU64::new(0),
            }),
        }
    }

    /// The name given at construction.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// The most recently written value.
    pub fn read(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Replace the value and schedule listener notification.
    ///
    /// Returns the fan-out task's handle, or `None` when no listener is
    /// registered or no event loop is bound to run them. Awaiting the
    /// handle is optional; dropping it detaches the task.
    pub fn write(&self, value: T) -> Option<JoinHandle<()>> {
        *self.inner.value.write() = value.clone();

        let listeners = self.inner.listeners.read().clone();
        if listeners.is_empty() {
            return None;
        }

        let Some(runtime) = self.runtime() else {
            warn!(cell = self.inner.name, "no event loop bound, dropping notification");
            return None;
        };

        let notification = self.inner.notifications.fetch_add(1, Ordering::Relaxed);
        Some(runtime.spawn(fan_out(self.inner.name, notification, listeners, value)))
    }

    /// Register an async listener for every subsequent write.
    pub fn add_listener<F, Fut>(&self, listener: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let listener: Listener<T> = Arc::new(move |value| listener(value).boxed());
        self.inner.listeners.write().push(listener);
    }

    /// Drop every registered listener.
    pub fn clear_listeners(&self) {
        self.inner.listeners.write().clear();
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Run notifications on `runtime`, whatever thread writes.
    pub fn bind(&self, runtime: Handle) {
        *self.inner.runtime.write() = Some(runtime);
    }

    /// Forget the bound runtime.
    pub fn unbind(&self) {
        *self.inner.runtime.write() = None;
    }

    fn runtime(&self) -> Option<Handle> {
        self.inner.runtime.read().clone()
    }
}

async fn fan_out<T>(cell: &'static str, notification: u64, listeners: Vec<Listener<T>>, value: T)
where
    T: Clone + Send + 'static,
{
    debug!(cell, notification, listeners = listeners.len(), "notifying listeners");

    // Each listener gets its own task so a panic stays contained.
    let tasks = listeners.into_iter().map(|listener| {
        let value = value.clone();
        tokio::spawn(async move { listener(value).await })
    });

    for result in join_all(tasks).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(cell, notification, error = %e, "listener failed"),
            Err(e) => error!(cell, notification, error = %e, "listener panicked"),
        }
    }
}
