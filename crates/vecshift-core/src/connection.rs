//! Lazily-connecting, self-healing connection handles.
//!
//! A [`ConnectionManager`] is built once by the process's composition root
//! and shared (behind an `Arc`) by every adapter, exporter and importer that
//! talks to the same backend. It owns at most one live handle:
//!
//! - [`ConnectionManager::handle`] connects on first use. A failed connect is
//!   logged and retried after a fixed delay, indefinitely, until it succeeds
//!   or the manager is closed.
//! - [`ConnectionManager::report`] tears the handle down when an operation
//!   failed with a fatal connection error; the next caller reconnects.
//! - [`ConnectionManager::close`] releases the handle and stops reconnecting.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Knows how to open and close one kind of backend handle.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The shareable handle (a pool or a client).
    type Handle: Clone + Send + Sync + 'static;

    /// Backend name used in logs.
    fn name(&self) -> &'static str;

    /// Opens a new handle.
    async fn connect(&self) -> Result<Self::Handle>;

    /// Releases a handle.
    async fn disconnect(&self, handle: Self::Handle);
}

/// Process-wide handle holder for one backend.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    handle: Mutex<Option<C::Handle>>,
    reconnect_delay: Duration,
    closed: AtomicBool,
    connects: AtomicU64,
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a manager. No connection is opened until first use.
    pub fn new(connector: C, reconnect_delay: Duration) -> Self {
        Self {
            connector,
            handle: Mutex::new(None),
            reconnect_delay,
            closed: AtomicBool::new(false),
            connects: AtomicU64::new(0),
        }
    }

    /// Backend name.
    pub fn name(&self) -> &'static str {
        self.connector.name()
    }

    /// Eagerly establishes the connection.
    pub async fn open(&self) -> Result<()> {
        self.handle().await.map(|_| ())
    }

    /// Returns the live handle, connecting (and reconnecting) as needed.
    pub async fn handle(&self) -> Result<C::Handle> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let mut attempt: u64 = 0;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed(self.name().to_string()));
            }
            attempt += 1;
            match self.connector.connect().await {
                Ok(handle) => {
                    self.connects.fetch_add(1, Ordering::Relaxed);
                    info!(backend = self.name(), attempt, "connection established");
                    *slot = Some(handle.clone());
                    return Ok(handle);
                }
                Err(e) => {
                    error!(
                        backend = self.name(),
                        attempt,
                        "connection failed: {}; retrying in {:?}",
                        e,
                        self.reconnect_delay
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    /// Drops the current handle if `err` means it is unusable.
    pub async fn report(&self, err: &Error) {
        if err.is_fatal_connection() {
            warn!(backend = self.name(), "fatal connection error, resetting: {}", err);
            self.invalidate().await;
        }
    }

    /// Tears down the current handle; the next [`handle`](Self::handle) reconnects.
    pub async fn invalidate(&self) {
        let taken = self.handle.lock().await.take();
        if let Some(handle) = taken {
            self.connector.disconnect(handle).await;
        }
    }

    /// Whether a handle is currently held.
    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Number of successful connects over the manager's lifetime.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Closes the handle and refuses further connects.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.invalidate().await;
        info!(backend = self.name(), "connection manager closed");
    }

    /// Runs `op` with the live handle and reports fatal errors back.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(C::Handle) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let handle = self.handle().await?;
        let result = op(handle).await;
        if let Err(e) = &result {
            self.report(e).await;
        }
        result
    }
}
