//! # Connection Resilience Layer
//!
//! One logical broker connection per [`ConnectionHandle`], with bounded
//! retry on connect and automatic reconnection on unexpected shutdown.
//! A [`ConnectionPair`] owns the producer and consumer handles as a unit
//! so publish and consume paths stay independently diagnosable.
//!
//! State machine per handle:
//!
//! ```text
//! Connecting → Connected → (Blocked ⇄ Connected) → Reconnecting → Connected | TimedOut
//!                                                      Closed (deliberate only)
//! ```
//!
//! Connection events (shutdown, blocked, unblocked) are delivered through
//! an explicit [`ConnectionListener`] passed at construction rather than
//! hidden broker-library event dispatch.

use crate::config::BrokerConfig;
use crate::error::{BatchMqError, Result};
use lapin::{Connection, ConnectionProperties};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Grace period for closing the underlying socket on deliberate close
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Role of a logical connection; publish and consume traffic never share
/// a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Producer,
    Consumer,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Producer => write!(f, "producer"),
            ConnectionRole::Consumer => write!(f, "consumer"),
        }
    }
}

/// Observable state of a connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Initial connect loop in flight
    Connecting,
    Connected,
    /// Connected, but the broker signalled backpressure
    Blocked,
    /// Unexpected shutdown observed, connect loop in flight again
    Reconnecting,
    /// Retry bound exhausted; the handle is unusable for I/O
    TimedOut,
    /// Deliberately closed
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleState::Connecting => "connecting",
            HandleState::Connected => "connected",
            HandleState::Blocked => "blocked",
            HandleState::Reconnecting => "reconnecting",
            HandleState::TimedOut => "timed_out",
            HandleState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Callbacks invoked by the connection layer on connectivity events.
///
/// All methods default to no-ops; implement only what the host cares
/// about. Invocations are synchronous and must not block.
pub trait ConnectionListener: Send + Sync {
    fn on_shutdown(&self, _role: ConnectionRole, _reason: &str) {}
    fn on_blocked(&self, _role: ConnectionRole) {}
    fn on_unblocked(&self, _role: ConnectionRole) {}
}

/// Default listener that surfaces events as log records
pub struct LogConnectionListener;

impl ConnectionListener for LogConnectionListener {
    fn on_shutdown(&self, role: ConnectionRole, reason: &str) {
        warn!(role = %role, reason = %reason, "broker connection shut down");
    }

    fn on_blocked(&self, role: ConnectionRole) {
        warn!(role = %role, "broker signalled connection blocked");
    }

    fn on_unblocked(&self, role: ConnectionRole) {
        info!(role = %role, "broker signalled connection unblocked");
    }
}

struct HandleInner {
    role: ConnectionRole,
    config: BrokerConfig,
    listener: Arc<dyn ConnectionListener>,
    state_tx: watch::Sender<HandleState>,
    state_rx: watch::Receiver<HandleState>,
    /// At most one live underlying connection per handle
    connection: parking_lot::RwLock<Option<Arc<Connection>>>,
    retry_count: AtomicU32,
    /// Deliberate-close flag; suppresses auto-reconnect once set
    closing: AtomicBool,
    last_blocked: AtomicBool,
    /// Serializes reconnect loops when shutdown notifications race
    reconnect_guard: tokio::sync::Mutex<()>,
    runtime: tokio::runtime::Handle,
}

impl HandleInner {
    /// Transition the observable state. `Closed` is terminal: once a
    /// deliberate close has been recorded, no loop may overwrite it.
    fn set_state(&self, state: HandleState) {
        self.state_tx.send_if_modified(|current| {
            if *current == HandleState::Closed {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn run_connect_loop(inner: Arc<Self>) {
        inner.retry_count.store(0, Ordering::SeqCst);
        loop {
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }

            let name = format!("{}-{}", inner.config.connection_name, inner.role);
            let properties = ConnectionProperties::default().with_connection_name(name.into());
            match Connection::connect(&inner.config.url, properties).await {
                Ok(connection) => {
                    if inner.closing.load(Ordering::SeqCst) {
                        // Deliberate close raced the connect attempt
                        let _ = connection.close(200, "client shutdown").await;
                        return;
                    }
                    let connection = Arc::new(connection);
                    Self::install_shutdown_hook(&inner, &connection);
                    *inner.connection.write() = Some(connection);
                    inner.retry_count.store(0, Ordering::SeqCst);
                    inner.set_state(HandleState::Connected);
                    info!(
                        role = %inner.role,
                        url = %inner.config.url_redacted(),
                        "broker connection established"
                    );
                    return;
                }
                Err(e) => {
                    let attempts = inner.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempts >= inner.config.max_connect_retries {
                        inner.set_state(HandleState::TimedOut);
                        error!(
                            role = %inner.role,
                            attempts,
                            error = %e,
                            "broker connection retries exhausted; handle is unusable"
                        );
                        return;
                    }
                    warn!(
                        role = %inner.role,
                        attempt = attempts,
                        error = %e,
                        "broker connect failed; retrying"
                    );
                    tokio::time::sleep(inner.config.connect_backoff()).await;
                }
            }
        }
    }

    fn install_shutdown_hook(this: &Arc<Self>, connection: &Connection) {
        let weak = Arc::downgrade(this);
        let runtime = this.runtime.clone();
        connection.on_error(move |err| {
            let Some(inner) = weak.upgrade() else { return };
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }
            inner.listener.on_shutdown(inner.role, &err.to_string());
            runtime.spawn(async move {
                inner.reconnect().await;
            });
        });
    }

    async fn reconnect(self: Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        // A second shutdown notification while a reconnect loop is already
        // running must not start another one.
        let Ok(_guard) = self.reconnect_guard.try_lock() else {
            return;
        };
        warn!(role = %self.role, "broker connection lost; reconnecting");
        *self.connection.write() = None;
        self.set_state(HandleState::Reconnecting);
        Self::run_connect_loop(Arc::clone(&self)).await;
    }

    /// Reads the broker backpressure flag off the live connection and
    /// fires listener edges when it changes.
    fn observe_blocked(&self) -> bool {
        let blocked = self
            .connection
            .read()
            .as_ref()
            .map(|c| c.status().blocked())
            .unwrap_or(false);
        let was = self.last_blocked.swap(blocked, Ordering::Relaxed);
        if blocked != was {
            if blocked {
                self.listener.on_blocked(self.role);
            } else {
                self.listener.on_unblocked(self.role);
            }
        }
        blocked
    }
}

/// Owns exactly one logical broker connection for one role, recreating it
/// on unexpected shutdown.
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Start a handle and its asynchronous connect loop.
    ///
    /// Must be called from within a tokio runtime; the connect loop and
    /// any later reconnections are spawned onto it.
    pub fn connect(
        role: ConnectionRole,
        config: BrokerConfig,
        listener: Arc<dyn ConnectionListener>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(HandleState::Connecting);
        let inner = Arc::new(HandleInner {
            role,
            config,
            listener,
            state_tx,
            state_rx,
            connection: parking_lot::RwLock::new(None),
            retry_count: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            last_blocked: AtomicBool::new(false),
            reconnect_guard: tokio::sync::Mutex::new(()),
            runtime: tokio::runtime::Handle::current(),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            HandleInner::run_connect_loop(task_inner).await;
        });

        Self { inner }
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    /// Current handle state; `Blocked` is derived from the live broker
    /// backpressure flag.
    pub fn state(&self) -> HandleState {
        let state = *self.inner.state_rx.borrow();
        if state == HandleState::Connected && self.inner.observe_blocked() {
            return HandleState::Blocked;
        }
        state
    }

    /// False whenever a connect loop is in flight, regardless of socket
    /// state: connecting and connected are mutually exclusive for callers.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), HandleState::Connected | HandleState::Blocked)
    }

    /// Connect attempts made by the current connect loop
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// The live connection.
    ///
    /// Waits (bounded by the configured connect timeout) while a connect
    /// loop is in flight; fails with a no-connection error when the handle
    /// is timed out or closed, or the bound elapses.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        let deadline = tokio::time::Instant::now() + self.inner.config.connect_timeout();
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                HandleState::Connected | HandleState::Blocked => {
                    if let Some(connection) = self.inner.connection.read().clone() {
                        return Ok(connection);
                    }
                    // Connected state raced with a teardown; wait for the
                    // next transition.
                }
                HandleState::Connecting | HandleState::Reconnecting => {}
                HandleState::TimedOut | HandleState::Closed => {
                    return Err(BatchMqError::NoConnection {
                        role: self.inner.role,
                    });
                }
            }

            match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    return Err(BatchMqError::NoConnection {
                        role: self.inner.role,
                    });
                }
            }
        }
    }

    /// Deliberately close the handle. Idempotent; suppresses any further
    /// auto-reconnect and closes the socket within a short grace period.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.state_tx.send(HandleState::Closed);
        let connection = self.inner.connection.write().take();
        if let Some(connection) = connection {
            match tokio::time::timeout(CLOSE_GRACE, connection.close(200, "client shutdown")).await
            {
                Ok(Ok(())) => debug!(role = %self.inner.role, "broker connection closed"),
                Ok(Err(e)) => {
                    warn!(role = %self.inner.role, error = %e, "error closing broker connection");
                }
                Err(_) => {
                    warn!(role = %self.inner.role, "broker connection close grace period elapsed");
                }
            }
        }
    }
}

/// Producer and consumer connections under one lifecycle.
///
/// Connectivity flags are exposed per role, not combined: a wedged
/// publish path must stay distinguishable from a wedged consume path.
pub struct ConnectionPair {
    producer: ConnectionHandle,
    consumer: ConnectionHandle,
}

impl ConnectionPair {
    pub fn connect(config: BrokerConfig) -> Self {
        Self::with_listener(config, Arc::new(LogConnectionListener))
    }

    pub fn with_listener(config: BrokerConfig, listener: Arc<dyn ConnectionListener>) -> Self {
        Self {
            producer: ConnectionHandle::connect(
                ConnectionRole::Producer,
                config.clone(),
                Arc::clone(&listener),
            ),
            consumer: ConnectionHandle::connect(ConnectionRole::Consumer, config, listener),
        }
    }

    pub fn producer(&self) -> &ConnectionHandle {
        &self.producer
    }

    pub fn consumer(&self) -> &ConnectionHandle {
        &self.consumer
    }

    pub fn is_producer_connected(&self) -> bool {
        self.producer.is_connected()
    }

    pub fn is_consumer_connected(&self) -> bool {
        self.consumer.is_connected()
    }

    /// Close both handles
    pub async fn close(&self) {
        self.producer.close().await;
        self.consumer.close().await;
    }
}
