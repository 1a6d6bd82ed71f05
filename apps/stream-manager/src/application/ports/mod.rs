//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: opens one physical socket for a URL
//! - `TransportSocket`: reads frames from, and closes, that socket
//!
//! ## Driver Ports (Inbound)
//!
//! - `StreamManager`: the contract every backend satisfies and every
//!   consumer (UI hooks, HTTP adapter, router) talks to

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::task::TaskTracker;

use crate::domain::stream::{
    ConnectionState, HandlerError, InvalidStreamName, MessageHandler, StreamMessage, StreamName,
    SubscriptionId,
};
use crate::infrastructure::config::ConfigError;
use crate::infrastructure::metrics::{MetricsSnapshot, record_messages_dropped};

// =============================================================================
// Transport Port
// =============================================================================

/// A frame read from a physical socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text frame (expected to carry one JSON document).
    Text(String),
    /// Binary frame (not part of the upstream protocol).
    Binary(Vec<u8>),
    /// Ping/pong or other control traffic; proves the socket is alive.
    Control,
}

/// Transient socket failure. Always retried, never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Socket error after the handshake.
    #[error("socket error: {0}")]
    Socket(String),
    /// Peer closed the socket or the stream ended.
    #[error("connection closed by peer")]
    Closed,
    /// Handshake did not finish in time.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    /// No frame received within the idle window.
    #[error("no frames received for {0:?}")]
    Idle(Duration),
}

/// Opens physical sockets.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform the handshake for `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSocket>, TransportError>;
}

/// An open physical socket, exclusively owned by one connection task.
#[async_trait]
pub trait TransportSocket: Send {
    /// Read the next frame. `None` means the stream ended.
    async fn next_frame(&mut self) -> Option<Result<Inbound, TransportError>>;

    /// Close the socket, best effort.
    async fn close(&mut self);
}

// =============================================================================
// Errors
// =============================================================================

/// Categorizes errors for caller decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid stream name or configuration; never retried.
    FatalConfiguration,
    /// Stream is cooling down after exhausting its retries; try again later.
    CircuitOpen,
    /// The backend has been destroyed.
    Destroyed,
}

/// Errors returned synchronously from `subscribe`.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Stream name rejected.
    #[error("invalid stream name: {0}")]
    InvalidStreamName(#[from] InvalidStreamName),

    /// Configuration rejected (e.g. invalid base URL).
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    /// Stream exceeded its retry ceiling and is cooling down.
    #[error("stream {stream} is temporarily unavailable (circuit open, retry in {retry_in:?})")]
    CircuitOpen {
        /// Affected stream.
        stream: StreamName,
        /// Remaining cool-down.
        retry_in: Duration,
    },

    /// Backend was destroyed; no new subscriptions are accepted.
    #[error("stream manager has been destroyed")]
    Destroyed,

    /// Constructed outside a Tokio runtime.
    #[error("stream manager requires a Tokio runtime")]
    NoRuntime,
}

impl ManagerError {
    /// Get the kind of this error for decision-making.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStreamName(_) | Self::Configuration(_) | Self::NoRuntime => {
                ErrorKind::FatalConfiguration
            }
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Destroyed => ErrorKind::Destroyed,
        }
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

type Release = Box<dyn FnOnce() + Send>;

/// Handle returned by `subscribe`.
///
/// `unsubscribe` is idempotent. Dropping the handle unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    stream: StreamName,
    release: Mutex<Option<Release>>,
}

impl Subscription {
    /// Create a handle whose first `unsubscribe` runs `release`.
    pub fn new(
        id: SubscriptionId,
        stream: StreamName,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            stream,
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Subscription identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stream this subscription is attached to.
    #[must_use]
    pub const fn stream(&self) -> &StreamName {
        &self.stream
    }

    /// Whether `unsubscribe` has not been called yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }

    /// Detach from the stream. Subsequent calls are no-ops.
    pub fn unsubscribe(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Manager Contract
// =============================================================================

/// Which implementation serves the manager contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Per-stream connection manager.
    Manager,
    /// Legacy single-socket service.
    Legacy,
}

impl Backend {
    /// Parse a backend name; unknown names return `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "manager" => Some(Self::Manager),
            "legacy" => Some(Self::Legacy),
            _ => None,
        }
    }

    /// Get the backend name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Legacy => "legacy",
        }
    }
}

/// Point-in-time view of one registered stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// Stream name.
    pub stream: StreamName,
    /// Connection state.
    pub state: ConnectionState,
    /// Attached subscribers.
    pub subscriber_count: usize,
    /// Times the connection entered `RECONNECTING`.
    pub retry_count: u64,
    /// Last time the connection entered `RECONNECTING`.
    pub last_retry_time: Option<DateTime<Utc>>,
    /// When the connection was created.
    pub created_at: DateTime<Utc>,
    /// Whether the connection is in its circuit-open cool-down.
    pub circuit_open: bool,
}

/// The contract shared by every backend.
///
/// `subscribe` never blocks on network I/O: it only updates in-memory
/// state and triggers connection work on background tasks.
#[cfg_attr(test, mockall::automock)]
pub trait StreamManager: Send + Sync {
    /// Attach `handler` to `stream`, opening a connection if needed.
    ///
    /// # Errors
    ///
    /// `FatalConfiguration` errors for invalid names, `CircuitOpen` while
    /// the stream cools down, `Destroyed` after `destroy`.
    fn subscribe(&self, stream: &str, handler: MessageHandler)
    -> Result<Subscription, ManagerError>;

    /// True if at least one connection is `OPEN`.
    fn status(&self) -> bool;

    /// Snapshot of the backend's counters.
    fn metrics(&self) -> MetricsSnapshot;

    /// Counters in Prometheus text exposition format.
    fn prometheus_metrics(&self) -> String {
        self.metrics().to_prometheus()
    }

    /// All registered streams.
    fn streams(&self) -> Vec<StreamInfo>;

    /// Tear down every connection; idempotent.
    fn destroy(&self);

    /// Tracker owning every task the backend spawned.
    fn tracker(&self) -> TaskTracker;

    /// Which implementation this is.
    fn backend(&self) -> Backend;

    /// Subscribe with a bounded channel instead of a callback.
    ///
    /// Messages are dropped (and counted) while the channel is full; once
    /// the receiver is dropped the subscription's handler is detached.
    ///
    /// # Errors
    ///
    /// Same as `subscribe`.
    fn subscribe_channel(
        &self,
        stream: &str,
        capacity: usize,
    ) -> Result<(Subscription, mpsc::Receiver<StreamMessage>), ManagerError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handler: MessageHandler =
            std::sync::Arc::new(move |message: &StreamMessage| match tx.try_send(message.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    record_messages_dropped(1);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(HandlerError::new("receiver dropped")),
            });
        let subscription = self.subscribe(stream, handler)?;
        Ok((subscription, rx))
    }
}

/// Destroy `manager` and wait for every task it spawned to finish.
pub async fn shutdown(manager: &dyn StreamManager) {
    manager.destroy();
    let tracker = manager.tracker();
    tracker.close();
    tracker.wait().await;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counted_subscription(counter: &Arc<AtomicUsize>) -> Subscription {
        let counter = Arc::clone(counter);
        Subscription::new(
            SubscriptionId::new(),
            StreamName::parse("btcusdt@trade").unwrap(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let released = Arc::new(AtomicUsize::new(0));
        let subscription = counted_subscription(&released);

        assert!(subscription.is_active());
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        drop(subscription);

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_unsubscribes() {
        let released = Arc::new(AtomicUsize::new(0));
        drop(counted_subscription(&released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            ManagerError::from(InvalidStreamName::Empty).kind(),
            ErrorKind::FatalConfiguration
        );
        assert_eq!(ManagerError::Destroyed.kind(), ErrorKind::Destroyed);
        assert_eq!(
            ManagerError::CircuitOpen {
                stream: StreamName::parse("x@trade").unwrap(),
                retry_in: Duration::from_secs(1),
            }
            .kind(),
            ErrorKind::CircuitOpen
        );
    }

    #[test]
    fn backend_parsing() {
        assert_eq!(Backend::parse("manager"), Some(Backend::Manager));
        assert_eq!(Backend::parse(" LEGACY "), Some(Backend::Legacy));
        assert_eq!(Backend::parse("other"), None);
        assert_eq!(Backend::Legacy.as_str(), "legacy");
    }
}
