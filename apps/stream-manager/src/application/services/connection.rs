//! Connection State Machine
//!
//! One task per physical socket. The task is the only writer of its
//! `ConnectionStatus` and exclusively owns the socket.
//!
//! ```text
//! CONNECTING ──ok──► OPEN ──error/close/idle──► RECONNECTING ──delay──► CONNECTING
//!      │  └──error──────────────────────────────────┘  (circuit-open cool-down
//!      │                                                 when retries run out)
//!      └── cancel (any live state) ──► CLOSING ──► CLOSED
//! ```
//!
//! Inbound text frames are handed to a `FrameSink`, which decodes and
//! dispatches them synchronously inside the task, so per-socket delivery
//! order is the order frames were read.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Inbound, StreamInfo, Transport, TransportError, TransportSocket,
};
use crate::domain::backoff::{BackoffState, RetryDecision};
use crate::domain::stream::{
    ConnectionState, MessageHandler, StreamMessage, StreamName, SubscriptionId,
};
use crate::infrastructure::metrics::MetricsCollector;

/// Upper bound on the close handshake during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Errors
// =============================================================================

/// An inbound frame that could not be decoded. The frame is dropped and
/// the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Binary frames are not part of the upstream protocol.
    #[error("unexpected binary frame ({0} bytes)")]
    Binary(usize),
    /// Text frame is not valid JSON.
    #[error("malformed JSON: {0}")]
    Malformed(String),
    /// Combined-stream envelope missing `stream` or `data`.
    #[error("unexpected envelope: {0}")]
    Envelope(String),
}

// =============================================================================
// Connection Status
// =============================================================================

/// Observable state of one connection.
///
/// Written only by the connection task; read by the registry for
/// `status()`, `streams()` and circuit checks in `subscribe`.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: AtomicU8,
    retry_count: AtomicU64,
    epoch: Arc<AtomicU64>,
    last_retry_time: RwLock<Option<DateTime<Utc>>>,
    circuit_open_until: RwLock<Option<Instant>>,
    created_at: DateTime<Utc>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    /// Create status for a connection that is about to start connecting.
    #[must_use]
    pub fn new() -> Self {
        Self::with_epoch_counter(Arc::new(AtomicU64::new(0)))
    }

    /// Create status whose epochs continue from `counter`.
    ///
    /// Successive sockets serving the same subscribers share one counter so
    /// an epoch is never reused across socket replacements.
    #[must_use]
    pub fn with_epoch_counter(counter: Arc<AtomicU64>) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            retry_count: AtomicU64::new(0),
            epoch: counter,
            last_retry_time: RwLock::new(None),
            circuit_open_until: RwLock::new(None),
            created_at: Utc::now(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Times this connection entered `RECONNECTING`.
    #[must_use]
    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Last time this connection entered `RECONNECTING`.
    #[must_use]
    pub fn last_retry_time(&self) -> Option<DateTime<Utc>> {
        *self.last_retry_time.read()
    }

    /// Epoch of the most recent successful open.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// When the connection was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Remaining circuit-open cool-down, if the circuit is open.
    #[must_use]
    pub fn circuit_retry_in(&self) -> Option<Duration> {
        let until = (*self.circuit_open_until.read())?;
        Some(until.saturating_duration_since(Instant::now()))
    }

    /// Snapshot for `streams()`.
    #[must_use]
    pub fn info(&self, stream: StreamName, subscriber_count: usize) -> StreamInfo {
        StreamInfo {
            stream,
            state: self.state(),
            subscriber_count,
            retry_count: self.retry_count(),
            last_retry_time: self.last_retry_time(),
            created_at: self.created_at,
            circuit_open: self.circuit_open_until.read().is_some(),
        }
    }

    fn mark_open(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_state(ConnectionState::Open);
        epoch
    }

    fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
        *self.last_retry_time.write() = Some(Utc::now());
    }

    fn open_circuit(&self, cooldown: Duration) {
        *self.circuit_open_until.write() = Some(Instant::now() + cooldown);
    }

    fn close_circuit(&self) {
        *self.circuit_open_until.write() = None;
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Receives decoded text frames from a connection task.
pub trait FrameSink: Send + Sync {
    /// Decode `text` and deliver it to attached handlers.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the frame cannot be decoded.
    fn on_text(&self, text: &str, epoch: u64) -> Result<(), ProtocolError>;
}

type HandlerEntry = (SubscriptionId, MessageHandler);

/// Handlers attached to one stream.
///
/// Copy-on-write: dispatch clones an `Arc` of the current list, so handlers
/// can attach or detach (including from inside a handler) without blocking
/// delivery.
pub struct HandlerSet {
    stream: StreamName,
    handlers: RwLock<Arc<[HandlerEntry]>>,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("stream", &self.stream)
            .field("handlers", &self.len())
            .finish_non_exhaustive()
    }
}

impl HandlerSet {
    /// Create an empty set for `stream`.
    #[must_use]
    pub fn new(stream: StreamName, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            stream,
            handlers: RwLock::new(Arc::from(Vec::new())),
            metrics,
        }
    }

    /// Stream these handlers are attached to.
    #[must_use]
    pub const fn stream(&self) -> &StreamName {
        &self.stream
    }

    /// Attach a handler.
    pub fn attach(&self, id: SubscriptionId, handler: MessageHandler) {
        let mut handlers = self.handlers.write();
        let mut next = handlers.to_vec();
        next.push((id, handler));
        *handlers = Arc::from(next);
    }

    /// Detach a handler, returning it if it was attached.
    ///
    /// The returned handler may hold the last reference to a closure that
    /// owns other subscriptions; drop it only after releasing any lock that
    /// `unsubscribe` takes.
    #[must_use = "drop the detached handler outside of registry locks"]
    pub fn detach(&self, id: SubscriptionId) -> Option<MessageHandler> {
        let mut handlers = self.handlers.write();
        let detached = handlers
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, handler)| Arc::clone(handler))?;
        let next: Vec<_> = handlers
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        let previous = std::mem::replace(&mut *handlers, Arc::from(next));
        drop(handlers);
        drop(previous);
        Some(detached)
    }

    /// Number of attached handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handlers are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver `message` to every attached handler, in attach order.
    ///
    /// A handler that returns an error or panics is detached; delivery to
    /// the remaining handlers continues.
    pub fn dispatch(&self, message: &StreamMessage) {
        let handlers = Arc::clone(&self.handlers.read());
        for (id, handler) in handlers.iter() {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        stream = %self.stream,
                        subscriber = %id,
                        error = %e,
                        "Handler failed, detaching"
                    );
                    self.detach_failed(*id);
                }
                Err(panic) => {
                    tracing::error!(
                        stream = %self.stream,
                        subscriber = %id,
                        panic = panic_message(panic.as_ref()),
                        "Handler panicked, detaching"
                    );
                    self.detach_failed(*id);
                }
            }
        }
    }

    fn detach_failed(&self, id: SubscriptionId) {
        if let Some(handler) = self.detach(id) {
            self.metrics.record_handler_error();
            drop(handler);
        }
    }
}

impl FrameSink for HandlerSet {
    fn on_text(&self, text: &str, epoch: u64) -> Result<(), ProtocolError> {
        let payload: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.metrics.record_message();
        self.dispatch(&StreamMessage {
            stream: self.stream.clone(),
            epoch,
            payload: Arc::new(payload),
        });
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

// =============================================================================
// Connection Task
// =============================================================================

/// Everything a connection task needs; consumed by `run`.
pub struct Connection {
    label: String,
    url: String,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn FrameSink>,
    status: Arc<ConnectionStatus>,
    backoff: BackoffState,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
}

/// Timeouts for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    /// Upper bound on one handshake.
    pub connect: Duration,
    /// Reconnect when no frame arrives for this long.
    pub idle: Option<Duration>,
}

enum PumpExit {
    Cancelled,
    Failed(TransportError),
}

impl Connection {
    /// Assemble a connection task. Nothing happens until `run` is polled.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn FrameSink>,
        status: Arc<ConnectionStatus>,
        backoff: BackoffState,
        metrics: Arc<MetricsCollector>,
        cancel: CancellationToken,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            transport,
            sink,
            status,
            backoff,
            metrics,
            cancel,
            connect_timeout: timeouts.connect,
            idle_timeout: timeouts.idle,
        }
    }

    /// Drive the state machine until cancelled. Always ends in `CLOSED`.
    pub async fn run(mut self) {
        tracing::debug!(stream = %self.label, url = %self.url, "Connection task started");

        loop {
            self.status.set_state(ConnectionState::Connecting);

            let connect = tokio::time::timeout(self.connect_timeout, self.transport.connect(&self.url));
            let connected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = connect => result.unwrap_or(Err(TransportError::Timeout(self.connect_timeout))),
            };

            let error = match connected {
                Ok(mut socket) => {
                    let epoch = self.status.mark_open();
                    self.backoff.reset();
                    tracing::info!(stream = %self.label, epoch, "Connection open");

                    match self.pump(socket.as_mut(), epoch).await {
                        PumpExit::Cancelled => {
                            self.status.set_state(ConnectionState::Closing);
                            if tokio::time::timeout(CLOSE_TIMEOUT, socket.close()).await.is_err() {
                                tracing::debug!(stream = %self.label, "Close handshake timed out");
                            }
                            break;
                        }
                        PumpExit::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            tracing::warn!(stream = %self.label, error = %error, "Connection lost");
            if !self.wait_before_retry().await {
                break;
            }
        }

        self.status.set_state(ConnectionState::Closing);
        self.status.close_circuit();
        self.status.set_state(ConnectionState::Closed);
        tracing::info!(stream = %self.label, "Connection closed");
    }

    /// Read frames until the socket fails or the task is cancelled.
    async fn pump(&self, socket: &mut dyn TransportSocket, epoch: u64) -> PumpExit {
        loop {
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return PumpExit::Cancelled,
                frame = read_frame(socket, self.idle_timeout) => frame,
            };

            match frame {
                Ok(Inbound::Text(text)) => {
                    if let Err(e) = self.sink.on_text(&text, epoch) {
                        self.protocol_error(&e);
                    }
                }
                Ok(Inbound::Binary(data)) => self.protocol_error(&ProtocolError::Binary(data.len())),
                Ok(Inbound::Control) => {
                    tracing::trace!(stream = %self.label, "Control frame");
                }
                Err(e) => return PumpExit::Failed(e),
            }
        }
    }

    fn protocol_error(&self, error: &ProtocolError) {
        tracing::warn!(stream = %self.label, error = %error, "Dropping undecodable frame");
        self.metrics.record_protocol_error();
    }

    /// Enter `RECONNECTING` and wait out the backoff delay or circuit
    /// cool-down. Returns `false` if cancelled while waiting.
    async fn wait_before_retry(&mut self) -> bool {
        self.status.set_state(ConnectionState::Reconnecting);
        self.status.record_retry();
        self.metrics.record_retry();

        match self.backoff.next_decision() {
            RetryDecision::Retry { attempt, delay } => {
                tracing::info!(
                    stream = %self.label,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconnecting after delay"
                );
                self.sleep_or_cancel(delay).await
            }
            RetryDecision::CircuitOpen { cooldown } => {
                tracing::error!(
                    stream = %self.label,
                    cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
                    "Retry ceiling reached, circuit open"
                );
                self.status.open_circuit(cooldown);
                self.metrics.record_circuit_open();
                let resumed = self.sleep_or_cancel(cooldown).await;
                self.status.close_circuit();
                resumed
            }
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

async fn read_frame(
    socket: &mut dyn TransportSocket,
    idle_timeout: Option<Duration>,
) -> Result<Inbound, TransportError> {
    let next = match idle_timeout {
        Some(idle) => tokio::time::timeout(idle, socket.next_frame())
            .await
            .map_err(|_| TransportError::Idle(idle))?,
        None => socket.next_frame().await,
    };
    next.unwrap_or(Err(TransportError::Closed))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::domain::backoff::{BackoffConfig, BackoffPolicy};
    use crate::domain::stream::{HandlerError, handler};

    fn set() -> HandlerSet {
        HandlerSet::new(
            StreamName::parse("btcusdt@trade").unwrap(),
            Arc::new(MetricsCollector::new()),
        )
    }

    fn counting(count: &Arc<AtomicUsize>) -> MessageHandler {
        let count = Arc::clone(count);
        handler(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn dispatch_reaches_every_handler() {
        let set = set();
        let count = Arc::new(AtomicUsize::new(0));
        set.attach(SubscriptionId::new(), counting(&count));
        set.attach(SubscriptionId::new(), counting(&count));

        set.on_text(r#"{"p":"1.0"}"#, 1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_handler_is_detached_others_keep_receiving() {
        let set = set();
        let count = Arc::new(AtomicUsize::new(0));
        set.attach(
            SubscriptionId::new(),
            handler(|_| Err(HandlerError::new("boom"))),
        );
        set.attach(SubscriptionId::new(), counting(&count));

        set.on_text("{}", 1).unwrap();
        set.on_text("{}", 1).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(set.metrics.snapshot().handler_errors, 1);
    }

    #[test]
    fn panicking_handler_is_detached() {
        let set = set();
        let count = Arc::new(AtomicUsize::new(0));
        set.attach(SubscriptionId::new(), handler(|_| panic!("handler bug")));
        set.attach(SubscriptionId::new(), counting(&count));

        set.on_text("{}", 1).unwrap();
        set.on_text("{}", 1).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let set = set();
        assert!(matches!(
            set.on_text("not json", 1),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(set.metrics.snapshot().messages_received, 0);
    }

    #[test]
    fn detach_unknown_is_noop() {
        let set = set();
        assert!(set.detach(SubscriptionId::new()).is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn message_carries_epoch() {
        let set = set();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set.attach(
            SubscriptionId::new(),
            handler(move |m| {
                sink.lock().push(m.epoch);
                Ok(())
            }),
        );
        set.on_text("{}", 3).unwrap();
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn status_circuit_window() {
        let status = ConnectionStatus::new();
        assert_eq!(status.circuit_retry_in(), None);
        status.open_circuit(Duration::from_secs(30));
        assert!(status.circuit_retry_in().is_some());
        assert!(status.info(StreamName::parse("x").unwrap(), 0).circuit_open);
        status.close_circuit();
        assert_eq!(status.circuit_retry_in(), None);
    }

    // Scripted transport: each connect pops one script; a script is the list
    // of frames the socket yields before ending.
    struct Scripted {
        scripts: Mutex<VecDeque<Result<Vec<Inbound>, TransportError>>>,
        connects: AtomicUsize,
    }

    struct ScriptedSocket {
        frames: VecDeque<Inbound>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn connect(&self, _url: &str) -> Result<Box<dyn TransportSocket>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.scripts.lock().pop_front() {
                Some(Ok(frames)) => Ok(Box::new(ScriptedSocket {
                    frames: frames.into(),
                })),
                Some(Err(e)) => Err(e),
                None => Ok(Box::new(ScriptedSocket {
                    frames: VecDeque::new(),
                })),
            }
        }
    }

    #[async_trait]
    impl TransportSocket for ScriptedSocket {
        async fn next_frame(&mut self) -> Option<Result<Inbound, TransportError>> {
            match self.frames.pop_front() {
                Some(frame) => Some(Ok(frame)),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn connection(
        transport: Arc<Scripted>,
        sink: Arc<HandlerSet>,
        backoff: BackoffConfig,
        idle: Option<Duration>,
    ) -> (Connection, Arc<ConnectionStatus>, CancellationToken) {
        let status = Arc::new(ConnectionStatus::new());
        let cancel = CancellationToken::new();
        let conn = Connection::new(
            "btcusdt@trade",
            "ws://test/btcusdt@trade",
            transport,
            sink.clone(),
            Arc::clone(&status),
            BackoffState::new(BackoffPolicy::new(backoff)),
            Arc::clone(&sink.metrics),
            cancel.clone(),
            ConnectionTimeouts {
                connect: Duration::from_secs(1),
                idle,
            },
        );
        (conn, status, cancel)
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            factor: 1.0,
            jitter_ratio: 0.0,
            max_retries: None,
            circuit_cooldown: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_failure_retries_then_opens() {
        let transport = Arc::new(Scripted {
            scripts: Mutex::new(VecDeque::from([
                Err(TransportError::Handshake("refused".into())),
                Ok(vec![Inbound::Text("{}".into())]),
            ])),
            connects: AtomicUsize::new(0),
        });
        let sink = Arc::new(set());
        let (conn, status, cancel) = connection(transport.clone(), sink.clone(), fast_backoff(), None);
        let task = tokio::spawn(conn.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status.state(), ConnectionState::Open);
        assert_eq!(status.retry_count(), 1);
        assert_eq!(status.epoch(), 1);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(sink.metrics.snapshot().messages_received, 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(status.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_socket_reconnects() {
        let transport = Arc::new(Scripted {
            scripts: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
        });
        let (conn, status, cancel) = connection(
            transport.clone(),
            Arc::new(set()),
            fast_backoff(),
            Some(Duration::from_secs(5)),
        );
        let task = tokio::spawn(conn.run());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(transport.connects.load(Ordering::SeqCst) >= 2);
        assert!(status.epoch() >= 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_opens_circuit() {
        let failures = (0..10)
            .map(|_| Err(TransportError::Handshake("refused".into())))
            .collect();
        let transport = Arc::new(Scripted {
            scripts: Mutex::new(failures),
            connects: AtomicUsize::new(0),
        });
        let sink = Arc::new(set());
        let (conn, status, cancel) = connection(
            transport,
            sink.clone(),
            BackoffConfig {
                max_retries: Some(2),
                ..fast_backoff()
            },
            None,
        );
        let task = tokio::spawn(conn.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(status.circuit_retry_in().is_some());
        assert_eq!(status.state(), ConnectionState::Reconnecting);
        assert_eq!(sink.metrics.snapshot().circuit_opens, 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(status.state(), ConnectionState::Closed);
        assert_eq!(status.circuit_retry_in(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn binary_frames_are_dropped_not_fatal() {
        let transport = Arc::new(Scripted {
            scripts: Mutex::new(VecDeque::from([Ok(vec![
                Inbound::Binary(vec![1, 2, 3]),
                Inbound::Text("{}".into()),
            ])])),
            connects: AtomicUsize::new(0),
        });
        let sink = Arc::new(set());
        let (conn, status, cancel) = connection(transport.clone(), sink.clone(), fast_backoff(), None);
        let task = tokio::spawn(conn.run());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(status.state(), ConnectionState::Open);
        let snapshot = sink.metrics.snapshot();
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
