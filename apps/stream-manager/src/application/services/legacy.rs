//! Legacy Stream Service
//!
//! The pre-manager backend: one combined-stream socket carries every
//! subscribed stream (`{legacy_url}?streams=a/b/c`). Frames arrive as
//! `{"stream": "...", "data": {...}}` envelopes and are routed by name.
//!
//! Whenever the set of subscribed stream names changes the socket is
//! replaced with one for the new set. Every socket draws its epochs from
//! one counter, so a replacement shows up as an epoch change for the
//! streams that stayed subscribed. There is no circuit breaker and no
//! grace period.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use super::connection::{
    Connection, ConnectionStatus, ConnectionTimeouts, FrameSink, HandlerSet, ProtocolError,
};
use crate::application::ports::{
    Backend, ManagerError, StreamInfo, StreamManager, Subscription, Transport,
};
use crate::domain::backoff::{BackoffConfig, BackoffPolicy, BackoffState};
use crate::domain::stream::{
    ConnectionState, MessageHandler, StreamMessage, StreamName, SubscriptionId,
};
use crate::infrastructure::config::ManagerConfig;
use crate::infrastructure::metrics::{MetricsCollector, MetricsSnapshot};
use crate::infrastructure::websocket::WebSocketTransport;

#[derive(Deserialize)]
struct Envelope {
    stream: String,
    data: serde_json::Value,
}

/// Routes combined-stream envelopes to per-stream handler sets.
struct EnvelopeRouter {
    streams: RwLock<HashMap<StreamName, Arc<HandlerSet>>>,
    metrics: Arc<MetricsCollector>,
}

impl FrameSink for EnvelopeRouter {
    fn on_text(&self, text: &str, epoch: u64) -> Result<(), ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
            if e.is_data() {
                ProtocolError::Envelope(e.to_string())
            } else {
                ProtocolError::Malformed(e.to_string())
            }
        })?;

        let Ok(stream) = StreamName::parse(&envelope.stream) else {
            return Err(ProtocolError::Envelope(format!(
                "invalid stream name {:?}",
                envelope.stream
            )));
        };
        let Some(handlers) = self.streams.read().get(&stream).cloned() else {
            tracing::trace!(stream = %stream, "Dropping message for unsubscribed stream");
            return Ok(());
        };

        self.metrics.record_message();
        handlers.dispatch(&StreamMessage {
            stream,
            epoch,
            payload: Arc::new(envelope.data),
        });
        Ok(())
    }
}

struct Socket {
    cancel: CancellationToken,
    status: Arc<ConnectionStatus>,
}

#[derive(Default)]
struct LegacyState {
    subscribers: BTreeMap<StreamName, usize>,
    socket: Option<Socket>,
    cycle: u64,
    destroyed: bool,
}

struct LegacyInner {
    endpoint: Url,
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    router: Arc<EnvelopeRouter>,
    epochs: Arc<AtomicU64>,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    runtime: tokio::runtime::Handle,
    state: Mutex<LegacyState>,
}

/// Single combined-stream socket shared by every subscription.
#[derive(Clone)]
pub struct LegacyStreamService {
    inner: Arc<LegacyInner>,
}

impl std::fmt::Debug for LegacyStreamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyStreamService")
            .field("endpoint", &self.inner.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl LegacyStreamService {
    /// Create the service on the current Tokio runtime. No socket is
    /// opened until the first subscription.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Configuration` if `config` is invalid, or
    /// `ManagerError::NoRuntime` outside a Tokio runtime.
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        config.validate()?;
        let endpoint = config.legacy_endpoint()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        let metrics = Arc::new(MetricsCollector::new());

        Ok(Self {
            inner: Arc::new(LegacyInner {
                endpoint,
                config,
                transport,
                router: Arc::new(EnvelopeRouter {
                    streams: RwLock::new(HashMap::new()),
                    metrics: Arc::clone(&metrics),
                }),
                epochs: Arc::new(AtomicU64::new(0)),
                metrics,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                runtime,
                state: Mutex::new(LegacyState::default()),
            }),
        })
    }

    /// Create the service backed by a real WebSocket connection.
    ///
    /// # Errors
    ///
    /// Same as `new`.
    pub fn with_websocket(config: ManagerConfig) -> Result<Self, ManagerError> {
        Self::new(config, Arc::new(WebSocketTransport::new()))
    }

    /// Close the socket and drop every subscription. The service stays
    /// usable; outstanding handles become no-ops.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        let retired = self.inner.disconnect_locked(&mut state);
        drop(state);
        drop(retired);
    }

    /// URL of the current socket, if one is open.
    #[must_use]
    pub fn current_url(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state.socket.as_ref()?;
        Some(self.inner.combined_url(&state.subscribers))
    }
}

impl LegacyInner {
    fn combined_url(&self, subscribers: &BTreeMap<StreamName, usize>) -> String {
        let names: Vec<_> = subscribers.keys().map(StreamName::as_str).collect();
        let mut url = self.endpoint.clone();
        url.set_query(Some(&format!("streams={}", names.join("/"))));
        url.into()
    }

    /// Replace the socket with one for the current stream set.
    fn respawn_locked(&self, state: &mut LegacyState) {
        self.close_socket_locked(state);
        if state.subscribers.is_empty() {
            return;
        }

        let url = self.combined_url(&state.subscribers);
        let status = Arc::new(ConnectionStatus::with_epoch_counter(Arc::clone(&self.epochs)));
        let cancel = self.shutdown.child_token();
        let connection = Connection::new(
            "combined",
            url.clone(),
            Arc::clone(&self.transport),
            self.router.clone(),
            Arc::clone(&status),
            BackoffState::new(BackoffPolicy::new(BackoffConfig {
                max_retries: None,
                ..self.config.backoff.clone()
            })),
            Arc::clone(&self.metrics),
            cancel.clone(),
            ConnectionTimeouts {
                connect: self.config.connect_timeout,
                idle: self.config.idle_timeout,
            },
        );
        self.tracker.spawn_on(connection.run(), &self.runtime);
        self.metrics.record_connection_opened();
        tracing::info!(url = %url, streams = state.subscribers.len(), "Combined socket started");

        state.socket = Some(Socket { cancel, status });
    }

    fn close_socket_locked(&self, state: &mut LegacyState) {
        if let Some(socket) = state.socket.take() {
            socket.cancel.cancel();
            self.metrics.record_connection_closed();
        }
    }

    /// Returns the removed handler sets; drop them after the state lock.
    #[must_use]
    fn disconnect_locked(&self, state: &mut LegacyState) -> HashMap<StreamName, Arc<HandlerSet>> {
        self.close_socket_locked(state);
        state.subscribers.clear();
        state.cycle += 1;
        let retired = std::mem::take(&mut *self.router.streams.write());
        tracing::info!("Legacy stream service disconnected");
        retired
    }

    fn release(&self, stream: &StreamName, cycle: u64, id: SubscriptionId) {
        let mut state = self.state.lock();
        if state.cycle != cycle {
            return;
        }
        let Some(count) = state.subscribers.get_mut(stream) else {
            return;
        };

        // Handlers may own other subscriptions on this service; they are
        // dropped only after the state lock is released.
        let detached = self
            .router
            .streams
            .read()
            .get(stream)
            .and_then(|handlers| handlers.detach(id));
        *count = count.saturating_sub(1);
        if *count > 0 {
            drop(state);
            drop(detached);
            return;
        }

        state.subscribers.remove(stream);
        let removed = self.router.streams.write().remove(stream);
        self.respawn_locked(&mut state);
        drop(state);
        drop(detached);
        drop(removed);
    }
}

impl StreamManager for LegacyStreamService {
    fn subscribe(
        &self,
        stream: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, ManagerError> {
        let stream = StreamName::parse(stream)?;
        let id = SubscriptionId::new();

        let cycle = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(ManagerError::Destroyed);
            }

            let handlers = Arc::clone(
                self.inner
                    .router
                    .streams
                    .write()
                    .entry(stream.clone())
                    .or_insert_with(|| {
                        Arc::new(HandlerSet::new(stream.clone(), Arc::clone(&self.inner.metrics)))
                    }),
            );
            handlers.attach(id, handler);

            let count = state.subscribers.entry(stream.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.inner.respawn_locked(&mut state);
            }
            state.cycle
        };

        let inner = Arc::downgrade(&self.inner);
        let released = stream.clone();
        Ok(Subscription::new(id, stream, move || {
            if let Some(inner) = inner.upgrade() {
                inner.release(&released, cycle, id);
            }
        }))
    }

    fn status(&self) -> bool {
        self.inner
            .state
            .lock()
            .socket
            .as_ref()
            .is_some_and(|socket| socket.status.state() == ConnectionState::Open)
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn streams(&self) -> Vec<StreamInfo> {
        let state = self.inner.state.lock();
        let Some(socket) = &state.socket else {
            return Vec::new();
        };
        state
            .subscribers
            .iter()
            .map(|(name, count)| socket.status.info(name.clone(), *count))
            .collect()
    }

    fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        let retired = self.inner.disconnect_locked(&mut state);
        drop(state);
        drop(retired);
        self.inner.shutdown.cancel();
    }

    fn tracker(&self) -> TaskTracker {
        self.inner.tracker.clone()
    }

    fn backend(&self) -> Backend {
        Backend::Legacy
    }
}
