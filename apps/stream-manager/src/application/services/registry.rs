//! Stream Registry
//!
//! Single authoritative table of connections keyed by stream name. The
//! registry owns ref-counting, creation and teardown scheduling; nothing
//! else creates or cancels a connection.
//!
//! All table mutations happen under one short `parking_lot` lock that is
//! never held across an await point. Creation inside the lock is what makes
//! "first caller creates, second caller attaches" hold: the second caller
//! always finds the first caller's entry. Network work happens on the
//! spawned connection task, so `subscribe` and `unsubscribe` never block
//! on I/O.
//!
//! Each entry carries a generation number. A deferred teardown (grace
//! period) or a late unsubscribe from a previous cycle only acts on the
//! entry it was issued for, never on a fresh connection that reused the
//! stream name.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use super::connection::{Connection, ConnectionStatus, ConnectionTimeouts, HandlerSet};
use crate::application::ports::{ManagerError, StreamInfo, Subscription, Transport};
use crate::domain::backoff::{BackoffPolicy, BackoffState};
use crate::domain::stream::{
    ConnectionState, MessageHandler, StreamName, SubscriptionId,
};
use crate::infrastructure::config::{ManagerConfig, stream_url};
use crate::infrastructure::metrics::MetricsCollector;

/// One registered stream.
struct StreamEntry {
    generation: u64,
    subscriber_count: usize,
    handlers: Arc<HandlerSet>,
    status: Arc<ConnectionStatus>,
    cancel: CancellationToken,
    pending_teardown: Option<CancellationToken>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<StreamName, StreamEntry>,
    destroyed: bool,
    next_generation: u64,
}

struct RegistryInner {
    base_url: Url,
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    runtime: tokio::runtime::Handle,
    state: Mutex<RegistryState>,
}

/// Maps stream names to connections and ref-counts their subscribers.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("base_url", &self.inner.base_url.as_str())
            .field("streams", &self.inner.state.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl StreamRegistry {
    /// Create an empty registry. Connection tasks are spawned on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Configuration` if `config` is invalid.
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsCollector>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let base_url = config.stream_base()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                base_url,
                config,
                transport,
                metrics,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                runtime,
                state: Mutex::new(RegistryState::default()),
            }),
        })
    }

    /// Attach `handler` to `stream`, creating its connection if this is the
    /// first subscriber.
    ///
    /// # Errors
    ///
    /// `InvalidStreamName` for an empty or malformed name, `CircuitOpen`
    /// while the stream's connection is cooling down, `Destroyed` once the
    /// registry has been destroyed.
    pub fn subscribe(
        &self,
        stream: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, ManagerError> {
        let stream = StreamName::parse(stream)?;
        let url = stream_url(&self.inner.base_url, stream.as_str())?;
        let id = SubscriptionId::new();

        let generation = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(ManagerError::Destroyed);
            }
            let generation = state.next_generation;

            let entry = match state.entries.entry(stream.clone()) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    if let Some(retry_in) = entry.status.circuit_retry_in() {
                        return Err(ManagerError::CircuitOpen {
                            stream,
                            retry_in,
                        });
                    }
                    if let Some(pending) = entry.pending_teardown.take() {
                        pending.cancel();
                        tracing::debug!(stream = %stream, "Resubscribed within grace period");
                    }
                    entry
                }
                Entry::Vacant(vacant) => {
                    let entry = vacant.insert(self.inner.spawn_connection(&stream, url, generation));
                    tracing::info!(stream = %stream, generation, "Stream created");
                    entry
                }
            };

            entry.handlers.attach(id, handler);
            entry.subscriber_count += 1;
            let entry_generation = entry.generation;
            if entry_generation == generation {
                state.next_generation += 1;
            }
            entry_generation
        };

        let registry = Arc::downgrade(&self.inner);
        let released = stream.clone();
        Ok(Subscription::new(id, stream, move || {
            if let Some(inner) = registry.upgrade() {
                RegistryInner::release(&inner, &released, generation, id);
            }
        }))
    }

    /// True if at least one connection is `OPEN`.
    #[must_use]
    pub fn status(&self) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .any(|entry| entry.status.state() == ConnectionState::Open)
    }

    /// Snapshot of every registered stream, sorted by name.
    #[must_use]
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<_> = self
            .inner
            .state
            .lock()
            .entries
            .iter()
            .map(|(name, entry)| entry.status.info(name.clone(), entry.subscriber_count))
            .collect();
        streams.sort_by(|a, b| a.stream.cmp(&b.stream));
        streams
    }

    /// Status handle of the live connection for `stream`, if any.
    #[must_use]
    pub fn connection_status(&self, stream: &str) -> Option<Arc<ConnectionStatus>> {
        let stream = StreamName::parse(stream).ok()?;
        self.inner
            .state
            .lock()
            .entries
            .get(&stream)
            .map(|entry| Arc::clone(&entry.status))
    }

    /// Subscriber count for `stream` (0 if not registered).
    #[must_use]
    pub fn subscriber_count(&self, stream: &str) -> usize {
        StreamName::parse(stream).map_or(0, |stream| {
            self.inner
                .state
                .lock()
                .entries
                .get(&stream)
                .map_or(0, |entry| entry.subscriber_count)
        })
    }

    /// Tear down every connection regardless of subscriber count and
    /// refuse further subscriptions. Idempotent.
    pub fn destroy(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.entries.drain().collect()
        };

        tracing::info!(streams = drained.len(), "Destroying stream registry");
        for (stream, entry) in drained {
            self.inner.teardown(&stream, &entry);
        }
        self.inner.shutdown.cancel();
    }

    /// Whether `destroy` has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Tracker owning every connection and grace-timer task.
    #[must_use]
    pub fn tracker(&self) -> TaskTracker {
        self.inner.tracker.clone()
    }

    /// Counters shared by every connection of this registry.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }
}

impl RegistryInner {
    /// Build the entry and spawn its connection task. Called with the state
    /// lock held; only spawns, never awaits.
    fn spawn_connection(&self, stream: &StreamName, url: Url, generation: u64) -> StreamEntry {
        let handlers = Arc::new(HandlerSet::new(stream.clone(), Arc::clone(&self.metrics)));
        let status = Arc::new(ConnectionStatus::new());
        let cancel = self.shutdown.child_token();

        let connection = Connection::new(
            stream.as_str(),
            url,
            Arc::clone(&self.transport),
            handlers.clone(),
            Arc::clone(&status),
            BackoffState::new(BackoffPolicy::new(self.config.backoff.clone())),
            Arc::clone(&self.metrics),
            cancel.clone(),
            ConnectionTimeouts {
                connect: self.config.connect_timeout,
                idle: self.config.idle_timeout,
            },
        );
        self.tracker.spawn_on(connection.run(), &self.runtime);
        self.metrics.record_connection_opened();

        StreamEntry {
            generation,
            subscriber_count: 0,
            handlers,
            status,
            cancel,
            pending_teardown: None,
        }
    }

    fn teardown(&self, stream: &StreamName, entry: &StreamEntry) {
        if let Some(pending) = &entry.pending_teardown {
            pending.cancel();
        }
        entry.cancel.cancel();
        self.metrics.record_connection_closed();
        tracing::info!(stream = %stream, generation = entry.generation, "Stream torn down");
    }

    /// Release one subscription. Runs at most once per subscription.
    fn release(inner: &Arc<Self>, stream: &StreamName, generation: u64, id: SubscriptionId) {
        let mut state = inner.state.lock();
        let Some(entry) = state.entries.get_mut(stream) else {
            return;
        };
        if entry.generation != generation {
            return;
        }

        // Dropped only after the lock is released: the handler may own
        // another subscription whose release takes this lock.
        let detached = entry.handlers.detach(id);
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        if entry.subscriber_count > 0 {
            drop(state);
            drop(detached);
            return;
        }

        let grace = inner.config.cleanup_grace;
        if grace.is_zero() {
            let removed = state.entries.remove(stream);
            drop(state);
            drop(detached);
            if let Some(entry) = removed {
                inner.teardown(stream, &entry);
            }
            return;
        }

        let timer = inner.shutdown.child_token();
        entry.pending_teardown = Some(timer.clone());
        drop(state);
        drop(detached);

        tracing::debug!(
            stream = %stream,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Last subscriber left, scheduling teardown"
        );
        let weak = Arc::downgrade(inner);
        let stream = stream.clone();
        inner.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    () = timer.cancelled() => {}
                    () = tokio::time::sleep(grace) => expire(&weak, &stream, generation),
                }
            },
            &inner.runtime,
        );
    }
}

/// Grace period elapsed: tear down if still unused and still the same
/// connection.
fn expire(inner: &Weak<RegistryInner>, stream: &StreamName, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let removed = {
        let mut state = inner.state.lock();
        match state.entries.get(stream) {
            Some(entry) if entry.generation == generation && entry.subscriber_count == 0 => {
                state.entries.remove(stream)
            }
            _ => None,
        }
    };
    if let Some(entry) = removed {
        inner.teardown(stream, &entry);
    }
}

// =============================================================================
// Tests
// =============================================================================
