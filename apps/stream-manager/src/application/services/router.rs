//! Compatibility Router
//!
//! Serves the `StreamManager` contract from whichever backend is active
//! and switches between them at runtime without a deploy.
//!
//! The router remembers every subscription it issued. A switch builds the
//! new backend, swaps it in, destroys the old one and re-attaches every
//! live subscription to the new backend, so callers keep their handles
//! across the handover. Subscriptions whose handler failed (and was
//! therefore detached by the backend) stay detached. Switching to the
//! backend that is already active is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::task::TaskTracker;

use super::legacy::LegacyStreamService;
use super::manager::ConnectionManager;
use crate::application::ports::{
    Backend, ManagerError, StreamInfo, StreamManager, Subscription,
};
use crate::domain::stream::{MessageHandler, StreamMessage, StreamName, SubscriptionId};
use crate::infrastructure::config::ManagerConfig;
use crate::infrastructure::metrics::MetricsSnapshot;

/// Builds a fresh backend instance.
pub type BackendFactory =
    Box<dyn Fn() -> Result<Arc<dyn StreamManager>, ManagerError> + Send + Sync>;

/// Metrics tagged with the backend that produced them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Backend that served the snapshot.
    pub implementation: Backend,
    /// The backend's counters.
    pub metrics: MetricsSnapshot,
}

struct Active {
    backend: Backend,
    manager: Arc<dyn StreamManager>,
}

/// A subscription issued by the router, re-attachable to another backend.
struct Routed {
    stream: StreamName,
    handler: MessageHandler,
    failed: Arc<AtomicBool>,
    inner: Option<Subscription>,
}

/// Sets the flag if the handler panics.
struct PanicMark<'a>(&'a AtomicBool);

impl Drop for PanicMark<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

/// Wrap `handler` so an error or panic is remembered in `failed`.
fn tracked(handler: MessageHandler, failed: Arc<AtomicBool>) -> MessageHandler {
    Arc::new(move |message: &StreamMessage| {
        let mark = PanicMark(&failed);
        let result = handler(message);
        drop(mark);
        if result.is_err() {
            failed.store(true, Ordering::Release);
        }
        result
    })
}

type RoutedTable = Mutex<HashMap<SubscriptionId, Routed>>;

/// Runtime-switchable front for the manager and legacy backends.
pub struct CompatibilityRouter {
    active: RwLock<Active>,
    manager_factory: BackendFactory,
    legacy_factory: BackendFactory,
    routed: Arc<RoutedTable>,
    switch_lock: Mutex<()>,
    destroyed: AtomicBool,
    tracker: TaskTracker,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for CompatibilityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatibilityRouter")
            .field("backend", &self.active_backend())
            .field("subscriptions", &self.routed.lock().len())
            .finish_non_exhaustive()
    }
}

impl CompatibilityRouter {
    /// Create a router with `initial` active.
    ///
    /// # Errors
    ///
    /// Returns the factory's error if the initial backend cannot be built,
    /// or `ManagerError::NoRuntime` outside a Tokio runtime.
    pub fn new(
        initial: Backend,
        manager_factory: BackendFactory,
        legacy_factory: BackendFactory,
    ) -> Result<Self, ManagerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        let manager = match initial {
            Backend::Manager => manager_factory()?,
            Backend::Legacy => legacy_factory()?,
        };
        tracing::info!(backend = initial.as_str(), "Compatibility router started");

        Ok(Self {
            active: RwLock::new(Active {
                backend: initial,
                manager,
            }),
            manager_factory,
            legacy_factory,
            routed: Arc::new(Mutex::new(HashMap::new())),
            switch_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            runtime,
        })
    }

    /// Create a router whose backends use real WebSocket connections.
    ///
    /// # Errors
    ///
    /// Same as `new`.
    pub fn with_websocket(config: &ManagerConfig, initial: Backend) -> Result<Self, ManagerError> {
        let manager_config = config.clone();
        let legacy_config = config.clone();
        Self::new(
            initial,
            Box::new(move || {
                Ok(Arc::new(ConnectionManager::with_websocket(manager_config.clone())?)
                    as Arc<dyn StreamManager>)
            }),
            Box::new(move || {
                Ok(Arc::new(LegacyStreamService::with_websocket(legacy_config.clone())?)
                    as Arc<dyn StreamManager>)
            }),
        )
    }

    /// Backend currently serving calls.
    #[must_use]
    pub fn active_backend(&self) -> Backend {
        self.active.read().backend
    }

    /// Switch to the per-stream manager.
    ///
    /// # Errors
    ///
    /// Returns the factory's error (the previous backend stays active), or
    /// `Destroyed` after `destroy`.
    pub fn enable_manager(&self) -> Result<(), ManagerError> {
        self.switch_to(Backend::Manager)
    }

    /// Switch to the legacy combined-stream service.
    ///
    /// # Errors
    ///
    /// Same as `enable_manager`.
    pub fn enable_legacy(&self) -> Result<(), ManagerError> {
        self.switch_to(Backend::Legacy)
    }

    /// Switch to `target`.
    ///
    /// # Errors
    ///
    /// Same as `enable_manager`.
    pub fn switch_to(&self, target: Backend) -> Result<(), ManagerError> {
        let _switch = self.switch_lock.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ManagerError::Destroyed);
        }
        if self.active_backend() == target {
            tracing::debug!(backend = target.as_str(), "Backend already active");
            return Ok(());
        }

        let next = match target {
            Backend::Manager => (self.manager_factory)()?,
            Backend::Legacy => (self.legacy_factory)()?,
        };

        let mut routed = self.routed.lock();
        let mut detached = Vec::with_capacity(routed.len());
        let mut migrated = 0usize;
        for (id, entry) in routed.iter_mut() {
            if entry.failed.load(Ordering::Acquire) {
                tracing::debug!(stream = %entry.stream, subscriber = %id, "Skipping failed subscription");
                detached.extend(entry.inner.take());
                continue;
            }
            let attached = match next.subscribe(entry.stream.as_str(), Arc::clone(&entry.handler)) {
                Ok(subscription) => {
                    migrated += 1;
                    Some(subscription)
                }
                Err(e) => {
                    tracing::warn!(
                        stream = %entry.stream,
                        subscriber = %id,
                        error = %e,
                        "Failed to migrate subscription"
                    );
                    None
                }
            };
            detached.extend(std::mem::replace(&mut entry.inner, attached));
        }

        let total = routed.len();
        let previous = std::mem::replace(
            &mut *self.active.write(),
            Active {
                backend: target,
                manager: Arc::clone(&next),
            },
        );
        // Handlers may own router subscriptions, so nothing is dropped or
        // destroyed while the table is locked.
        drop(routed);
        // Destroy before dropping the old handles so they release nothing.
        self.retire(&previous.manager);
        drop(detached);

        tracing::info!(
            from = previous.backend.as_str(),
            to = target.as_str(),
            migrated,
            total,
            "Switched stream backend"
        );
        Ok(())
    }

    /// Active backend's metrics, tagged with the backend name.
    #[must_use]
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let active = self.active.read();
        PerformanceMetrics {
            implementation: active.backend,
            metrics: active.manager.metrics(),
        }
    }

    fn current(&self) -> Arc<dyn StreamManager> {
        Arc::clone(&self.active.read().manager)
    }

    /// Destroy a backend and let the router's tracker wait for its tasks.
    fn retire(&self, manager: &Arc<dyn StreamManager>) {
        manager.destroy();
        let tracker = manager.tracker();
        tracker.close();
        self.tracker
            .spawn_on(async move { tracker.wait().await }, &self.runtime);
    }
}

impl StreamManager for CompatibilityRouter {
    fn subscribe(
        &self,
        stream: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, ManagerError> {
        let failed = Arc::new(AtomicBool::new(false));
        let handler = tracked(handler, Arc::clone(&failed));
        let mut routed = self.routed.lock();
        let inner = self.current().subscribe(stream, Arc::clone(&handler))?;
        let stream = inner.stream().clone();
        let id = SubscriptionId::new();
        routed.insert(
            id,
            Routed {
                stream: stream.clone(),
                handler,
                failed,
                inner: Some(inner),
            },
        );
        drop(routed);

        let table = Arc::downgrade(&self.routed);
        Ok(Subscription::new(id, stream, move || {
            if let Some(table) = table.upgrade() {
                let removed = table.lock().remove(&id);
                drop(removed);
            }
        }))
    }

    fn status(&self) -> bool {
        self.current().status()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.current().metrics()
    }

    fn prometheus_metrics(&self) -> String {
        self.current().prometheus_metrics()
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.current().streams()
    }

    fn destroy(&self) {
        let _switch = self.switch_lock.lock();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let active = self.current();
        self.retire(&active);
        let drained: Vec<_> = self.routed.lock().drain().collect();
        drop(drained);
        tracing::info!("Compatibility router destroyed");
    }

    fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    fn backend(&self) -> Backend {
        self.active_backend()
    }
}

// =============================================================================
// Tests
// =============================================================================
