//! Connection Manager
//!
//! The per-stream backend: a thin façade over `StreamRegistry` and its
//! `MetricsCollector`. Constructed explicitly and passed to consumers;
//! there is no process-wide instance.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use super::connection::ConnectionStatus;
use super::registry::StreamRegistry;
use crate::application::ports::{
    Backend, ManagerError, StreamInfo, StreamManager, Subscription, Transport,
};
use crate::domain::stream::MessageHandler;
use crate::infrastructure::config::ManagerConfig;
use crate::infrastructure::metrics::{MetricsCollector, MetricsSnapshot};
use crate::infrastructure::websocket::WebSocketTransport;

/// One physical connection per stream name, shared by every subscriber.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    registry: StreamRegistry,
}

impl ConnectionManager {
    /// Create a manager on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Configuration` if `config` is invalid, or
    /// `ManagerError::NoRuntime` outside a Tokio runtime.
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        let registry = StreamRegistry::new(
            config,
            transport,
            Arc::new(MetricsCollector::new()),
            runtime,
        )?;
        tracing::info!("Connection manager created");
        Ok(Self { registry })
    }

    /// Create a manager backed by real WebSocket connections.
    ///
    /// # Errors
    ///
    /// Same as `new`.
    pub fn with_websocket(config: ManagerConfig) -> Result<Self, ManagerError> {
        Self::new(config, Arc::new(WebSocketTransport::new()))
    }

    /// Status of the live connection for `stream`, if registered.
    #[must_use]
    pub fn connection_status(&self, stream: &str) -> Option<Arc<ConnectionStatus>> {
        self.registry.connection_status(stream)
    }

    /// Subscriber count for `stream`.
    #[must_use]
    pub fn subscriber_count(&self, stream: &str) -> usize {
        self.registry.subscriber_count(stream)
    }
}

impl StreamManager for ConnectionManager {
    fn subscribe(
        &self,
        stream: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, ManagerError> {
        self.registry.subscribe(stream, handler)
    }

    fn status(&self) -> bool {
        self.registry.status()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.registry.metrics().snapshot()
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.registry.streams()
    }

    fn destroy(&self) {
        self.registry.destroy();
    }

    fn tracker(&self) -> TaskTracker {
        self.registry.tracker()
    }

    fn backend(&self) -> Backend {
        Backend::Manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_runtime() {
        let result = ConnectionManager::with_websocket(ManagerConfig::default());
        assert!(matches!(result, Err(ManagerError::NoRuntime)));
    }

    #[tokio::test]
    async fn reports_manager_backend() {
        let manager = ConnectionManager::with_websocket(ManagerConfig::default()).unwrap();
        assert_eq!(manager.backend(), Backend::Manager);
        assert!(!manager.status());
        assert_eq!(manager.metrics().active_connections, 0);
        manager.destroy();
    }
}
