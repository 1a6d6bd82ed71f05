#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Stream Manager - Shared Market Data Connections
//!
//! Multiplexes many logical market-data subscriptions over at most one
//! physical WebSocket per stream name, surviving disconnects with jittered
//! backoff and an optional circuit breaker, and lets a legacy
//! combined-stream backend be swapped in or out at runtime.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: stream names, connection states, backoff policy
//! - **Application**: ports (transport, manager contract) and services
//!   (connection task, registry, manager, legacy service, router)
//! - **Infrastructure**: WebSocket transport, configuration, metrics,
//!   HTTP adapter, telemetry
//!
//! # Data Flow
//!
//! ```text
//!                      ┌────────────────┐
//! subscribe(name) ───► │ StreamRegistry │──first subscriber──► spawn Connection task
//!                      └──────┬─────────┘                       │
//!                             │ attach handler                  │ owns socket
//!                             ▼                                 ▼
//!                       HandlerSet  ◄──────── frames ─────  upstream WS
//!                         │ │ │
//!                         ▼ ▼ ▼
//!                       handlers (in order, failures detached)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Stream types and reconnection policy.
pub mod domain;

/// Application layer - Ports and backend services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::backoff::{BackoffConfig, BackoffPolicy, BackoffState, RetryDecision};
pub use domain::stream::{
    ConnectionState, HandlerError, InvalidStreamName, MessageHandler, StreamMessage, StreamName,
    SubscriptionId, handler,
};

// Ports
pub use application::ports::{
    Backend, ErrorKind, Inbound, ManagerError, StreamInfo, StreamManager, Subscription, Transport,
    TransportError, TransportSocket, shutdown,
};

// Services
pub use application::services::{
    BackendFactory, CompatibilityRouter, ConnectionManager, ConnectionStatus, LegacyStreamService,
    PerformanceMetrics, StreamRegistry,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ManagerConfig, ServerSettings, ServiceConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{MetricsCollector, MetricsSnapshot, init_metrics};

// Transport
pub use infrastructure::websocket::WebSocketTransport;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
