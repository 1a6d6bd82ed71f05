//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus configuration and observability.

/// Configuration loading.
pub mod config;

/// Health check and metrics HTTP endpoint.
pub mod health;

/// Per-backend counters and the Prometheus exporter.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// `tokio-tungstenite` transport.
pub mod websocket;
