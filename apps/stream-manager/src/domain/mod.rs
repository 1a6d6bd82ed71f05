//! Domain Layer - Core streaming types and reconnection policy.
//!
//! This layer contains the core domain types for shared market data
//! connections with no I/O. Everything here is pure Rust and can be
//! tested without a runtime.

/// Reconnection backoff policy with jitter and circuit-open cool-down.
pub mod backoff;

/// Stream names, connection states, messages and handlers.
pub mod stream;
