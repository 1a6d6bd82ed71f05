//! Application Services
//!
//! - `connection`: one task per physical socket (state machine + dispatch)
//! - `registry`: stream name → connection table with ref-counting
//! - `ConnectionManager`: per-stream backend over the registry
//! - `LegacyStreamService`: single combined-stream socket backend
//! - `CompatibilityRouter`: runtime switch between the two backends

pub mod connection;
mod legacy;
mod manager;
pub mod registry;
mod router;

pub use connection::{ConnectionStatus, HandlerSet, ProtocolError};
pub use legacy::LegacyStreamService;
pub use manager::ConnectionManager;
pub use registry::StreamRegistry;
pub use router::{BackendFactory, CompatibilityRouter, PerformanceMetrics};
