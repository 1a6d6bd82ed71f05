//! Configuration Module
//!
//! Configuration loading for the stream manager service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_BASE_URL, DEFAULT_LEGACY_URL, ManagerConfig, ServerSettings,
    ServiceConfig, stream_url,
};
