//! Stream Manager Configuration Settings
//!
//! Configuration types for the stream manager, loaded from environment
//! variables.

use std::time::Duration;

use url::Url;

use crate::application::ports::Backend;
use crate::domain::backoff::BackoffConfig;

/// Default upstream base for per-stream sockets.
pub const DEFAULT_BASE_URL: &str = "wss://stream.binance.com:9443/ws";

/// Default upstream endpoint for the combined-stream socket.
pub const DEFAULT_LEGACY_URL: &str = "wss://stream.binance.com:9443/stream";

/// Configuration for one manager instance.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upstream base; each stream connects to `{base_url}/{stream}`.
    pub base_url: String,
    /// Combined-stream endpoint used by the legacy backend.
    pub legacy_url: String,
    /// Reconnection policy.
    pub backoff: BackoffConfig,
    /// Delay before tearing down a connection with no subscribers.
    pub cleanup_grace: Duration,
    /// Upper bound on one handshake.
    pub connect_timeout: Duration,
    /// Reconnect when no frame arrives for this long (`None` disables).
    pub idle_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            legacy_url: DEFAULT_LEGACY_URL.to_string(),
            backoff: BackoffConfig::default(),
            cleanup_grace: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(180)),
        }
    }
}

impl ManagerConfig {
    /// Create a configuration for `base_url` with defaults elsewhere.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a URL is not `ws`/`wss` or the backoff
    /// parameters are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_ws_url(&self.base_url)?;
        parse_ws_url(&self.legacy_url)?;

        let backoff = &self.backoff;
        if backoff.base_delay.is_zero() {
            return Err(ConfigError::InvalidBackoff(
                "base delay must be positive".to_string(),
            ));
        }
        if backoff.max_delay < backoff.base_delay {
            return Err(ConfigError::InvalidBackoff(format!(
                "max delay {:?} is below base delay {:?}",
                backoff.max_delay, backoff.base_delay
            )));
        }
        if !backoff.factor.is_finite() || backoff.factor < 1.0 {
            return Err(ConfigError::InvalidBackoff(format!(
                "factor {} must be at least 1",
                backoff.factor
            )));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_ratio) {
            return Err(ConfigError::InvalidBackoff(format!(
                "jitter ratio {} must be within 0..=1",
                backoff.jitter_ratio
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "connect timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the URL is not `ws`/`wss`.
    pub fn stream_base(&self) -> Result<Url, ConfigError> {
        parse_ws_url(&self.base_url)
    }

    /// Parse `legacy_url`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the URL is not `ws`/`wss`.
    pub fn legacy_endpoint(&self) -> Result<Url, ConfigError> {
        parse_ws_url(&self.legacy_url)
    }
}

/// Build `{base}/{stream}`, appending the stream as one path segment.
///
/// # Errors
///
/// Returns `ConfigError::InvalidUrl` if `base` cannot carry a path.
pub fn stream_url(base: &Url, stream: &str) -> Result<Url, ConfigError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| ConfigError::InvalidUrl(format!("{base}: cannot append a path")))?
        .pop_if_empty()
        .push(stream);
    Ok(url)
}

fn parse_ws_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" if url.host_str().is_some() => Ok(url),
        scheme => Err(ConfigError::InvalidUrl(format!(
            "{raw}: expected a ws:// or wss:// URL with a host, got scheme {scheme:?}"
        ))),
    }
}

/// HTTP adapter settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port serving `/health`, `/metrics` and `/streams` (0 = disabled).
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8082 }
    }
}

/// Complete service configuration for the binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Manager configuration shared by both backends.
    pub manager: ManagerConfig,
    /// HTTP adapter settings.
    pub server: ServerSettings,
    /// Backend active at startup.
    pub backend: Backend,
    /// Streams subscribed at startup.
    pub streams: Vec<String>,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// Unparseable numeric values fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting manager configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ManagerConfig::default();
        let backoff_defaults = BackoffConfig::default();

        let backoff = BackoffConfig {
            base_delay: parse_env_duration_millis(
                "STREAM_MANAGER_BASE_DELAY_MS",
                backoff_defaults.base_delay,
            ),
            max_delay: parse_env_duration_millis(
                "STREAM_MANAGER_MAX_DELAY_MS",
                backoff_defaults.max_delay,
            ),
            factor: parse_env_f64("STREAM_MANAGER_BACKOFF_FACTOR", backoff_defaults.factor),
            jitter_ratio: parse_env_f64(
                "STREAM_MANAGER_JITTER_RATIO",
                backoff_defaults.jitter_ratio,
            ),
            max_retries: std::env::var("STREAM_MANAGER_MAX_RETRIES")
                .map_or(backoff_defaults.max_retries, |v| {
                    parse_max_retries(&v).unwrap_or(backoff_defaults.max_retries)
                }),
            circuit_cooldown: parse_env_duration_millis(
                "STREAM_MANAGER_CIRCUIT_COOLDOWN_MS",
                backoff_defaults.circuit_cooldown,
            ),
        };

        let idle_timeout = std::env::var("STREAM_MANAGER_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(defaults.idle_timeout, |secs| {
                (secs > 0).then(|| Duration::from_secs(secs))
            });

        let manager = ManagerConfig {
            base_url: std::env::var("STREAM_MANAGER_BASE_URL").unwrap_or(defaults.base_url),
            legacy_url: std::env::var("STREAM_MANAGER_LEGACY_URL").unwrap_or(defaults.legacy_url),
            backoff,
            cleanup_grace: parse_env_duration_millis(
                "STREAM_MANAGER_CLEANUP_GRACE_MS",
                defaults.cleanup_grace,
            ),
            connect_timeout: parse_env_duration_millis(
                "STREAM_MANAGER_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            ),
            idle_timeout,
        };
        manager.validate()?;

        let server = ServerSettings {
            http_port: parse_env_u16("STREAM_MANAGER_HTTP_PORT", ServerSettings::default().http_port),
        };

        let backend = std::env::var("STREAM_MANAGER_BACKEND")
            .ok()
            .and_then(|v| Backend::parse(&v))
            .unwrap_or(Backend::Manager);

        let streams = std::env::var("STREAM_MANAGER_STREAMS")
            .map(|v| parse_stream_list(&v))
            .unwrap_or_default();

        Ok(Self {
            manager,
            server,
            backend,
            streams,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// URL is unparseable or not a WebSocket URL.
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),
    /// Backoff parameters are inconsistent.
    #[error("invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Any other rejected value.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse the retry ceiling: `unbounded` (or empty) means never give up.
fn parse_max_retries(value: &str) -> Option<Option<u32>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("unbounded") {
        return Some(None);
    }
    value.parse::<u32>().ok().map(Some)
}

fn parse_stream_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
