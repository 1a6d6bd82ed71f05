//! Stream Types
//!
//! Domain types shared by every backend: the stream name used as the
//! registry key, subscription identifiers, the connection state machine
//! states and the opaque message delivered to handlers.
//!
//! # Design
//!
//! Messages are transported opaquely: the payload is any JSON value and
//! no trading semantics are attached to it. A handler returning an error
//! (or panicking) is detached from its connection without affecting the
//! connection or its other handlers.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

// =============================================================================
// Stream Name
// =============================================================================

/// Logical identifier for one upstream feed (e.g. `btcusdt@trade`).
///
/// Guaranteed non-empty and free of whitespace and `/`, so it can be used
/// as a URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StreamName(Arc<str>);

impl StreamName {
    /// Validate and wrap a stream name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStreamName` if the name is empty or contains
    /// whitespace or a path separator.
    pub fn parse(name: &str) -> Result<Self, InvalidStreamName> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(InvalidStreamName::Empty);
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c == '/' || c == '?') {
            return Err(InvalidStreamName::IllegalCharacter(name.to_string()));
        }
        Ok(Self(Arc::from(trimmed)))
    }

    /// Get the stream name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejected stream name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidStreamName {
    /// Empty or whitespace-only name.
    #[error("stream name cannot be empty")]
    Empty,
    /// Name contains whitespace, `/` or `?`.
    #[error("stream name {0:?} contains an illegal character")]
    IllegalCharacter(String),
}

// =============================================================================
// Subscription Identifier
// =============================================================================

/// Opaque identifier for one `subscribe` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one physical connection.
///
/// ```text
/// CONNECTING ──► OPEN ──► RECONNECTING ──► CONNECTING ...
///      │           │            │
///      └───────────┴────────────┴──► CLOSING ──► CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting = 0,
    /// Socket open, messages flowing.
    Open = 1,
    /// Waiting out the backoff delay (or circuit cool-down).
    Reconnecting = 2,
    /// Explicit teardown in progress.
    Closing = 3,
    /// Terminal state; the connection is never reused.
    Closed = 4,
}

impl ConnectionState {
    /// Decode from the `u8` representation used in atomics.
    ///
    /// Unknown values decode as `Closed`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Reconnecting,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Encode as `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the connection still serves its subscribers.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Messages and Handlers
// =============================================================================

/// A message received on a stream, delivered to every attached handler.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Stream the message arrived on.
    pub stream: StreamName,
    /// Connection epoch (incremented on every successful open).
    ///
    /// A change in epoch between two messages means a reconnect happened
    /// and messages may have been missed in between.
    pub epoch: u64,
    /// Decoded JSON payload.
    pub payload: Arc<serde_json::Value>,
}

/// Error returned by a handler; the handler is detached afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Callback invoked for every message on a stream.
pub type MessageHandler = Arc<dyn Fn(&StreamMessage) -> Result<(), HandlerError> + Send + Sync>;

/// Wrap a closure as a `MessageHandler`.
pub fn handler<F>(f: F) -> MessageHandler
where
    F: Fn(&StreamMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_accepts_binance_style() {
        let name = StreamName::parse("btcusdt@trade").unwrap();
        assert_eq!(name.as_str(), "btcusdt@trade");
        assert_eq!(name.to_string(), "btcusdt@trade");
    }

    #[test]
    fn stream_name_trims_surrounding_whitespace() {
        let name = StreamName::parse("  ethusdt@kline_1m ").unwrap();
        assert_eq!(name.as_str(), "ethusdt@kline_1m");
    }

    #[test]
    fn stream_name_rejects_empty() {
        assert_eq!(StreamName::parse(""), Err(InvalidStreamName::Empty));
        assert_eq!(StreamName::parse("   "), Err(InvalidStreamName::Empty));
    }

    #[test]
    fn stream_name_rejects_path_characters() {
        assert!(StreamName::parse("btc/usdt").is_err());
        assert!(StreamName::parse("btc usdt").is_err());
        assert!(StreamName::parse("btc?x=1").is_err());
    }

    #[test]
    fn connection_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Reconnecting,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Closed);
    }

    #[test]
    fn connection_state_liveness() {
        assert!(ConnectionState::Connecting.is_live());
        assert!(ConnectionState::Open.is_live());
        assert!(ConnectionState::Reconnecting.is_live());
        assert!(!ConnectionState::Closing.is_live());
        assert!(!ConnectionState::Closed.is_live());
    }

    #[test]
    fn connection_state_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Reconnecting).unwrap(),
            "\"RECONNECTING\""
        );
    }

    #[test]
    fn subscription_ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
    }
}
