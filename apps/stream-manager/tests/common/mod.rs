//! Shared fixtures: an in-memory `Transport` that counts physical connects
//! per URL and lets tests push frames into, or break, live sockets.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use stream_manager::{
    BackoffConfig, Inbound, ManagerConfig, Transport, TransportError, TransportSocket,
};

pub const BASE_URL: &str = "ws://upstream.test/ws";
pub const LEGACY_URL: &str = "ws://upstream.test/stream";

/// URL the manager backend connects to for `stream`.
pub fn stream_url(stream: &str) -> String {
    format!("{BASE_URL}/{stream}")
}

/// URL the legacy backend connects to for `streams` (already sorted).
pub fn combined_url(streams: &[&str]) -> String {
    format!("{LEGACY_URL}?streams={}", streams.join("/"))
}

/// Fast, deterministic reconnection; no idle detection, no grace period.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        base_url: BASE_URL.to_string(),
        legacy_url: LEGACY_URL.to_string(),
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            factor: 2.0,
            jitter_ratio: 0.0,
            max_retries: None,
            circuit_cooldown: Duration::from_secs(60),
        },
        cleanup_grace: Duration::ZERO,
        connect_timeout: Duration::from_secs(1),
        idle_timeout: None,
    }
}

enum Command {
    Frame(Inbound),
    Fail,
}

#[derive(Default)]
struct FakeState {
    connects: HashMap<String, usize>,
    sockets: HashMap<String, Vec<mpsc::UnboundedSender<Command>>>,
}

/// In-memory transport. Clones share state.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    failing_connects: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` handshakes fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Handshakes attempted for `url`, including failed ones.
    pub fn connects(&self, url: &str) -> usize {
        self.state.lock().connects.get(url).copied().unwrap_or(0)
    }

    /// Handshakes attempted for any URL.
    pub fn total_connects(&self) -> usize {
        self.state.lock().connects.values().sum()
    }

    /// Sockets for `url` whose reader is still alive.
    pub fn open_sockets(&self, url: &str) -> usize {
        let mut state = self.state.lock();
        let Some(senders) = state.sockets.get_mut(url) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    /// Sockets alive across all URLs.
    pub fn total_open_sockets(&self) -> usize {
        let mut state = self.state.lock();
        state
            .sockets
            .values_mut()
            .map(|senders| {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            })
            .sum()
    }

    /// Send a text frame to every live socket for `url`. Returns how many
    /// sockets it reached.
    pub fn push(&self, url: &str, text: &str) -> usize {
        self.send(url, || Command::Frame(Inbound::Text(text.to_string())))
    }

    /// Send a raw frame to every live socket for `url`.
    pub fn push_frame(&self, url: &str, frame: Inbound) -> usize {
        self.send(url, || Command::Frame(frame.clone()))
    }

    /// Break every live socket for `url` with a socket error.
    pub fn fail(&self, url: &str) -> usize {
        self.send(url, || Command::Fail)
    }

    fn send(&self, url: &str, command: impl Fn() -> Command) -> usize {
        let mut state = self.state.lock();
        let Some(senders) = state.sockets.get_mut(url) else {
            return 0;
        };
        senders.retain(|tx| tx.send(command()).is_ok());
        senders.len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSocket>, TransportError> {
        let mut state = self.state.lock();
        *state.connects.entry(url.to_string()).or_insert(0) += 1;

        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Handshake("injected handshake failure".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.sockets.entry(url.to_string()).or_default().push(tx);
        Ok(Box::new(FakeSocket { rx }))
    }
}

struct FakeSocket {
    rx: mpsc::UnboundedReceiver<Command>,
}

#[async_trait]
impl TransportSocket for FakeSocket {
    async fn next_frame(&mut self) -> Option<Result<Inbound, TransportError>> {
        match self.rx.recv().await? {
            Command::Frame(frame) => Some(Ok(frame)),
            Command::Fail => Some(Err(TransportError::Socket("injected socket error".into()))),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `future` with a timeout, panicking if it does not finish.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    tokio::time::timeout(timeout, future)
        .await
        .expect("future did not complete in time")
}
