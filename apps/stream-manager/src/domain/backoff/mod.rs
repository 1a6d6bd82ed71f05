//! Reconnection Policy
//!
//! Exponential backoff with additive jitter for reconnecting a dropped
//! stream, plus an optional retry ceiling after which the connection
//! enters a circuit-open cool-down before starting over at attempt 0.
//!
//! ```text
//! delay(n) = min(base * factor^n, max) + uniform(0, jitter_ratio * min(base * factor^n, max))
//! ```

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Maximum delay between reconnection attempts (before jitter).
    pub max_delay: Duration,
    /// Multiplier applied per attempt (e.g., 2.0 doubles the delay).
    pub factor: f64,
    /// Jitter window as a fraction of the capped delay (e.g., 0.2 = up to +20%).
    pub jitter_ratio: f64,
    /// Attempts allowed before the circuit opens (`None` = never give up).
    pub max_retries: Option<u32>,
    /// How long the circuit stays open before retrying from attempt 0.
    pub circuit_cooldown: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter_ratio: 0.2,
            max_retries: None,
            circuit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Pure delay computation; holds no attempt state.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    /// Create a policy from configuration.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Get the policy configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Capped exponential delay for `attempt`, without jitter.
    #[must_use]
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.config.base_delay.as_secs_f64() * self.config.factor.powi(exponent);

        // NaN or infinity from a runaway exponent collapses to the cap.
        if !scaled.is_finite() || scaled >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0)).min(self.config.max_delay)
    }

    /// Upper bound of the jitter added on top of `capped_delay(attempt)`.
    #[must_use]
    pub fn jitter_window(&self, attempt: u32) -> Duration {
        self.capped_delay(attempt)
            .mul_f64(self.config.jitter_ratio.clamp(0.0, 1.0))
    }

    /// Delay before reconnection attempt `attempt` (0-based), with jitter.
    #[must_use]
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        let window = self.jitter_window(attempt);
        if window.is_zero() {
            return capped;
        }

        let mut rng = rand::rng();
        let jitter = rng.random_range(0.0..=window.as_secs_f64());
        (capped + Duration::from_secs_f64(jitter)).min(capped + window)
    }
}

/// What a connection should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then reconnect.
    Retry {
        /// Attempt number this delay belongs to (1-based).
        attempt: u32,
        /// Time to wait before reconnecting.
        delay: Duration,
    },
    /// Retry ceiling hit: stay down for `cooldown`, then start over.
    CircuitOpen {
        /// Cool-down window before attempts resume at 0.
        cooldown: Duration,
    },
}

/// Per-connection backoff state.
///
/// Reset to attempt 0 on every successful open.
#[derive(Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    attempt: u32,
}

impl BackoffState {
    /// Create fresh state at attempt 0.
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Decide what to do after a failed or dropped connection.
    ///
    /// Advances the attempt counter. When the retry ceiling is reached the
    /// counter resets and `CircuitOpen` is returned.
    pub fn next_decision(&mut self) -> RetryDecision {
        if let Some(max) = self.policy.config.max_retries
            && self.attempt >= max
        {
            self.attempt = 0;
            return RetryDecision::CircuitOpen {
                cooldown: self.policy.config.circuit_cooldown,
            };
        }

        let delay = self.policy.compute_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        RetryDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// Tests
// =============================================================================
