//! Reconnect backoff for the watch engine.
//!
//! Semantics
//! - Exponential growth: each failed reconnect multiplies the delay by the
//!   configured factor, capped at the maximum.
//! - Multiplicative jitter in [0.8, 1.2) is applied after the multiply and
//!   the result is clamped back to the maximum, so simultaneous outage
//!   recovery does not reconnect in lockstep.
//! - The delay resets to the initial value as soon as one event has been
//!   forwarded on a fresh connection.
//!
//! Invariants:
//! - Zero durations and a zero multiplier fall back to the defaults.
//! - A non-finite or negative multiplier is rejected.
//! - `max_backoff < initial_backoff` after defaulting is coerced upward.

use crate::error::{Error, Result};
use crate::sleeper::{Sleeper, TokioSleeper};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Default first delay before a reconnect attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Default upper cap on the reconnect delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Default per-retry multiplicative factor.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Snapshot handed to the `on_retry` callback before each reconnect sleep.
#[derive(Debug, Clone, Copy)]
pub struct RetryAttempt {
    /// Consecutive failed reconnects, counting this one, since the last
    /// forwarded event.
    pub attempt: u32,
    /// Delay the engine is about to sleep.
    pub next_backoff: Duration,
    /// Highest revision forwarded to the consumer so far (0 if none).
    pub last_revision: i64,
}

/// Callback invoked before each reconnect sleep with the attempt snapshot
/// and the error that ended the previous connection.
pub type OnRetry = Arc<dyn Fn(&RetryAttempt, &Error) + Send + Sync>;

/// Reconnect policy for [`watch_with_retry`](crate::watch_with_retry).
#[derive(Clone)]
pub struct RetryConfig {
    /// First delay before retrying. Zero means the default (1 s).
    pub initial_backoff: Duration,
    /// Upper cap on the delay. Zero means the default (30 s).
    pub max_backoff: Duration,
    /// Per-retry multiplicative factor. Zero means the default (2.0).
    pub backoff_multiplier: f64,
    /// 0 = retry forever; positive = give up after this many consecutive
    /// failed reconnects.
    pub max_retries: u32,
    /// Invoked before each retry sleep.
    pub on_retry: Option<OnRetry>,
    /// Sleep implementation; swap for a test sleeper to run schedules
    /// deterministically.
    pub sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_retries: 0,
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_retries", &self.max_retries)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<callback>"))
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, factor: f64) -> Self {
        self.backoff_multiplier = factor;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RetryAttempt, &Error) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Normalize defaults and reject unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRetryConfig`] when the multiplier is
    /// negative or non-finite. Durations are unsigned in Rust, so the
    /// negative-duration rejection has nothing to reject here; zeros fall
    /// back to defaults instead.
    pub fn validated(mut self) -> Result<Self> {
        if self.backoff_multiplier.is_nan() {
            return Err(Error::InvalidRetryConfig { reason: "multiplier is NaN" });
        }
        if self.backoff_multiplier.is_infinite() {
            return Err(Error::InvalidRetryConfig { reason: "multiplier is not finite" });
        }
        if self.backoff_multiplier < 0.0 {
            return Err(Error::InvalidRetryConfig { reason: "multiplier is negative" });
        }
        if self.backoff_multiplier == 0.0 {
            self.backoff_multiplier = DEFAULT_BACKOFF_MULTIPLIER;
        }
        if self.initial_backoff.is_zero() {
            self.initial_backoff = DEFAULT_INITIAL_BACKOFF;
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = DEFAULT_MAX_BACKOFF;
        }
        if self.max_backoff < self.initial_backoff {
            self.max_backoff = self.initial_backoff;
        }
        Ok(self)
    }
}

/// Current reconnect delay, advanced after each sleep.
#[derive(Debug, Clone)]
pub(crate) struct BackoffState {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl BackoffState {
    /// Build from an already-validated config.
    pub(crate) fn new(cfg: &RetryConfig) -> Self {
        Self {
            initial: cfg.initial_backoff,
            max: cfg.max_backoff,
            multiplier: cfg.backoff_multiplier,
            current: cfg.initial_backoff,
        }
    }

    /// Delay to sleep before the next reconnect.
    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    /// Back to the initial delay after a successful event.
    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Multiply, jitter in [0.8, 1.2), clamp to the cap.
    pub(crate) fn advance(&mut self) {
        let factor = rand::rng().random_range(0.8..1.2);
        self.advance_with_jitter(factor);
    }

    fn advance_with_jitter(&mut self, factor: f64) {
        let max_secs = self.max.as_secs_f64();
        let multiplied = (self.current.as_secs_f64() * self.multiplier).min(max_secs);
        let jittered = (multiplied * factor).min(max_secs);
        self.current = Duration::from_secs_f64(jittered);
    }
}
