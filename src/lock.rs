//! Backend-agnostic lock contract.
//!
//! Semantics
//! - `try_lock` is non-blocking: `Ok(None)` means another owner holds the
//!   lock; errors are reserved for validation, closed-factory, session, and
//!   transport failures. Callers check the `Option`, not the error.
//! - `lock` blocks until acquired or the backend's retry policy is
//!   exhausted (`Error::LockFailed`). Bound it with `tokio::time::timeout`
//!   or drop the future to cancel.
//! - A handle is a single-use receipt for one successful acquisition; the
//!   caller that receives it exclusively owns unlock/extend rights.
//! - `unlock` finishes its backend round-trip even if the caller's future
//!   is dropped, inside a bounded cleanup window, so deferred cleanup can
//!   never strand a lock.

use crate::error::Result;
use crate::key::DEFAULT_KEY_PREFIX;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default lock value TTL (Redis backends).
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(8);
/// Default maximum acquisition attempts in a blocking `lock` (Redis).
pub const DEFAULT_TRIES: u32 = 32;
/// Default delay between blocking acquisition attempts (Redis).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Default clock-drift compensation factor for Redlock validity.
pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;
/// Default per-node timeout factor (fraction of the expiry).
pub const DEFAULT_TIMEOUT_FACTOR: f64 = 0.05;
/// Window granted to the backend round-trip of an unlock whose caller has
/// already gone away.
pub const CLEANUP_WINDOW: Duration = Duration::from_secs(5);

/// Custom delay between blocking acquisition attempts, by attempt number
/// (1-indexed). Takes precedence over the fixed retry delay.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Custom ownership-token generator. Must return globally unique values;
/// two handles with the same token would release each other's locks.
pub type GenValueFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Per-acquisition options.
///
/// `key_prefix` applies to both backends. Everything else only shapes the
/// Redis adapter and is silently ignored by etcd, where lock lifetime is
/// governed by the session lease rather than per-acquisition parameters.
#[derive(Clone)]
pub struct AcquireOptions {
    pub(crate) key_prefix: String,
    pub(crate) expiry: Duration,
    pub(crate) tries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) retry_delay_fn: Option<RetryDelayFn>,
    pub(crate) drift_factor: f64,
    pub(crate) timeout_factor: f64,
    pub(crate) gen_value: Option<GenValueFn>,
    pub(crate) fail_fast: bool,
    pub(crate) shuffle_pools: bool,
    pub(crate) set_nx_on_extend: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            expiry: DEFAULT_EXPIRY,
            tries: DEFAULT_TRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_delay_fn: None,
            drift_factor: DEFAULT_DRIFT_FACTOR,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
            gen_value: None,
            fail_fast: false,
            shuffle_pools: false,
            set_nx_on_extend: false,
        }
    }
}

impl std::fmt::Debug for AcquireOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireOptions")
            .field("key_prefix", &self.key_prefix)
            .field("expiry", &self.expiry)
            .field("tries", &self.tries)
            .field("retry_delay", &self.retry_delay)
            .field("retry_delay_fn", &self.retry_delay_fn.as_ref().map(|_| "<fn>"))
            .field("drift_factor", &self.drift_factor)
            .field("timeout_factor", &self.timeout_factor)
            .field("gen_value", &self.gen_value.as_ref().map(|_| "<fn>"))
            .field("fail_fast", &self.fail_fast)
            .field("shuffle_pools", &self.shuffle_pools)
            .field("set_nx_on_extend", &self.set_nx_on_extend)
            .finish()
    }
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the default `"lock:"` prefix for the full key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// TTL of the lock value (Redis only).
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Maximum acquisition attempts in a blocking `lock` (Redis only).
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    /// Fixed delay between blocking acquisition attempts (Redis only).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Custom per-attempt delay; takes precedence over the fixed delay
    /// (Redis only).
    pub fn with_retry_delay_fn<F>(mut self, delay_fn: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.retry_delay_fn = Some(Arc::new(delay_fn));
        self
    }

    /// Clock-drift compensation factor for Redlock validity; values that
    /// are not finite and positive keep the default (Redis only).
    pub fn with_drift_factor(mut self, factor: f64) -> Self {
        self.drift_factor = factor;
        self
    }

    /// Per-node timeout as a fraction of the expiry; values that are not
    /// finite and positive keep the default (Redis only).
    pub fn with_timeout_factor(mut self, factor: f64) -> Self {
        self.timeout_factor = factor;
        self
    }

    /// Custom ownership-token generator (Redis only).
    pub fn with_gen_value<F>(mut self, gen: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.gen_value = Some(Arc::new(gen));
        self
    }

    /// Abort a Redlock quorum round on the first node failure (Redis only).
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Randomize node order per acquisition (Redis only).
    pub fn with_shuffle_pools(mut self, shuffle: bool) -> Self {
        self.shuffle_pools = shuffle;
        self
    }

    /// During extend, reacquire via SET-NX if the key has expired
    /// (Redis only).
    pub fn with_set_nx_on_extend(mut self, reacquire: bool) -> Self {
        self.set_nx_on_extend = reacquire;
        self
    }

    /// Effective values with out-of-range factors and a zero try count
    /// replaced by defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if !(self.drift_factor.is_finite() && self.drift_factor > 0.0) {
            self.drift_factor = DEFAULT_DRIFT_FACTOR;
        }
        if !(self.timeout_factor.is_finite() && self.timeout_factor > 0.0) {
            self.timeout_factor = DEFAULT_TIMEOUT_FACTOR;
        }
        if self.tries == 0 {
            self.tries = 1;
        }
        if self.expiry.is_zero() {
            self.expiry = DEFAULT_EXPIRY;
        }
        self
    }
}

/// One successful acquisition.
///
/// The state machine is `Held` → (`unlock` success) → `Released`, terminal.
/// `extend` keeps the handle `Held` on success and surfaces ownership loss
/// otherwise; after release, both `unlock` and `extend` return
/// [`Error::NotLocked`](crate::Error::NotLocked) without touching the
/// backend.
#[async_trait]
pub trait LockHandle: Send + Sync {
    /// Release the lock.
    ///
    /// The backend round-trip runs to completion inside a
    /// [`CLEANUP_WINDOW`]-bounded task even if this future is dropped. The
    /// released flag is set only after the backend confirms; a transport
    /// error leaves the handle retryable.
    async fn unlock(&self) -> Result<()>;

    /// Renew the lock. Backend-divergent: Redis issues the extend command
    /// with the ownership token; etcd only verifies the session is alive,
    /// because the lease (not this call) keeps the key from being
    /// collected.
    async fn extend(&self) -> Result<()>;

    /// Full key, prefix included. For logging; never reparsed.
    fn key(&self) -> &str;
}

/// Process-wide owner of the backend connection(s).
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Non-blocking acquisition. `Ok(None)` means the lock is held by
    /// another owner.
    async fn try_lock(
        &self,
        key: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Box<dyn LockHandle>>>;

    /// Blocking acquisition honoring the backend's retry policy.
    async fn lock(&self, key: &str, opts: &AcquireOptions) -> Result<Box<dyn LockHandle>>;

    /// Idempotent shutdown. New acquisitions fail with
    /// [`Error::FactoryClosed`](crate::Error::FactoryClosed) afterwards;
    /// the second call performs no backend round-trip.
    async fn close(&self) -> Result<()>;

    /// Backend reachability probe.
    async fn health(&self) -> Result<()>;
}
