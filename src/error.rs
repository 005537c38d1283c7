//! Error taxonomy for lock and watch operations.
//!
//! The set of kinds is closed: callers pattern-match on variants, and the
//! native backend failure stays reachable through the `source()` chain, so
//! both the semantic kind and the underlying transport error can be
//! interrogated on the same value.

use std::time::Duration;

/// Unified error type for every lock and watch operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another owner currently holds the lock. `try_lock` converts this to
    /// `Ok(None)`; it only escapes through backend-native paths.
    #[error("lock is held by another owner")]
    Held,

    /// Blocking acquisition exhausted its attempts without acquiring.
    #[error("lock acquisition failed after {attempts} attempts")]
    LockFailed {
        /// Attempts performed before giving up.
        attempts: u32,
    },

    /// The lock's TTL elapsed before the operation completed.
    #[error("lock expired before the operation completed")]
    LockExpired,

    /// Extend returned an error but ownership is undetermined. The lock may
    /// still be held; the caller can retry.
    #[error("lock extend failed with ownership undetermined")]
    ExtendFailed(#[source] Box<Error>),

    /// This handle does not own the lock (released, expired, or taken).
    #[error("lock is not held by this handle")]
    NotLocked,

    /// The etcd session's underlying lease has lapsed.
    #[error("etcd session expired")]
    SessionExpired,

    /// The factory was closed before the operation started.
    #[error("lock factory is closed")]
    FactoryClosed,

    /// Factory construction received zero backend clients.
    #[error("at least one backend client is required")]
    NoClients,

    /// The key is empty or whitespace-only after trimming.
    #[error("key must not be empty")]
    EmptyKey,

    /// The key exceeds the 512-byte limit.
    #[error("key length {len} exceeds 512 bytes")]
    KeyTooLong {
        /// Raw byte length of the rejected key.
        len: usize,
    },

    /// Connection configuration lists zero endpoints.
    #[error("at least one endpoint is required")]
    NoEndpoints,

    /// A retry configuration value is negative or non-finite.
    #[error("invalid retry config: {reason}")]
    InvalidRetryConfig {
        /// Which value was rejected and why.
        reason: &'static str,
    },

    /// The inner watch stream closed without an explicit cause.
    #[error("watch stream disconnected")]
    WatchDisconnected,

    /// The watch reconnect cap was reached.
    #[error("watch gave up after {retries} failed reconnects")]
    MaxRetriesExceeded {
        /// Consecutive failed reconnects before giving up.
        retries: u32,
    },

    /// A bounded operation window elapsed before the backend confirmed.
    /// Carries the deadline that was exceeded.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level etcd failure.
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Transport-level Redis failure.
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error means another owner holds the lock.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held)
    }

    /// Check if this error means the handle no longer owns the lock.
    ///
    /// Covers explicit release, TTL expiry, and theft. An
    /// [`Error::ExtendFailed`] is deliberately *not* ownership-lost: the
    /// lock may still be ours.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, Self::NotLocked | Self::LockExpired)
    }

    /// Check if this error is the retryable extend outcome.
    pub fn is_extend_failed(&self) -> bool {
        matches!(self, Self::ExtendFailed(_))
    }

    /// Check if this error reports a closed factory.
    pub fn is_factory_closed(&self) -> bool {
        matches!(self, Self::FactoryClosed)
    }

    /// Check if this error reports a lapsed etcd session.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Check if this error is a key validation failure.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::EmptyKey | Self::KeyTooLong { .. })
    }

    /// Check if this error is a backend transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Etcd(_) | Self::Redis(_) | Self::Timeout(_))
    }
}
