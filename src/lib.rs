#![forbid(unsafe_code)]

//! # dislock
//!
//! Distributed locks over etcd and Redis behind one handle-based contract,
//! plus a reconnecting etcd watch stream for configuration-change
//! consumers.
//!
//! ## Features
//!
//! - **Two backends, one contract**: an auto-renewing etcd lease session
//!   and a Redis value-compare lock (single node or Redlock quorum) behind
//!   the same [`LockFactory`]/[`LockHandle`] traits
//! - **Honest acquisition results**: `try_lock` returns `Ok(None)` when
//!   the lock is held; errors mean something actually went wrong
//! - **Bounded cleanup**: `unlock` finishes its backend round-trip inside
//!   a 5 s window even when the caller's future is gone
//! - **Watch streams that survive outages**: exponential backoff with
//!   jitter, revision checkpointing, and transparent compaction recovery
//! - **Deterministic tests**: retry schedules run through a pluggable
//!   [`Sleeper`]
//!
//! ## Locking
//!
//! ```no_run
//! use dislock::{AcquireOptions, LockFactory, LockHandle, RedisLockFactory};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dislock::Error> {
//!     let client = redis::Client::open("redis://127.0.0.1:6379/")?;
//!     let factory = RedisLockFactory::new(vec![client])?;
//!
//!     let opts = AcquireOptions::new().with_expiry(Duration::from_secs(10));
//!     if let Some(handle) = factory.try_lock("jobs/reindex", &opts).await? {
//!         // critical section
//!         handle.extend().await?;
//!         handle.unlock().await?;
//!     }
//!     factory.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Watching
//!
//! ```no_run
//! use dislock::{watch_with_retry, RetryConfig, WatchOptions};
//!
//! # async fn demo() -> Result<(), dislock::Error> {
//! let client = etcd_client::Client::connect(["http://127.0.0.1:2379"], None).await?;
//! let mut events = watch_with_retry(
//!     client,
//!     "config/flags",
//!     RetryConfig::default(),
//!     WatchOptions::new().with_prefix(),
//! )?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?} {} @ {}", event.event_type, event.key, event.revision);
//! }
//! # Ok(())
//! # }
//! ```

mod backoff;
mod error;
mod key;
mod lock;
mod sleeper;
mod watch;

pub mod etcd;
pub mod redis;

// Re-exports
pub use backoff::{
    OnRetry, RetryAttempt, RetryConfig, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_BACKOFF,
};
pub use error::{Error, Result};
pub use key::{full_key, validate_key, DEFAULT_KEY_PREFIX, MAX_KEY_BYTES};
pub use lock::{
    AcquireOptions, GenValueFn, LockFactory, LockHandle, RetryDelayFn, CLEANUP_WINDOW,
    DEFAULT_DRIFT_FACTOR, DEFAULT_EXPIRY, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT_FACTOR,
    DEFAULT_TRIES,
};
pub use self::etcd::{EtcdLockFactory, EtcdOptions, Session};
pub use self::redis::{RedisLockFactory, Redlock};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use watch::{
    watch, watch_with_retry, EventStore, StoreBatch, StoreEvent, StoreStream, WatchEvent,
    WatchEventType, WatchOptions, DEFAULT_EVENT_BUFFER,
};

pub mod prelude;
