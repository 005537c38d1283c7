//! Convenient re-exports for common dislock types.
pub use crate::{
    backoff::{RetryAttempt, RetryConfig},
    error::{Error, Result},
    etcd::{EtcdLockFactory, EtcdOptions, Session},
    key::validate_key,
    lock::{AcquireOptions, LockFactory, LockHandle},
    redis::{RedisLockFactory, Redlock},
    sleeper::{Sleeper, TokioSleeper},
    watch::{
        watch, watch_with_retry, EventStore, StoreBatch, StoreEvent, StoreStream, WatchEvent,
        WatchEventType, WatchOptions,
    },
};
