//! etcd-backed lock factory.
//!
//! Semantics
//! - One auto-renewing [`Session`] per factory, shared by every handle.
//!   Closing the factory revokes the lease, which releases every held lock
//!   cluster-side.
//! - Acquisition writes the full key with a create-revision guard bound to
//!   the session lease; a blocking `lock` waits for the holder's delete
//!   event before re-contending.
//! - `extend` performs no network round-trip: while the session holds the
//!   lease, the key cannot be collected by the cluster, so renewal reduces
//!   to a session-liveness check.
//! - Handles from one factory share one lease, so their ownership keys
//!   would be indistinguishable to the cluster. A per-factory set of held
//!   full keys refuses the second acquisition locally.
//!
//! All `AcquireOptions` other than the key prefix are ignored here: lock
//! lifetime is governed by the session lease TTL, not per-acquisition
//! parameters.

mod session;

pub use session::{Session, DEFAULT_SESSION_TTL};

use crate::error::{Error, Result};
use crate::key::{full_key, validate_key};
use crate::lock::{AcquireOptions, LockFactory, LockHandle, CLEANUP_WINDOW};
use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, EventType, PutOptions, Txn, TxnOp, TxnOpResponse};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Construction options for [`EtcdLockFactory`].
#[derive(Debug, Clone)]
pub struct EtcdOptions {
    session_ttl: i64,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self { session_ttl: DEFAULT_SESSION_TTL }
    }
}

impl EtcdOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session lease TTL in seconds (≤ 0 selects the default of 60).
    pub fn with_session_ttl(mut self, ttl: i64) -> Self {
        self.session_ttl = ttl;
        self
    }
}

type HeldKeys = Arc<Mutex<HashSet<String>>>;

fn key_held(held: &HeldKeys, full: &str) -> bool {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).contains(full)
}

fn mark_held(held: &HeldKeys, full: String) {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).insert(full);
}

fn clear_held(held: &HeldKeys, full: &str) {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(full);
}

/// Lock factory bound to one etcd cluster through one lease session.
pub struct EtcdLockFactory {
    client: etcd_client::Client,
    session: Arc<Session>,
    held: HeldKeys,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for EtcdLockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdLockFactory")
            .field("session", &self.session)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl EtcdLockFactory {
    /// Build a factory over an existing client, establishing the session.
    pub async fn new(client: etcd_client::Client, opts: EtcdOptions) -> Result<Self> {
        let session = Session::new(client.clone(), opts.session_ttl).await?;
        Ok(Self {
            client,
            session: Arc::new(session),
            held: Arc::new(Mutex::new(HashSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Connect to `endpoints` and build a factory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEndpoints`] when the list is empty.
    pub async fn connect(endpoints: &[String], opts: EtcdOptions) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        let client = etcd_client::Client::connect(endpoints, None).await?;
        Self::new(client, opts).await
    }

    /// The underlying session, for backend-native composition.
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FactoryClosed);
        }
        if self.session.is_done() {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }

    /// One guarded write attempt. `Ok(Some(..))` carries the holder-read
    /// revision to watch from when the key is already taken.
    async fn acquire_once(&self, full: &str) -> Result<AcquireOutcome> {
        let lease_id = self.session.lease_id();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(full, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                full,
                lease_id.to_string(),
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![TxnOp::get(full, None)]);
        let resp = self.client.clone().txn(txn).await?;
        if resp.succeeded() {
            return Ok(AcquireOutcome::Acquired);
        }
        let holder = resp.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => Some(get),
            _ => None,
        });
        match holder {
            Some(get) if !get.kvs().is_empty() => {
                let revision = get.header().map(|h| h.revision()).unwrap_or(0);
                Ok(AcquireOutcome::Taken { read_revision: revision })
            }
            // Holder vanished between the compare and the read; the key is
            // free again.
            _ => Ok(AcquireOutcome::Vanished),
        }
    }

    /// Wait until the holder's key is deleted, the session dies, or the
    /// watch breaks (in which case the caller re-contends).
    async fn wait_for_release(&self, full: &str, read_revision: i64) -> Result<()> {
        let watch_opts =
            etcd_client::WatchOptions::new().with_start_revision(read_revision + 1);
        let (_watcher, mut stream) = self.client.clone().watch(full, Some(watch_opts)).await?;
        loop {
            tokio::select! {
                _ = self.session.done() => return Err(Error::SessionExpired),
                msg = stream.message() => match msg? {
                    Some(resp) => {
                        if resp
                            .events()
                            .iter()
                            .any(|e| matches!(e.event_type(), EventType::Delete))
                        {
                            return Ok(());
                        }
                        if resp.canceled() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    fn build_handle(&self, full: String) -> Box<dyn LockHandle> {
        mark_held(&self.held, full.clone());
        Box::new(EtcdLockHandle {
            client: self.client.clone(),
            session: Arc::clone(&self.session),
            held: Arc::clone(&self.held),
            closed: Arc::clone(&self.closed),
            full_key: full,
            unlocked: AtomicBool::new(false),
        })
    }
}

enum AcquireOutcome {
    Acquired,
    Taken { read_revision: i64 },
    Vanished,
}

#[async_trait]
impl LockFactory for EtcdLockFactory {
    async fn try_lock(
        &self,
        key: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Box<dyn LockHandle>>> {
        self.check_open()?;
        validate_key(key)?;
        let full = full_key(&opts.key_prefix, key);
        if key_held(&self.held, &full) {
            return Ok(None);
        }
        match self.acquire_once(&full).await? {
            AcquireOutcome::Acquired => Ok(Some(self.build_handle(full))),
            AcquireOutcome::Taken { .. } | AcquireOutcome::Vanished => Ok(None),
        }
    }

    async fn lock(&self, key: &str, opts: &AcquireOptions) -> Result<Box<dyn LockHandle>> {
        self.check_open()?;
        validate_key(key)?;
        let full = full_key(&opts.key_prefix, key);
        if key_held(&self.held, &full) {
            // Second acquisition from the same session would share the
            // lease-keyed ownership; refuse locally.
            return Err(Error::LockFailed { attempts: 0 });
        }
        loop {
            self.check_open()?;
            match self.acquire_once(&full).await? {
                AcquireOutcome::Acquired => return Ok(self.build_handle(full)),
                AcquireOutcome::Taken { read_revision } => {
                    self.wait_for_release(&full, read_revision).await?;
                }
                AcquireOutcome::Vanished => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
        self.session.close().await
    }

    async fn health(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FactoryClosed);
        }
        if self.session.is_done() {
            return Err(Error::SessionExpired);
        }
        self.client.clone().status().await?;
        Ok(())
    }
}

/// Handle for one etcd acquisition. Ownership is the session lease.
pub struct EtcdLockHandle {
    client: etcd_client::Client,
    session: Arc<Session>,
    held: HeldKeys,
    closed: Arc<AtomicBool>,
    full_key: String,
    unlocked: AtomicBool,
}

impl std::fmt::Debug for EtcdLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdLockHandle")
            .field("key", &self.full_key)
            .field("unlocked", &self.unlocked.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl LockHandle for EtcdLockHandle {
    async fn unlock(&self) -> Result<()> {
        if self.unlocked.load(Ordering::Acquire) {
            return Err(Error::NotLocked);
        }
        let client = self.client.clone();
        let full = self.full_key.clone();
        let lease_value = self.session.lease_id().to_string();
        // Runs to completion even if this future is dropped, so deferred
        // cleanup from a dead caller still releases the lock.
        let cleanup = tokio::spawn(async move {
            let txn = Txn::new()
                .when(vec![Compare::value(full.as_str(), CompareOp::Equal, lease_value)])
                .and_then(vec![TxnOp::delete(full.as_str(), None)]);
            match tokio::time::timeout(CLEANUP_WINDOW, client.clone().txn(txn)).await {
                Ok(Ok(resp)) => Ok(resp.succeeded()),
                Ok(Err(e)) => Err(Error::from(e)),
                Err(_) => Err(Error::Timeout(CLEANUP_WINDOW)),
            }
        });
        let owned = cleanup.await.expect("unlock task panicked")?;
        if !owned {
            // Lease expiry already removed the key; ownership was gone
            // either way.
            tracing::debug!(key = %self.full_key, "unlock found key already released");
        }
        self.unlocked.store(true, Ordering::Release);
        clear_held(&self.held, &self.full_key);
        Ok(())
    }

    async fn extend(&self) -> Result<()> {
        if self.unlocked.load(Ordering::Acquire) {
            return Err(Error::NotLocked);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FactoryClosed);
        }
        if self.session.is_done() {
            return Err(Error::SessionExpired);
        }
        // The lease keeps the key alive; nothing to send.
        Ok(())
    }

    fn key(&self) -> &str {
        &self.full_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_sixty_second_sessions() {
        assert_eq!(EtcdOptions::default().session_ttl, 60);
        assert_eq!(EtcdOptions::new().with_session_ttl(5).session_ttl, 5);
    }

    #[test]
    fn held_keys_round_trip() {
        let held: HeldKeys = Arc::new(Mutex::new(HashSet::new()));
        assert!(!key_held(&held, "lock:a"));
        mark_held(&held, "lock:a".to_string());
        assert!(key_held(&held, "lock:a"));
        assert!(!key_held(&held, "lock:b"));
        clear_held(&held, "lock:a");
        assert!(!key_held(&held, "lock:a"));
    }
}
