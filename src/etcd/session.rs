//! Lease session: a lease plus a background keep-alive loop.
//!
//! The session's lifetime bounds every lock acquired through it. The done
//! signal fires when the lease can no longer be renewed (expired, revoked,
//! or the keep-alive channel broke) or the session is closed; blocking
//! waits select on it so a dying session unblocks them promptly.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Default lease TTL in seconds.
pub const DEFAULT_SESSION_TTL: i64 = 60;

/// An etcd lease kept alive in the background.
pub struct Session {
    client: etcd_client::Client,
    lease_id: i64,
    ttl: i64,
    shutdown_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease_id", &self.lease_id)
            .field("ttl", &self.ttl)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Session {
    /// Grant a lease of `ttl` seconds (≤ 0 selects the default) and start
    /// renewing it.
    pub async fn new(client: etcd_client::Client, ttl: i64) -> Result<Self> {
        let ttl = if ttl <= 0 { DEFAULT_SESSION_TTL } else { ttl };
        let mut grant_client = client.clone();
        let grant = grant_client.lease_grant(ttl, None).await?;
        let lease_id = grant.id();
        let (mut keeper, mut responses) = grant_client.lease_keep_alive(lease_id).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        // Renew at a third of the TTL so two renewals can be missed before
        // the lease lapses.
        let interval = Duration::from_secs((ttl as u64 / 3).max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = keeper.keep_alive().await {
                            tracing::warn!(lease_id, error = %e, "lease keep-alive send failed");
                            break;
                        }
                        match responses.message().await {
                            Ok(Some(resp)) if resp.ttl() > 0 => {}
                            Ok(Some(_)) => {
                                tracing::warn!(lease_id, "lease expired server-side");
                                break;
                            }
                            Ok(None) | Err(_) => {
                                tracing::warn!(lease_id, "lease keep-alive stream closed");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = done_tx.send(true);
        });

        Ok(Self { client, lease_id, ttl, shutdown_tx, done_rx, closed: AtomicBool::new(false) })
    }

    /// Lease this session renews.
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// Lease TTL in seconds.
    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    /// Whether the lease is gone (expired, revoked, or closed).
    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Wait until the session is done. Cancel-safe.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Revoke the lease and stop the keep-alive loop. Idempotent; the
    /// second call performs no backend round-trip. Revocation releases
    /// every lock bound to the lease cluster-side.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        self.client.clone().lease_revoke(self.lease_id).await?;
        Ok(())
    }
}
