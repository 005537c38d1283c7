//! Redis-backed lock factory: single node or Redlock quorum.
//!
//! Semantics
//! - Ownership is a random value written with SET NX PX at acquisition;
//!   every handle is independently identifiable, even for the same key in
//!   one process. Release and renewal compare that value in a Lua script
//!   before touching the key.
//! - With N clients the factory runs the Redlock protocol: an acquisition
//!   counts only when ⌈N/2⌉+1 nodes accept it within the validity window
//!   (expiry minus elapsed time minus the clock-drift allowance). Partial
//!   acquisitions are rolled back best-effort.
//! - Extend outcomes distinguish definitive ownership loss (`NotLocked`,
//!   `LockExpired`) from transport uncertainty (`ExtendFailed`): the lock
//!   may still be ours after a network error, and the caller may retry.
//! - `close` only flips the closed flag. Clients are caller-owned and stay
//!   open, and already-issued handles keep their unlock/extend rights so
//!   deferred cleanup cannot hang.

use crate::error::{Error, Result};
use crate::key::{full_key, validate_key};
use crate::lock::{AcquireOptions, LockFactory, LockHandle, CLEANUP_WINDOW};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Value-compared delete. Returns 1 when our value was removed, 0 on a
/// foreign value, -1 when the key is gone.
const UNLOCK_SCRIPT: &str = r#"
local v = redis.call("GET", KEYS[1])
if v == false then
  return -1
elseif v == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Value-compared TTL refresh, same result coding as the unlock script.
/// ARGV[3] == "1" permits reacquiring an expired key via SET NX PX.
const EXTEND_SCRIPT: &str = r#"
local v = redis.call("GET", KEYS[1])
if v == false then
  if ARGV[3] == "1" then
    if redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
      return 1
    end
    return 0
  end
  return -1
elseif v == ARGV[1] then
  redis.call("PEXPIRE", KEYS[1], ARGV[2])
  return 1
else
  return 0
end
"#;

/// Per-node outcome of one command or script round.
#[derive(Debug)]
enum NodeStatus {
    /// The node accepted the operation for our value.
    Success,
    /// The node holds a foreign value (SET NX miss, script mismatch).
    Conflict,
    /// The script found no key at all.
    Missing,
    /// Transport failure or per-node timeout; truth unknown.
    Failed(Error),
}

/// Quorum verdict over one round of node outcomes.
#[derive(Debug)]
enum Verdict {
    Met,
    /// Every node answered; the lock is definitively not ours.
    Lost { conflicts: usize },
    /// Transport failures left the quorum undecided.
    Uncertain { cause: Error },
}

fn judge(results: Vec<NodeStatus>, quorum: usize) -> Verdict {
    let successes = results.iter().filter(|s| matches!(s, NodeStatus::Success)).count();
    if successes >= quorum {
        return Verdict::Met;
    }
    let conflicts = results.iter().filter(|s| matches!(s, NodeStatus::Conflict)).count();
    let cause = results.into_iter().find_map(|s| match s {
        NodeStatus::Failed(e) => Some(e),
        _ => None,
    });
    match cause {
        Some(cause) => Verdict::Uncertain { cause },
        None => Verdict::Lost { conflicts },
    }
}

fn node_timeout(expiry: Duration, timeout_factor: f64) -> Duration {
    expiry.mul_f64(timeout_factor).max(Duration::from_millis(10))
}

fn drift_allowance(expiry: Duration, drift_factor: f64) -> Duration {
    expiry.mul_f64(drift_factor) + Duration::from_millis(2)
}

/// The Redlock driver: the client set and the quorum math.
pub struct Redlock {
    clients: Vec<redis::Client>,
    quorum: usize,
}

impl std::fmt::Debug for Redlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redlock")
            .field("nodes", &self.clients.len())
            .field("quorum", &self.quorum)
            .finish()
    }
}

impl Redlock {
    /// Build a driver over caller-owned clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoClients`] when the list is empty.
    pub fn new(clients: Vec<redis::Client>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::NoClients);
        }
        let quorum = clients.len() / 2 + 1;
        Ok(Self { clients, quorum })
    }

    /// Nodes this driver spans.
    pub fn clients(&self) -> &[redis::Client] {
        &self.clients
    }

    /// Nodes required for a majority.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    async fn lock_node(
        client: &redis::Client,
        key: &str,
        value: &str,
        ttl_ms: u64,
        budget: Duration,
    ) -> NodeStatus {
        let attempt = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let reply: redis::Value = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            Ok::<redis::Value, redis::RedisError>(reply)
        };
        match tokio::time::timeout(budget, attempt).await {
            Ok(Ok(redis::Value::Okay)) => NodeStatus::Success,
            Ok(Ok(_)) => NodeStatus::Conflict,
            Ok(Err(e)) => NodeStatus::Failed(Error::Redis(e)),
            Err(_) => NodeStatus::Failed(Error::Timeout(budget)),
        }
    }

    async fn script_node(
        client: &redis::Client,
        script: &str,
        key: &str,
        args: &[String],
        budget: Duration,
    ) -> NodeStatus {
        let attempt = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let script = redis::Script::new(script);
            let mut prepared = script.prepare_invoke();
            prepared.key(key);
            for arg in args {
                prepared.arg(arg);
            }
            let code: i64 = prepared.invoke_async(&mut conn).await?;
            Ok::<i64, redis::RedisError>(code)
        };
        match tokio::time::timeout(budget, attempt).await {
            Ok(Ok(1)) => NodeStatus::Success,
            Ok(Ok(-1)) => NodeStatus::Missing,
            Ok(Ok(_)) => NodeStatus::Conflict,
            Ok(Err(e)) => NodeStatus::Failed(Error::Redis(e)),
            Err(_) => NodeStatus::Failed(Error::Timeout(budget)),
        }
    }

    fn node_order(&self, shuffle: bool) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.clients.len()).collect();
        if shuffle {
            order.shuffle(&mut rand::rng());
        }
        order
    }

    /// One quorum acquisition round. `Ok(None)` means the lock is held (or
    /// the validity window was consumed before a quorum formed).
    async fn acquire_round(
        &self,
        key: &str,
        value: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Duration>> {
        let ttl_ms = opts.expiry.as_millis() as u64;
        let budget = node_timeout(opts.expiry, opts.timeout_factor);
        let order = self.node_order(opts.shuffle_pools);
        let started = Instant::now();

        let results: Vec<NodeStatus> = if opts.fail_fast {
            let mut results = Vec::with_capacity(order.len());
            for &i in &order {
                let status =
                    Self::lock_node(&self.clients[i], key, value, ttl_ms, budget).await;
                let ok = matches!(status, NodeStatus::Success);
                results.push(status);
                if !ok {
                    break;
                }
            }
            results
        } else {
            join_all(
                order
                    .iter()
                    .map(|&i| Self::lock_node(&self.clients[i], key, value, ttl_ms, budget)),
            )
            .await
        };

        let successes = results.iter().filter(|s| matches!(s, NodeStatus::Success)).count();
        let validity = opts
            .expiry
            .saturating_sub(started.elapsed())
            .saturating_sub(drift_allowance(opts.expiry, opts.drift_factor));

        if successes >= self.quorum && !validity.is_zero() {
            return Ok(Some(validity));
        }

        // Roll back whatever subset we did write.
        self.unlock_round(key, value, budget).await;

        let conflicts = results.iter().filter(|s| matches!(s, NodeStatus::Conflict)).count();
        if conflicts > 0 || successes > 0 {
            // The taken signal, or a quorum that came in too slowly.
            return Ok(None);
        }
        match results.into_iter().find_map(|s| match s {
            NodeStatus::Failed(e) => Some(e),
            _ => None,
        }) {
            Some(cause) => Err(cause),
            None => Ok(None),
        }
    }

    async fn unlock_round(&self, key: &str, value: &str, budget: Duration) -> Vec<NodeStatus> {
        let args = [value.to_string()];
        join_all(
            self.clients
                .iter()
                .map(|client| Self::script_node(client, UNLOCK_SCRIPT, key, &args, budget)),
        )
        .await
    }

    async fn extend_round(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
        reacquire: bool,
        budget: Duration,
    ) -> Vec<NodeStatus> {
        let args = [
            value.to_string(),
            ttl_ms.to_string(),
            if reacquire { "1" } else { "0" }.to_string(),
        ];
        join_all(
            self.clients
                .iter()
                .map(|client| Self::script_node(client, EXTEND_SCRIPT, key, &args, budget)),
        )
        .await
    }

    async fn ping_all(&self) -> Result<()> {
        let probes = join_all(self.clients.iter().map(|client| async move {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<(), redis::RedisError>(())
        }))
        .await;
        for probe in probes {
            probe?;
        }
        Ok(())
    }
}

/// Lock factory over one or more Redis nodes.
pub struct RedisLockFactory {
    driver: Arc<Redlock>,
    closed: AtomicBool,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RedisLockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockFactory")
            .field("driver", &self.driver)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl RedisLockFactory {
    /// Build a factory over caller-owned clients. One client locks a single
    /// node; several run the Redlock quorum protocol.
    pub fn new(clients: Vec<redis::Client>) -> Result<Self> {
        Ok(Self {
            driver: Arc::new(Redlock::new(clients)?),
            closed: AtomicBool::new(false),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Swap the sleeper used between blocking acquisition attempts.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// The underlying Redlock driver, for backend-native composition.
    pub fn redlock(&self) -> &Redlock {
        &self.driver
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FactoryClosed);
        }
        Ok(())
    }

    fn ownership_value(opts: &AcquireOptions) -> String {
        match &opts.gen_value {
            Some(gen) => gen(),
            None => uuid::Uuid::new_v4().to_string(),
        }
    }

    fn build_handle(&self, full: String, value: String, opts: &AcquireOptions) -> Box<dyn LockHandle> {
        Box::new(RedisLockHandle {
            driver: Arc::clone(&self.driver),
            full_key: full,
            value,
            expiry: opts.expiry,
            node_budget: node_timeout(opts.expiry, opts.timeout_factor),
            set_nx_on_extend: opts.set_nx_on_extend,
            unlocked: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl LockFactory for RedisLockFactory {
    async fn try_lock(
        &self,
        key: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Box<dyn LockHandle>>> {
        self.check_open()?;
        validate_key(key)?;
        let opts = opts.clone().normalized();
        let full = full_key(&opts.key_prefix, key);
        let value = Self::ownership_value(&opts);
        match self.driver.acquire_round(&full, &value, &opts).await? {
            Some(_validity) => Ok(Some(self.build_handle(full, value, &opts))),
            None => Ok(None),
        }
    }

    async fn lock(&self, key: &str, opts: &AcquireOptions) -> Result<Box<dyn LockHandle>> {
        self.check_open()?;
        validate_key(key)?;
        let opts = opts.clone().normalized();
        let full = full_key(&opts.key_prefix, key);
        let value = Self::ownership_value(&opts);

        for attempt in 1..=opts.tries {
            self.check_open()?;
            match self.driver.acquire_round(&full, &value, &opts).await {
                Ok(Some(_validity)) => return Ok(self.build_handle(full, value, &opts)),
                Ok(None) => {}
                Err(e) => {
                    // Node failures count as a missed attempt, like a
                    // contended round.
                    tracing::debug!(key = %full, attempt, error = %e, "acquisition round failed");
                }
            }
            if attempt < opts.tries {
                let delay = match &opts.retry_delay_fn {
                    Some(delay_fn) => delay_fn(attempt),
                    None => opts.retry_delay,
                };
                self.sleeper.sleep(delay).await;
            }
        }
        Err(Error::LockFailed { attempts: opts.tries })
    }

    async fn close(&self) -> Result<()> {
        // Clients are caller-owned; handles already issued keep their
        // unlock/extend rights so deferred cleanup cannot hang.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.check_open()?;
        self.driver.ping_all().await
    }
}

/// Handle for one Redis acquisition. Ownership is the random value.
pub struct RedisLockHandle {
    driver: Arc<Redlock>,
    full_key: String,
    value: String,
    expiry: Duration,
    node_budget: Duration,
    set_nx_on_extend: bool,
    unlocked: AtomicBool,
}

impl std::fmt::Debug for RedisLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockHandle")
            .field("key", &self.full_key)
            .field("unlocked", &self.unlocked.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl LockHandle for RedisLockHandle {
    async fn unlock(&self) -> Result<()> {
        if self.unlocked.load(Ordering::Acquire) {
            return Err(Error::NotLocked);
        }
        let driver = Arc::clone(&self.driver);
        let full = self.full_key.clone();
        let value = self.value.clone();
        let budget = self.node_budget;
        // Runs to completion even if this future is dropped, so deferred
        // cleanup from a dead caller still releases the lock.
        let cleanup = tokio::spawn(async move {
            match tokio::time::timeout(CLEANUP_WINDOW, driver.unlock_round(&full, &value, budget))
                .await
            {
                Ok(results) => Ok(results),
                Err(_) => Err(Error::Timeout(CLEANUP_WINDOW)),
            }
        });
        let results = cleanup.await.expect("unlock task panicked")?;
        match judge(results, self.driver.quorum()) {
            Verdict::Met => {
                self.unlocked.store(true, Ordering::Release);
                Ok(())
            }
            Verdict::Lost { conflicts } => {
                if conflicts > 0 {
                    Err(Error::NotLocked)
                } else {
                    Err(Error::LockExpired)
                }
            }
            Verdict::Uncertain { cause } => Err(cause),
        }
    }

    async fn extend(&self) -> Result<()> {
        if self.unlocked.load(Ordering::Acquire) {
            return Err(Error::NotLocked);
        }
        let ttl_ms = self.expiry.as_millis() as u64;
        let results = self
            .driver
            .extend_round(
                &self.full_key,
                &self.value,
                ttl_ms,
                self.set_nx_on_extend,
                self.node_budget,
            )
            .await;
        match judge(results, self.driver.quorum()) {
            Verdict::Met => Ok(()),
            Verdict::Lost { conflicts } => {
                if conflicts > 0 {
                    Err(Error::NotLocked)
                } else {
                    Err(Error::LockExpired)
                }
            }
            Verdict::Uncertain { cause } => Err(Error::ExtendFailed(Box::new(cause))),
        }
    }

    fn key(&self) -> &str {
        &self.full_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> NodeStatus {
        NodeStatus::Failed(Error::Timeout(Duration::from_millis(50)))
    }

    #[test]
    fn quorum_is_majority_plus_one_of_halves() {
        let mk = |n: usize| {
            let clients = (0..n)
                .map(|i| redis::Client::open(format!("redis://127.0.0.1:{}/", 6379 + i)))
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("client urls parse");
            Redlock::new(clients).expect("non-empty")
        };
        assert_eq!(mk(1).quorum(), 1);
        assert_eq!(mk(2).quorum(), 2);
        assert_eq!(mk(3).quorum(), 2);
        assert_eq!(mk(5).quorum(), 3);
    }

    #[test]
    fn empty_client_list_is_rejected() {
        assert!(matches!(Redlock::new(Vec::new()), Err(Error::NoClients)));
        assert!(matches!(RedisLockFactory::new(Vec::new()), Err(Error::NoClients)));
    }

    #[test]
    fn quorum_of_successes_is_met_despite_one_failure() {
        let verdict = judge(
            vec![NodeStatus::Success, NodeStatus::Success, transport()],
            2,
        );
        assert!(matches!(verdict, Verdict::Met));
    }

    #[test]
    fn transport_failures_leave_the_verdict_uncertain() {
        let verdict = judge(vec![NodeStatus::Success, transport(), transport()], 2);
        match verdict {
            Verdict::Uncertain { cause } => assert!(cause.is_transport()),
            other => panic!("expected uncertain verdict, got {other:?}"),
        }
    }

    #[test]
    fn definitive_answers_mean_ownership_lost() {
        let verdict = judge(
            vec![NodeStatus::Conflict, NodeStatus::Missing, NodeStatus::Missing],
            2,
        );
        assert!(matches!(verdict, Verdict::Lost { conflicts: 1 }));

        let verdict = judge(vec![NodeStatus::Missing], 1);
        assert!(matches!(verdict, Verdict::Lost { conflicts: 0 }));
    }

    #[test]
    fn node_budget_scales_with_expiry() {
        assert_eq!(
            node_timeout(Duration::from_secs(8), 0.05),
            Duration::from_millis(400)
        );
        // Tiny expiries still get a usable budget.
        assert_eq!(
            node_timeout(Duration::from_millis(10), 0.05),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn drift_allowance_matches_redlock_arithmetic() {
        assert_eq!(
            drift_allowance(Duration::from_secs(8), 0.01),
            Duration::from_millis(82)
        );
    }

    #[test]
    fn scripts_compare_before_mutating() {
        assert!(UNLOCK_SCRIPT.contains(r#"redis.call("GET", KEYS[1])"#));
        assert!(UNLOCK_SCRIPT.contains(r#"redis.call("DEL", KEYS[1])"#));
        assert!(EXTEND_SCRIPT.contains("PEXPIRE"));
        assert!(EXTEND_SCRIPT.contains(r#""NX", "PX""#));
    }
}
