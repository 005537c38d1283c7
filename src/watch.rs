//! Key-space change streaming with automatic reconnection.
//!
//! Semantics
//! - [`watch`] opens one stream and never retries: on any disconnect it
//!   emits a final event with `error` set and the highest revision
//!   successfully forwarded, then closes the channel.
//! - [`watch_with_retry`] composes over the same machinery and reconnects
//!   with exponential backoff and jitter. Consumers observe either
//!   uninterrupted events or one terminal
//!   [`Error::MaxRetriesExceeded`](crate::Error::MaxRetriesExceeded);
//!   compaction is recovered from transparently.
//! - Both run a dedicated background task per stream. Dropping the
//!   receiver stops the task, including mid-backoff.
//!
//! Invariants:
//! - Events are delivered in ascending revision order; after a reconnect
//!   the next event's revision is strictly greater than the last one
//!   forwarded. Duplicates are never emitted.
//! - The next stream start is `max(last_revision + 1, compact_revision)`;
//!   the start option is omitted entirely while no revision is known.
//! - A non-`None` `error` on an event means the stream is about to end.

use crate::backoff::{BackoffState, RetryAttempt, RetryConfig};
use crate::error::{Error, Result};
use crate::key::validate_key;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Default capacity of the event channel handed to the consumer.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Kind of key-space change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Put,
    Delete,
    /// Stream-level records (error events) and unrecognized backend kinds.
    Unknown,
}

/// A key-space change or a stream-level error.
#[derive(Debug)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    /// Key that changed; empty on stream-level error events.
    pub key: String,
    /// New value; `None` for deletes and error events.
    pub value: Option<Vec<u8>>,
    /// Modification revision, or the highest forwarded revision on error
    /// events.
    pub revision: i64,
    /// Set on the final event before the stream closes.
    pub error: Option<Error>,
    /// Nonzero only when the server compacted past the resume point.
    pub compact_revision: i64,
}

impl WatchEvent {
    fn change(event_type: WatchEventType, key: String, value: Option<Vec<u8>>, revision: i64) -> Self {
        Self { event_type, key, value, revision, error: None, compact_revision: 0 }
    }

    fn stream_error(error: Error, state: &StreamState) -> Self {
        Self {
            event_type: WatchEventType::Unknown,
            key: String::new(),
            value: None,
            revision: state.last_revision,
            error: Some(error),
            compact_revision: state.compact_revision,
        }
    }
}

/// One change from the backing store, as the store reports it.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub event_type: WatchEventType,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: i64,
}

/// One response frame from the backing store's watch stream.
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    pub events: Vec<StoreEvent>,
    /// Nonzero when the store rejected the requested start revision because
    /// history below `compact_revision` is gone.
    pub compact_revision: i64,
    /// The store canceled the stream server-side.
    pub canceled: bool,
}

/// The watch capability this engine consumes. Implemented for
/// `etcd_client::Client`; test stores script arbitrary disconnect and
/// compaction sequences.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Open a change stream for `key` from `start_revision`
    /// (`None` = current state onward).
    async fn open(
        &self,
        key: &str,
        start_revision: Option<i64>,
        prefix: bool,
    ) -> Result<Box<dyn StoreStream>>;
}

/// An open change stream.
#[async_trait]
pub trait StoreStream: Send {
    /// Next response frame. `Ok(None)` is a clean close.
    async fn next_batch(&mut self) -> Result<Option<StoreBatch>>;
}

/// Options for one watch stream.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    start_revision: Option<i64>,
    buffer: usize,
    prefix: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { start_revision: None, buffer: DEFAULT_EVENT_BUFFER, prefix: false }
    }
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// First revision of interest. Events below it are never delivered.
    pub fn with_start_revision(mut self, revision: i64) -> Self {
        self.start_revision = Some(revision);
        self
    }

    /// Capacity of the event channel (default 256).
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Watch the whole key range sharing this prefix.
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }
}

/// Revision bookkeeping carried across reconnects.
#[derive(Debug, Clone, Copy)]
struct StreamState {
    /// Highest revision forwarded to the consumer.
    last_revision: i64,
    /// Set when the store rejects a resume because history is compacted.
    compact_revision: i64,
    /// Whether any revision is known yet (seeded or observed).
    known: bool,
}

impl StreamState {
    fn seed(start_revision: Option<i64>) -> Self {
        match start_revision {
            Some(rev) => Self { last_revision: rev.saturating_sub(1), compact_revision: 0, known: true },
            None => Self { last_revision: 0, compact_revision: 0, known: false },
        }
    }

    /// `max(last_revision + 1, compact_revision)`, or `None` while nothing
    /// is known, so a fresh stream starts at the current state.
    fn next_start(&self) -> Option<i64> {
        if !self.known {
            return None;
        }
        Some((self.last_revision + 1).max(self.compact_revision).max(1))
    }
}

enum PumpEnd {
    /// The receiver was dropped; stop silently.
    ConsumerGone,
    /// The inner stream ended.
    Disconnected { cause: Error, forwarded: bool },
}

/// Forward one connection's events until it ends. Updates `state` so the
/// caller can compute the resume point; events at or below the revision
/// already forwarded are suppressed.
async fn pump(
    stream: &mut dyn StoreStream,
    tx: &mpsc::Sender<WatchEvent>,
    state: &mut StreamState,
) -> PumpEnd {
    let floor = state.last_revision + 1;
    let mut forwarded = false;
    loop {
        let batch = tokio::select! {
            _ = tx.closed() => return PumpEnd::ConsumerGone,
            batch = stream.next_batch() => batch,
        };
        match batch {
            Ok(Some(batch)) => {
                if batch.canceled && batch.compact_revision > 0 {
                    state.compact_revision = batch.compact_revision;
                    state.known = true;
                    return PumpEnd::Disconnected { cause: Error::WatchDisconnected, forwarded };
                }
                for event in batch.events {
                    if state.known && event.revision < floor {
                        continue;
                    }
                    forwarded = true;
                    state.known = true;
                    if event.revision > state.last_revision {
                        state.last_revision = event.revision;
                    }
                    let out = WatchEvent::change(
                        event.event_type,
                        event.key,
                        event.value,
                        event.revision,
                    );
                    if tx.send(out).await.is_err() {
                        return PumpEnd::ConsumerGone;
                    }
                }
                if batch.canceled {
                    return PumpEnd::Disconnected { cause: Error::WatchDisconnected, forwarded };
                }
            }
            Ok(None) => {
                return PumpEnd::Disconnected { cause: Error::WatchDisconnected, forwarded }
            }
            Err(e) => return PumpEnd::Disconnected { cause: e, forwarded },
        }
    }
}

/// Open a single-shot stream of changes for `key`.
///
/// The returned channel yields change events until the inner stream ends
/// for any reason, then one final event with `error` set and `revision` at
/// the highest forwarded revision, then closes.
///
/// # Errors
///
/// Key validation failures are returned synchronously, before any
/// backend I/O.
pub fn watch<S>(store: S, key: &str, opts: WatchOptions) -> Result<mpsc::Receiver<WatchEvent>>
where
    S: EventStore + 'static,
{
    validate_key(key)?;
    let key = key.to_string();
    let (tx, rx) = mpsc::channel(opts.buffer);

    tokio::spawn(async move {
        let mut state = StreamState::seed(opts.start_revision);
        let cause = match store.open(&key, state.next_start(), opts.prefix).await {
            Ok(mut stream) => match pump(stream.as_mut(), &tx, &mut state).await {
                PumpEnd::ConsumerGone => return,
                PumpEnd::Disconnected { cause, .. } => cause,
            },
            Err(e) => e,
        };
        tracing::debug!(key = %key, error = %cause, "watch stream ended");
        let _ = tx.send(WatchEvent::stream_error(cause, &state)).await;
    });

    Ok(rx)
}

/// Open a reconnecting stream of changes for `key`.
///
/// Inner disconnects are retried with exponential backoff and jitter,
/// resuming from `max(last_revision + 1, compact_revision)` so nothing is
/// delivered twice and server-side compaction is stepped over without the
/// consumer noticing. The stream only ends on its own when `max_retries`
/// consecutive reconnects fail, in which case one terminal event carrying
/// [`Error::MaxRetriesExceeded`](crate::Error::MaxRetriesExceeded) is
/// emitted before the channel closes. Dropping the receiver stops the
/// background task at the next suspension point.
///
/// # Errors
///
/// Key validation and retry-config failures are returned synchronously,
/// before any backend I/O.
pub fn watch_with_retry<S>(
    store: S,
    key: &str,
    cfg: RetryConfig,
    opts: WatchOptions,
) -> Result<mpsc::Receiver<WatchEvent>>
where
    S: EventStore + 'static,
{
    validate_key(key)?;
    let cfg = cfg.validated()?;
    let key = key.to_string();
    let (tx, rx) = mpsc::channel(opts.buffer);

    tokio::spawn(async move {
        let mut state = StreamState::seed(opts.start_revision);
        let mut backoff = BackoffState::new(&cfg);
        let mut retry_count: u32 = 0;

        loop {
            let cause = match store.open(&key, state.next_start(), opts.prefix).await {
                Ok(mut stream) => match pump(stream.as_mut(), &tx, &mut state).await {
                    PumpEnd::ConsumerGone => return,
                    PumpEnd::Disconnected { cause, forwarded } => {
                        if forwarded {
                            retry_count = 0;
                            backoff.reset();
                        }
                        cause
                    }
                },
                Err(e) => e,
            };

            retry_count += 1;
            if cfg.max_retries > 0 && retry_count > cfg.max_retries {
                let terminal = Error::MaxRetriesExceeded { retries: cfg.max_retries };
                let _ = tx.send(WatchEvent::stream_error(terminal, &state)).await;
                return;
            }

            let next = backoff.current();
            if let Some(on_retry) = &cfg.on_retry {
                let attempt = RetryAttempt {
                    attempt: retry_count,
                    next_backoff: next,
                    last_revision: state.last_revision,
                };
                on_retry(&attempt, &cause);
            }
            tracing::warn!(
                key = %key,
                attempt = retry_count,
                backoff = ?next,
                error = %cause,
                "watch disconnected; reconnecting"
            );

            tokio::select! {
                _ = tx.closed() => return,
                _ = cfg.sleeper.sleep(next) => {}
            }
            backoff.advance();
        }
    });

    Ok(rx)
}

/// Wraps the etcd watch surface.
struct EtcdWatchStream {
    // Cancels the server-side watch when the stream is dropped.
    _watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
}

#[async_trait]
impl StoreStream for EtcdWatchStream {
    async fn next_batch(&mut self) -> Result<Option<StoreBatch>> {
        let Some(resp) = self.stream.message().await? else {
            return Ok(None);
        };
        let events = resp
            .events()
            .iter()
            .map(|event| {
                #[allow(unreachable_patterns)]
                let event_type = match event.event_type() {
                    etcd_client::EventType::Put => WatchEventType::Put,
                    etcd_client::EventType::Delete => WatchEventType::Delete,
                    _ => WatchEventType::Unknown,
                };
                let (key, value, revision) = match event.kv() {
                    Some(kv) => (
                        String::from_utf8_lossy(kv.key()).into_owned(),
                        (event_type == WatchEventType::Put).then(|| kv.value().to_vec()),
                        kv.mod_revision(),
                    ),
                    None => (String::new(), None, 0),
                };
                StoreEvent { event_type, key, value, revision }
            })
            .collect();
        Ok(Some(StoreBatch {
            events,
            compact_revision: resp.compact_revision(),
            canceled: resp.canceled(),
        }))
    }
}

#[async_trait]
impl EventStore for etcd_client::Client {
    async fn open(
        &self,
        key: &str,
        start_revision: Option<i64>,
        prefix: bool,
    ) -> Result<Box<dyn StoreStream>> {
        let mut watch_opts = etcd_client::WatchOptions::new();
        if let Some(revision) = start_revision {
            watch_opts = watch_opts.with_start_revision(revision);
        }
        if prefix {
            watch_opts = watch_opts.with_prefix();
        }
        let (watcher, stream) = self.clone().watch(key, Some(watch_opts)).await?;
        Ok(Box::new(EtcdWatchStream { _watcher: watcher, stream }))
    }
}
