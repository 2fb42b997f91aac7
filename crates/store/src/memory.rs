//! In-memory store backend.
//!
//! [`MemoryBackend`] implements the full [`Command`] vocabulary over an
//! in-process dataset, with the same reply shapes a Redis server produces. It
//! backs unit and integration tests across the workspace and is usable for
//! single-process development gateways.
//!
//! [`MemoryConnector`] wraps a backend in the [`Connector`] interface and adds
//! fault injection: refusing connections, severing live connections and failing
//! the next N commands. Reconnect behaviour is tested with it.
//!
//! # Example
//!
//! ```
//! use tollgate_store::{Command, MemoryBackend, Reply, StoreBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!     let set = Command::Set { key: "greeting".into(), value: "hello".into(), ttl: None };
//!     backend.query(set).await.unwrap();
//!
//!     let reply = backend.query(Command::Get { key: "greeting".into() }).await.unwrap();
//!     assert_eq!(reply, Reply::Bulk("hello".into()));
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted.
//! - `KEYS` supports `*`, `?` and backslash escapes, but not `[...]` classes.
//! - A command that fails inside a transaction stops the transaction; earlier
//!   commands keep their effect, as with Redis `EXEC`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fail::fail_point;
use parking_lot::Mutex;
use tokio::{
    select,
    sync::{broadcast, watch},
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Connector, StoreBackend},
    command::{Command, Reply, ScoreBound},
    error::{StoreError, StoreResult},
    health::{HealthMetadata, HealthStatus},
    pubsub::{Message, Subscription},
};

/// Messages buffered per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

/// Interval of the background expiry sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    List(Vec<String>),
    SortedSet(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self { value, expires_at: None }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Dataset {
    entries: HashMap<String, Entry>,
}

impl Dataset {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
    }

    fn live_mut(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        self.purge_if_expired(key, now);
        self.entries.get_mut(key)
    }

    fn or_insert(&mut self, key: &str, now: Instant, empty: fn() -> Value) -> &mut Entry {
        self.purge_if_expired(key, now);
        self.entries.entry(key.to_owned()).or_insert_with(|| Entry::new(empty()))
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }
}

/// Holds the shutdown signal sender. When dropped, the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory implementation of [`StoreBackend`].
///
/// Cheap to clone; all clones share the same dataset and channels.
///
/// # Shutdown
///
/// A background task sweeps expired keys every second. It stops when the
/// last clone is dropped or [`shutdown`](Self::shutdown) is called. Expired
/// keys are invisible to commands even before the sweep removes them.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<Mutex<Dataset>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("keys", &self.data.lock().entries.len()).finish()
    }
}

impl MemoryBackend {
    /// Creates an empty backend and starts its expiry sweep.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            data: Arc::new(Mutex::new(Dataset::default())),
            channels: Arc::new(Mutex::new(HashMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        let data = Arc::downgrade(&backend.data);
        tokio::spawn(cleanup_expired_keys(data, shutdown_rx));

        backend
    }

    /// Stops the background expiry sweep.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.lock().entries.values().filter(|entry| entry.is_live(now)).count()
    }

    /// Whether no live keys exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key.
    pub fn flush(&self) {
        self.data.lock().entries.clear();
    }

    fn publish(&self, channel: &str, payload: &str) -> i64 {
        let channels = self.channels.lock();
        let Some(sender) = channels.get(channel) else {
            return 0;
        };
        match sender.send(Message::new(channel, payload)) {
            Ok(receivers) => i64::try_from(receivers).unwrap_or(i64::MAX),
            Err(_) => 0,
        }
    }

    fn execute(&self, data: &mut Dataset, command: Command, now: Instant) -> StoreResult<Reply> {
        match command {
            Command::Get { key } => match data.live(&key, now).map(|e| &e.value) {
                None => Ok(Reply::Nil),
                Some(Value::Str(text)) => Ok(Reply::Bulk(text.clone())),
                Some(_) => Err(wrong_type()),
            },
            Command::Set { key, value, ttl } => {
                let expires_at = match ttl {
                    Some(ttl) if ttl.is_zero() => {
                        return Err(StoreError::protocol("invalid expire time in 'set' command"));
                    },
                    Some(ttl) => Some(now + ttl),
                    None => None,
                };
                data.entries.insert(key, Entry { value: Value::Str(value), expires_at });
                Ok(Reply::Ok)
            },
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if data.entries.remove(&key).is_some_and(|entry| entry.is_live(now)) {
                        removed += 1;
                    }
                }
                Ok(Reply::Int(removed))
            },
            Command::Incr { key } => add_to_counter(data, &key, 1, now),
            Command::Decr { key } => add_to_counter(data, &key, -1, now),
            Command::Expire { key, ttl } => {
                let Some(entry) = data.live_mut(&key, now) else {
                    return Ok(Reply::Int(0));
                };
                if ttl.is_zero() {
                    data.entries.remove(&key);
                } else {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(Reply::Int(1))
            },
            Command::Ttl { key } => Ok(Reply::Int(match data.live(&key, now) {
                None => -2,
                Some(Entry { expires_at: None, .. }) => -1,
                Some(Entry { expires_at: Some(at), .. }) => {
                    let millis = at.saturating_duration_since(now).as_millis();
                    i64::try_from((millis + 500) / 1000).unwrap_or(i64::MAX)
                },
            })),
            Command::Keys { pattern } => {
                let mut keys: Vec<String> = data
                    .entries
                    .iter()
                    .filter(|(key, entry)| entry.is_live(now) && glob_match(&pattern, key))
                    .map(|(key, _)| key.clone())
                    .collect();
                keys.sort_unstable();
                Ok(Reply::Array(keys.into_iter().map(Reply::Bulk).collect()))
            },
            Command::MGet { keys } => Ok(Reply::Array(
                keys.iter()
                    .map(|key| match data.live(key, now).map(|e| &e.value) {
                        Some(Value::Str(text)) => Reply::Bulk(text.clone()),
                        _ => Reply::Nil,
                    })
                    .collect(),
            )),
            Command::SAdd { key, member } => {
                let entry = data.or_insert(&key, now, || Value::Set(BTreeSet::new()));
                let Value::Set(set) = &mut entry.value else {
                    return Err(wrong_type());
                };
                Ok(Reply::Int(i64::from(set.insert(member))))
            },
            Command::SRem { key, member } => {
                let Some(entry) = data.live_mut(&key, now) else {
                    return Ok(Reply::Int(0));
                };
                let Value::Set(set) = &mut entry.value else {
                    return Err(wrong_type());
                };
                let removed = set.remove(&member);
                if set.is_empty() {
                    data.entries.remove(&key);
                }
                Ok(Reply::Int(i64::from(removed)))
            },
            Command::SMembers { key } => match data.live(&key, now).map(|e| &e.value) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Value::Set(set)) => {
                    Ok(Reply::Array(set.iter().cloned().map(Reply::Bulk).collect()))
                },
                Some(_) => Err(wrong_type()),
            },
            Command::RPush { key, value } => {
                let entry = data.or_insert(&key, now, || Value::List(Vec::new()));
                let Value::List(list) = &mut entry.value else {
                    return Err(wrong_type());
                };
                list.push(value);
                Ok(Reply::Int(i64::try_from(list.len()).unwrap_or(i64::MAX)))
            },
            Command::LRange { key, start, stop } => match data.live(&key, now).map(|e| &e.value) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Value::List(list)) => Ok(Reply::Array(
                    normalize_range(list.len(), start, stop)
                        .map(|(from, to)| list[from..=to].iter().cloned().map(Reply::Bulk).collect())
                        .unwrap_or_default(),
                )),
                Some(_) => Err(wrong_type()),
            },
            Command::ZAdd { key, score, member } => {
                let entry = data.or_insert(&key, now, || Value::SortedSet(HashMap::new()));
                let Value::SortedSet(scores) = &mut entry.value else {
                    return Err(wrong_type());
                };
                Ok(Reply::Int(i64::from(scores.insert(member, score).is_none())))
            },
            Command::ZRemRangeByScore { key, min, max } => {
                let Some(entry) = data.live_mut(&key, now) else {
                    return Ok(Reply::Int(0));
                };
                let Value::SortedSet(scores) = &mut entry.value else {
                    return Err(wrong_type());
                };
                let before = scores.len();
                scores.retain(|_, score| !in_score_range(*score, min, max));
                let removed = before - scores.len();
                if scores.is_empty() {
                    data.entries.remove(&key);
                }
                Ok(Reply::Int(i64::try_from(removed).unwrap_or(i64::MAX)))
            },
            Command::ZRange { key, start, stop } => match data.live(&key, now).map(|e| &e.value) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Value::SortedSet(scores)) => {
                    let mut ordered: Vec<(&String, i64)> =
                        scores.iter().map(|(member, score)| (member, *score)).collect();
                    ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                    Ok(Reply::Array(
                        normalize_range(ordered.len(), start, stop)
                            .map(|(from, to)| {
                                ordered[from..=to]
                                    .iter()
                                    .map(|(member, _)| Reply::Bulk((*member).clone()))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    ))
                },
                Some(_) => Err(wrong_type()),
            },
            Command::Publish { channel, message } => {
                Ok(Reply::Int(self.publish(&channel, &message)))
            },
        }
    }

    /// Subscribes to `channel`, ending the subscription with a connection
    /// error when `disconnect` fires.
    pub(crate) fn subscribe_until(
        &self,
        channel: &str,
        disconnect: Option<CancellationToken>,
    ) -> Subscription {
        let mut receiver = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let (feed, subscription) = Subscription::channel_pair(channel);
        let disconnect = disconnect.unwrap_or_default();
        let channel = channel.to_owned();

        tokio::spawn(async move {
            loop {
                select! {
                    () = feed.cancelled() => break,
                    () = disconnect.cancelled() => {
                        feed.send(Err(StoreError::connection("connection reset by peer"))).await;
                        break;
                    },
                    received = receiver.recv() => match received {
                        Ok(message) => {
                            if !feed.send(Ok(message)).await {
                                break;
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %channel, skipped, "subscriber lagged, messages dropped");
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            feed.send(Err(StoreError::connection("channel closed"))).await;
                            break;
                        },
                    },
                }
            }
            tracing::debug!(channel = %channel, "memory subscription ended");
        });

        subscription
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    #[tracing::instrument(skip(self, command), fields(command = command.name()))]
    async fn query(&self, command: Command) -> StoreResult<Reply> {
        fail_point!("memory-query", |_| Err(StoreError::connection("injected query failure")));
        let mut data = self.data.lock();
        self.execute(&mut data, command, Instant::now())
    }

    #[tracing::instrument(skip(self, commands), fields(commands = commands.len()))]
    async fn transaction(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        fail_point!("memory-transaction", |_| {
            Err(StoreError::connection("injected transaction failure"))
        });
        let mut data = self.data.lock();
        let now = Instant::now();
        commands.into_iter().map(|command| self.execute(&mut data, command, now)).collect()
    }

    #[tracing::instrument(skip(self, commands), fields(commands = commands.len()))]
    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let mut data = self.data.lock();
            replies.push(self.execute(&mut data, command, Instant::now())?);
        }
        Ok(replies)
    }

    #[tracing::instrument(skip(self))]
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        Ok(self.subscribe_until(channel, None))
    }

    #[tracing::instrument(skip(self))]
    async fn health_check(&self) -> StoreResult<HealthStatus> {
        fail_point!("memory-health-check", |_| {
            Err(StoreError::internal("injected health check failure"))
        });
        let start = std::time::Instant::now();
        let keys = self.len();
        Ok(HealthStatus::healthy(
            HealthMetadata::new(start.elapsed(), "memory").with_detail("keys", keys.to_string()),
        ))
    }
}

async fn cleanup_expired_keys(data: Weak<Mutex<Dataset>>, mut shutdown_rx: watch::Receiver<()>) {
    loop {
        select! {
            () = sleep(CLEANUP_INTERVAL) => {},
            _ = shutdown_rx.changed() => return,
        }
        let Some(data) = data.upgrade() else {
            return;
        };
        let removed = data.lock().sweep(Instant::now());
        if removed > 0 {
            tracing::trace!(removed, "expired keys swept");
        }
    }
}

fn wrong_type() -> StoreError {
    StoreError::protocol("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn add_to_counter(data: &mut Dataset, key: &str, delta: i64, now: Instant) -> StoreResult<Reply> {
    let entry = data.or_insert(key, now, || Value::Str("0".to_owned()));
    let Value::Str(text) = &mut entry.value else {
        return Err(wrong_type());
    };
    let current: i64 = text
        .parse()
        .map_err(|_| StoreError::protocol("value is not an integer or out of range"))?;
    let next = current
        .checked_add(delta)
        .ok_or_else(|| StoreError::protocol("increment or decrement would overflow"))?;
    *text = next.to_string();
    Ok(Reply::Int(next))
}

fn in_score_range(score: i64, min: ScoreBound, max: ScoreBound) -> bool {
    min.admits_from_below(score) && max.admits_from_above(score)
}

/// Resolves Redis-style inclusive `start..=stop` indices (negative counts
/// from the end) against a collection of length `len`.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// Glob matching as used by `KEYS`: `*`, `?` and `\` escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        let step = match pattern.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ti));
                pi += 1;
                continue;
            },
            Some('?') => Some(1),
            Some('\\') if pi + 1 < pattern.len() => (pattern[pi + 1] == text[ti]).then_some(2),
            Some(&ch) => (ch == text[ti]).then_some(1),
            None => None,
        };
        if let Some(width) = step {
            pi += width;
            ti += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    while pattern.get(pi) == Some(&'*') {
        pi += 1;
    }
    pi == pattern.len()
}

// ============================================================================
// Connector with fault injection
// ============================================================================

struct ConnectionControl {
    connects: AtomicU64,
    refuse: AtomicBool,
    epoch: AtomicU64,
    failing_commands: AtomicU64,
    severed: Mutex<CancellationToken>,
}

/// A [`Connector`] handing out connections to a shared [`MemoryBackend`].
///
/// All connections see the same data, so severing a connection and
/// reconnecting behaves like a Redis client reconnecting to the same server.
#[derive(Clone)]
pub struct MemoryConnector {
    backend: MemoryBackend,
    control: Arc<ConnectionControl>,
}

impl MemoryConnector {
    /// Creates a connector over a fresh backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    /// Creates a connector over an existing backend.
    #[must_use]
    pub fn with_backend(backend: MemoryBackend) -> Self {
        Self {
            backend,
            control: Arc::new(ConnectionControl {
                connects: AtomicU64::new(0),
                refuse: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                failing_commands: AtomicU64::new(0),
                severed: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// The shared backend.
    #[must_use]
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.control.connects.load(Ordering::Acquire)
    }

    /// Makes subsequent `connect` calls fail with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.control.refuse.store(refuse, Ordering::Release);
    }

    /// Breaks every connection handed out so far.
    ///
    /// Commands on those connections fail with a connection error, and their
    /// subscriptions yield one error and end.
    pub fn sever_connections(&self) {
        self.control.epoch.fetch_add(1, Ordering::AcqRel);
        let previous = std::mem::take(&mut *self.control.severed.lock());
        previous.cancel();
    }

    /// Fails the next `count` commands on any connection with a connection error.
    pub fn fail_next_commands(&self, count: u64) {
        self.control.failing_commands.store(count, Ordering::Release);
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> StoreResult<Arc<dyn StoreBackend>> {
        self.control.connects.fetch_add(1, Ordering::AcqRel);
        if self.control.refuse.load(Ordering::Acquire) {
            return Err(StoreError::connection("connection refused"));
        }
        Ok(Arc::new(MemoryConnection {
            backend: self.backend.clone(),
            control: Arc::clone(&self.control),
            epoch: self.control.epoch.load(Ordering::Acquire),
            severed: self.control.severed.lock().clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_owned()
    }
}

struct MemoryConnection {
    backend: MemoryBackend,
    control: Arc<ConnectionControl>,
    epoch: u64,
    severed: CancellationToken,
}

impl MemoryConnection {
    fn check(&self) -> StoreResult<()> {
        if self.control.epoch.load(Ordering::Acquire) != self.epoch {
            return Err(StoreError::connection("connection reset by peer"));
        }
        let injected = self
            .control
            .failing_commands
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::connection("injected connection failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MemoryConnection {
    async fn query(&self, command: Command) -> StoreResult<Reply> {
        self.check()?;
        self.backend.query(command).await
    }

    async fn transaction(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        self.check()?;
        self.backend.transaction(commands).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        self.check()?;
        self.backend.pipeline(commands).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.check()?;
        Ok(self.backend.subscribe_until(channel, Some(self.severed.clone())))
    }

    async fn health_check(&self) -> StoreResult<HealthStatus> {
        self.check()?;
        self.backend.health_check().await
    }
}
