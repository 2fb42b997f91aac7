//! High-level store operations over a shared cluster.
//!
//! [`StoreClient`] pairs a [`StoreCluster`] with a [`KeySpace`]. Methods taking
//! a *logical* key map it through [`KeySpace::fix_key`]; the `raw` variants
//! and the counter/window helpers take physical keys unchanged.
//!
//! # Reconnect policy
//!
//! Every operation runs through one bounded loop: if the connection fails with
//! [`StoreError::Connection`], the client asks the cluster for a fresh
//! connection and retries once. A second failure, or any other kind of error,
//! is returned to the caller. Callers never see a request half-applied on two
//! different connections: the retry re-sends the whole command (or the whole
//! transaction).

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    backend::StoreBackend,
    cluster::{Lease, StoreCluster},
    command::{Command, Reply},
    error::{StoreError, StoreResult},
    keyspace::KeySpace,
    pubsub::{Message, Subscription},
};

/// Reconnect attempts per operation after a connection failure.
pub const MAX_RECONNECT_ATTEMPTS: usize = 1;

/// Store operations scoped to one key namespace.
#[derive(Debug, Clone)]
pub struct StoreClient {
    cluster: StoreCluster,
    key_space: KeySpace,
}

impl StoreClient {
    /// Creates a client over `cluster` using `key_space` for logical keys.
    #[must_use]
    pub fn new(cluster: StoreCluster, key_space: KeySpace) -> Self {
        Self { cluster, key_space }
    }

    /// The key namespace of this client.
    #[must_use]
    pub fn key_space(&self) -> &KeySpace {
        &self.key_space
    }

    /// The underlying cluster handle.
    #[must_use]
    pub fn cluster(&self) -> &StoreCluster {
        &self.cluster
    }

    /// A client sharing this cluster but using another namespace.
    #[must_use]
    pub fn with_key_space(&self, key_space: KeySpace) -> Self {
        Self { cluster: self.cluster.clone(), key_space }
    }

    /// Runs `op` against the current connection, reconnecting at most
    /// [`MAX_RECONNECT_ATTEMPTS`] times on connection failure.
    pub(crate) async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> StoreResult<T>
    where
        F: FnMut(Arc<dyn StoreBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let Lease { mut backend, mut generation } = self.cluster.lease().await?;
        let mut attempt = 0;
        loop {
            match op(Arc::clone(&backend)).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_connection() && attempt < MAX_RECONNECT_ATTEMPTS => {
                    attempt += 1;
                    tracing::info!(operation, attempt, error = %err, "store connection lost, reconnecting");
                    Lease { backend, generation } = self.cluster.reconnect(generation).await?;
                },
                Err(err) => {
                    tracing::debug!(operation, error = %err, "store operation failed");
                    return Err(err);
                },
            }
        }
    }

    pub(crate) async fn query(&self, operation: &'static str, command: Command) -> StoreResult<Reply> {
        self.run(operation, |backend| {
            let command = command.clone();
            async move { backend.query(command).await }
        })
        .await
    }

    pub(crate) async fn transaction(
        &self,
        operation: &'static str,
        commands: Vec<Command>,
    ) -> StoreResult<Vec<Reply>> {
        self.run(operation, |backend| {
            let commands = commands.clone();
            async move { backend.transaction(commands).await }
        })
        .await
    }

    pub(crate) async fn pipeline(
        &self,
        operation: &'static str,
        commands: Vec<Command>,
    ) -> StoreResult<Vec<Reply>> {
        self.run(operation, |backend| {
            let commands = commands.clone();
            async move { backend.pipeline(commands).await }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Reads the value of a logical key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key does not exist.
    #[tracing::instrument(skip(self, key))]
    pub async fn get_key(&self, key: &str) -> StoreResult<String> {
        let physical = self.key_space.fix_key(key);
        self.get_physical(physical).await.map_err(|err| match err {
            StoreError::NotFound { .. } => StoreError::not_found(key),
            other => other,
        })
    }

    /// Reads the value of a physical key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_raw_key(&self, key: &str) -> StoreResult<String> {
        self.get_physical(key.to_owned()).await
    }

    async fn get_physical(&self, key: String) -> StoreResult<String> {
        let reply = self.query("get", Command::Get { key: key.clone() }).await?;
        reply.into_optional_string()?.ok_or_else(|| StoreError::not_found(key))
    }

    /// Writes a logical key. A zero or absent `ttl` stores it without expiry.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    #[tracing::instrument(skip(self, key, value))]
    pub async fn set_key(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.set_physical(self.key_space.fix_key(key), value, ttl).await
    }

    /// Writes a physical key. A zero or absent `ttl` stores it without expiry.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    #[tracing::instrument(skip(self, value))]
    pub async fn set_raw_key(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.set_physical(key.to_owned(), value, ttl).await
    }

    async fn set_physical(&self, key: String, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let ttl = ttl.filter(|ttl| !ttl.is_zero());
        let command = Command::Set { key, value: value.to_owned(), ttl };
        self.query("set", command).await?.into_ok()
    }

    /// Remaining lifetime of a logical key in seconds, `-1` if it never expires.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key does not exist.
    #[tracing::instrument(skip(self, key))]
    pub async fn get_exp(&self, key: &str) -> StoreResult<i64> {
        let physical = self.key_space.fix_key(key);
        match self.query("ttl", Command::Ttl { key: physical }).await?.into_int()? {
            -2 => Err(StoreError::not_found(key)),
            seconds => Ok(seconds),
        }
    }

    /// Decrements the counter at a logical key. A missing key counts from zero.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] if the key holds a non-integer value.
    #[tracing::instrument(skip(self, key))]
    pub async fn decrement(&self, key: &str) -> StoreResult<i64> {
        let physical = self.key_space.fix_key(key);
        self.query("decr", Command::Decr { key: physical }).await?.into_int()
    }

    /// Increments the counter at a physical key and returns the new value.
    ///
    /// A counter without an expiry is given an `expire` lifetime, so it lives
    /// for one period from its first use. `INCR` and `TTL` run in one
    /// transaction, and a counter whose `EXPIRE` was lost gets it on the next
    /// increment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] if the key holds a non-integer value.
    #[tracing::instrument(skip(self))]
    pub async fn increment_with_expire(&self, key: &str, expire: Duration) -> StoreResult<i64> {
        let commands =
            vec![Command::Incr { key: key.to_owned() }, Command::Ttl { key: key.to_owned() }];
        let mut replies = self.transaction("incr", commands).await?.into_iter();
        let (Some(value), Some(ttl)) = (replies.next(), replies.next()) else {
            tracing::warn!("short transaction result for increment");
            return Err(StoreError::protocol("INCR/TTL transaction returned too few replies"));
        };
        let value = value.into_int()?;
        if ttl.into_int()? == -1 && !expire.is_zero() {
            if value != 1 {
                tracing::warn!(value, "counter had no expiry, setting it");
            }
            self.query("expire", Command::Expire { key: key.to_owned(), ttl: expire }).await?;
        }
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Enumeration and deletion
    // ------------------------------------------------------------------

    /// Logical keys (with the prefix removed) starting with `filter`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the scan fails.
    #[tracing::instrument(skip(self))]
    pub async fn get_keys(&self, filter: &str) -> StoreResult<Vec<String>> {
        let physical = self.physical_keys(filter).await?;
        Ok(physical.iter().map(|key| self.key_space.clean_key(key)).collect())
    }

    /// All logical keys of the namespace with their values.
    ///
    /// # Errors
    ///
    /// Returns the store error if the scan or the read fails.
    pub async fn get_keys_and_values(&self) -> StoreResult<HashMap<String, String>> {
        self.get_keys_and_values_with_filter("").await
    }

    /// Logical keys starting with `filter`, with their values.
    ///
    /// Keys that disappear between the scan and the read are skipped.
    ///
    /// # Errors
    ///
    /// Returns the store error if the scan or the read fails.
    #[tracing::instrument(skip(self))]
    pub async fn get_keys_and_values_with_filter(
        &self,
        filter: &str,
    ) -> StoreResult<HashMap<String, String>> {
        let physical = self.physical_keys(filter).await?;
        if physical.is_empty() {
            return Ok(HashMap::new());
        }
        let values =
            self.query("mget", Command::MGet { keys: physical.clone() }).await?.into_optional_strings()?;
        if values.len() != physical.len() {
            return Err(StoreError::protocol(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                physical.len()
            )));
        }
        Ok(physical
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (self.key_space.clean_key(key), value)))
            .collect())
    }

    async fn physical_keys(&self, filter: &str) -> StoreResult<Vec<String>> {
        let pattern = self.key_space.pattern(filter);
        self.query("keys", Command::Keys { pattern }).await?.into_strings()
    }

    /// Deletes a logical key. Returns whether a key was removed.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    #[tracing::instrument(skip(self, key))]
    pub async fn delete_key(&self, key: &str) -> StoreResult<bool> {
        let physical = self.key_space.fix_key(key);
        Ok(self.delete_physical("del", vec![physical]).await? > 0)
    }

    /// Deletes a physical key. Returns whether a key was removed.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    #[tracing::instrument(skip(self))]
    pub async fn delete_raw_key(&self, key: &str) -> StoreResult<bool> {
        Ok(self.delete_physical("del", vec![key.to_owned()]).await? > 0)
    }

    /// Deletes several logical keys. An empty list is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    #[tracing::instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn delete_keys(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            tracing::debug!("no keys to delete");
            return Ok(0);
        }
        let physical = keys.iter().map(|key| self.key_space.fix_key(key)).collect();
        self.delete_physical("del", physical).await
    }

    /// Deletes keys formed as `prefix + key`, bypassing the namespace and hashing.
    /// An empty list is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    #[tracing::instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn delete_raw_keys(&self, keys: &[String], prefix: &str) -> StoreResult<u64> {
        if keys.is_empty() {
            tracing::debug!("no keys to delete");
            return Ok(0);
        }
        let physical = keys.iter().map(|key| format!("{prefix}{key}")).collect();
        self.delete_physical("del", physical).await
    }

    async fn delete_physical(&self, operation: &'static str, keys: Vec<String>) -> StoreResult<u64> {
        let removed = self.query(operation, Command::Del { keys }).await?.into_int()?;
        Ok(u64::try_from(removed).unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Lists and sets
    // ------------------------------------------------------------------

    /// Reads and deletes the list at a physical key in one transaction.
    ///
    /// Returns an empty list when the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns the store error if the transaction fails.
    #[tracing::instrument(skip(self))]
    pub async fn get_and_delete_set(&self, key: &str) -> StoreResult<Vec<String>> {
        let commands = vec![
            Command::LRange { key: key.to_owned(), start: 0, stop: -1 },
            Command::Del { keys: vec![key.to_owned()] },
        ];
        let mut replies = self.transaction("lrange_del", commands).await?;
        if replies.is_empty() {
            return Err(StoreError::protocol("transaction returned no replies"));
        }
        replies.swap_remove(0).into_strings()
    }

    /// Appends `value` to the list at a physical key.
    ///
    /// # Errors
    ///
    /// Returns the store error if the push fails.
    #[tracing::instrument(skip(self, value))]
    pub async fn append_to_set(&self, key: &str, value: &str) -> StoreResult<()> {
        let command = Command::RPush { key: key.to_owned(), value: value.to_owned() };
        self.query("rpush", command).await?.into_int().map(drop)
    }

    /// Members of the set at a physical key.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    #[tracing::instrument(skip(self))]
    pub async fn get_set(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        let reply = self.query("smembers", Command::SMembers { key: key.to_owned() }).await?;
        Ok(reply.into_strings()?.into_iter().collect())
    }

    /// Adds `member` to the set at a physical key.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    #[tracing::instrument(skip(self))]
    pub async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let command = Command::SAdd { key: key.to_owned(), member: member.to_owned() };
        self.query("sadd", command).await?.into_int().map(drop)
    }

    /// Removes `member` from the set at a physical key.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    #[tracing::instrument(skip(self))]
    pub async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let command = Command::SRem { key: key.to_owned(), member: member.to_owned() };
        self.query("srem", command).await?.into_int().map(drop)
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publishes `message` on `channel`. Returns the number of receivers.
    ///
    /// # Errors
    ///
    /// Returns the store error if the publish fails.
    #[tracing::instrument(skip(self, message))]
    pub async fn publish(&self, channel: &str, message: &str) -> StoreResult<i64> {
        let command = Command::Publish { channel: channel.to_owned(), message: message.to_owned() };
        self.query("publish", command).await?.into_int()
    }

    /// Subscribes to `channel`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the subscription cannot be established.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.run("subscribe", |backend| {
            let channel = channel.to_owned();
            async move { backend.subscribe(&channel).await }
        })
        .await
    }

    /// Subscribes to `channel` and feeds every message to `callback`.
    ///
    /// Returns `Ok(())` once `cancel` fires, or the error that ended the
    /// subscription. The caller decides whether to start a new handler.
    ///
    /// # Errors
    ///
    /// Returns the store error if subscribing fails or the subscription breaks.
    pub async fn start_pubsub_handler<F>(
        &self,
        channel: &str,
        cancel: CancellationToken,
        mut callback: F,
    ) -> StoreResult<()>
    where
        F: FnMut(Message) + Send,
    {
        let mut subscription = match self.subscribe(channel).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::error!(channel, error = %err, "failed to subscribe");
                return Err(err);
            },
        };
        tracing::info!(channel, "pub/sub handler started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    subscription.cancel();
                    tracing::info!(channel, "pub/sub handler stopped");
                    return Ok(());
                },
                item = subscription.next() => match item {
                    Some(Ok(message)) => callback(message),
                    Some(Err(err)) => {
                        tracing::error!(channel, error = %err, "pub/sub connection failed");
                        return Err(err);
                    },
                    None => return Ok(()),
                },
            }
        }
    }
}
