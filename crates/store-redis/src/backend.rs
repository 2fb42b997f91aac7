//! Redis-backed implementation of [`StoreBackend`].

use std::{future::Future, time::{Duration, Instant}};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{
    Client, Cmd, Pipeline, RedisResult, Value, aio::ConnectionManager, cluster::ClusterClient,
    cluster_async::ClusterConnection,
};
use tollgate_store::{
    Command, HealthMetadata, HealthStatus, Message, Reply, StoreBackend, StoreError, StoreResult,
    Subscription, SubscriptionFeed, command::ttl_seconds,
};

use crate::{
    config::RedisStoreConfig,
    error::{RedisStoreError, Result, redis_error_to_store_error},
};

/// A `PING` slower than this marks the store as degraded.
const SLOW_PING: Duration = Duration::from_millis(250);

#[derive(Clone)]
enum Handle {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl Handle {
    fn name(&self) -> &'static str {
        match self {
            Self::Single(_) => "redis",
            Self::Cluster(_) => "redis-cluster",
        }
    }
}

/// A connection to a standalone Redis node or a Redis Cluster.
///
/// Standalone connections go through a [`ConnectionManager`], cluster
/// connections through a [`ClusterConnection`]. Both are cheap to clone, so
/// every command runs on its own clone and concurrent callers never wait on a
/// lock. Subscriptions open a dedicated connection to the first configured
/// host.
///
/// Every command is bounded by the configured timeout, which surfaces as
/// [`StoreError::Timeout`].
#[derive(Clone)]
pub struct RedisBackend {
    handle: Handle,
    pubsub_client: Client,
    timeout: Duration,
    connect_timeout: Duration,
    target: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("target", &self.target)
            .field("mode", &self.handle.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects according to `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - A node URL cannot be parsed
    /// - The connection is not established within the connect timeout
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        config.validate()?;
        let target = config.describe();
        let primary = config.primary_host()?;
        let pubsub_client = Client::open(config.node_url(primary))?;

        let handle = if config.enable_cluster() {
            let nodes: Vec<String> = config.hosts().iter().map(|host| config.node_url(host)).collect();
            let client = ClusterClient::new(nodes)?;
            let connection = bounded_connect(&target, config.connect_timeout(), client.get_async_connection()).await?;
            Handle::Cluster(connection)
        } else {
            let manager =
                bounded_connect(&target, config.connect_timeout(), pubsub_client.get_connection_manager())
                    .await?;
            Handle::Single(manager)
        };

        tracing::info!(target_store = %target, "connected to redis");
        Ok(Self {
            handle,
            pubsub_client,
            timeout: config.timeout(),
            connect_timeout: config.connect_timeout(),
            target,
        })
    }

    /// Log-safe description of the connected target.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn run_cmd(&self, cmd: &Cmd) -> RedisResult<Value> {
        match &self.handle {
            Handle::Single(manager) => cmd.query_async(&mut manager.clone()).await,
            Handle::Cluster(connection) => cmd.query_async(&mut connection.clone()).await,
        }
    }

    async fn run_pipe(&self, pipe: &Pipeline) -> RedisResult<Vec<Value>> {
        match &self.handle {
            Handle::Single(manager) => pipe.query_async(&mut manager.clone()).await,
            Handle::Cluster(connection) => pipe.query_async(&mut connection.clone()).await,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(redis_error_to_store_error),
            Err(_) => {
                tracing::warn!(operation, timeout = ?self.timeout, "redis command timed out");
                Err(StoreError::timeout())
            },
        }
    }

    async fn batch(&self, operation: &'static str, commands: Vec<Command>, atomic: bool) -> StoreResult<Vec<Reply>> {
        let expected = commands.len();
        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }
        let values = self.bounded(operation, self.run_pipe(&pipe)).await?;
        if values.len() != expected {
            return Err(StoreError::protocol(format!(
                "{operation} returned {} replies for {expected} commands",
                values.len()
            )));
        }
        values.into_iter().map(to_reply).collect()
    }
}

async fn bounded_connect<T>(
    target: &str,
    timeout: Duration,
    fut: impl Future<Output = RedisResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RedisStoreError::ConnectTimeout { target: target.to_owned(), timeout }),
    }
}

/// Builds the wire command for a store command.
pub(crate) fn to_cmd(command: &Command) -> Cmd {
    match command {
        Command::Get { key } => redis::cmd("GET").arg(key).clone(),
        Command::Set { key, value, ttl } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl
                && !ttl.is_zero()
            {
                cmd.arg("EX").arg(ttl_seconds(*ttl));
            }
            cmd
        },
        Command::Del { keys } => redis::cmd("DEL").arg(keys).clone(),
        Command::Incr { key } => redis::cmd("INCR").arg(key).clone(),
        Command::Decr { key } => redis::cmd("DECR").arg(key).clone(),
        Command::Expire { key, ttl } => redis::cmd("EXPIRE").arg(key).arg(ttl_seconds(*ttl)).clone(),
        Command::Ttl { key } => redis::cmd("TTL").arg(key).clone(),
        Command::Keys { pattern } => redis::cmd("KEYS").arg(pattern).clone(),
        Command::MGet { keys } => redis::cmd("MGET").arg(keys).clone(),
        Command::SAdd { key, member } => redis::cmd("SADD").arg(key).arg(member).clone(),
        Command::SRem { key, member } => redis::cmd("SREM").arg(key).arg(member).clone(),
        Command::SMembers { key } => redis::cmd("SMEMBERS").arg(key).clone(),
        Command::RPush { key, value } => redis::cmd("RPUSH").arg(key).arg(value).clone(),
        Command::LRange { key, start, stop } => {
            redis::cmd("LRANGE").arg(key).arg(*start).arg(*stop).clone()
        },
        Command::ZAdd { key, score, member } => {
            redis::cmd("ZADD").arg(key).arg(*score).arg(member).clone()
        },
        Command::ZRemRangeByScore { key, min, max } => {
            redis::cmd("ZREMRANGEBYSCORE").arg(key).arg(min.to_string()).arg(max.to_string()).clone()
        },
        Command::ZRange { key, start, stop } => {
            redis::cmd("ZRANGE").arg(key).arg(*start).arg(*stop).clone()
        },
        Command::Publish { channel, message } => {
            redis::cmd("PUBLISH").arg(channel).arg(message).clone()
        },
    }
}

/// Converts a wire reply.
pub(crate) fn to_reply(value: Value) -> StoreResult<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Ok),
        Value::Int(n) => Ok(Reply::Int(n)),
        Value::SimpleString(s) if s == "OK" => Ok(Reply::Ok),
        Value::SimpleString(s) => Ok(Reply::Bulk(s)),
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(Reply::Bulk)
            .map_err(|e| StoreError::serialization_with_source("reply is not valid UTF-8", e)),
        Value::VerbatimString { text, .. } => Ok(Reply::Bulk(text)),
        Value::Double(d) => Ok(Reply::Bulk(d.to_string())),
        Value::Boolean(b) => Ok(Reply::Int(i64::from(b))),
        Value::Array(items) | Value::Set(items) => {
            items.into_iter().map(to_reply).collect::<StoreResult<Vec<_>>>().map(Reply::Array)
        },
        other => Err(StoreError::protocol(format!("unsupported redis reply: {other:?}"))),
    }
}

async fn forward_messages(pubsub: redis::aio::PubSub, feed: SubscriptionFeed, channel: String) {
    let messages = pubsub.into_on_message();
    tokio::pin!(messages);

    loop {
        tokio::select! {
            () = feed.cancelled() => {
                tracing::debug!(channel = %channel, "subscription cancelled");
                return;
            },
            next = messages.next() => match next {
                Some(msg) => match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if !feed.send(Ok(Message::new(msg.get_channel_name(), payload))).await {
                            return;
                        }
                    },
                    Err(err) => {
                        tracing::warn!(channel = %channel, error = %err, "dropping undecodable message");
                    },
                },
                None => {
                    tracing::warn!(channel = %channel, "redis subscription stream ended");
                    feed.send(Err(StoreError::connection("redis subscription connection lost"))).await;
                    return;
                },
            },
        }
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    #[tracing::instrument(skip(self, command), fields(command = command.name()))]
    async fn query(&self, command: Command) -> StoreResult<Reply> {
        let cmd = to_cmd(&command);
        let value = self.bounded(command.name(), self.run_cmd(&cmd)).await?;
        to_reply(value)
    }

    #[tracing::instrument(skip(self, commands), fields(commands = commands.len()))]
    async fn transaction(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        self.batch("transaction", commands, true).await
    }

    #[tracing::instrument(skip(self, commands), fields(commands = commands.len()))]
    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        self.batch("pipeline", commands, false).await
    }

    #[tracing::instrument(skip(self))]
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = match tokio::time::timeout(self.connect_timeout, self.pubsub_client.get_async_pubsub()).await {
            Ok(result) => result.map_err(redis_error_to_store_error)?,
            Err(_) => {
                return Err(StoreError::connection(format!(
                    "opening a subscription to {} timed out",
                    self.target
                )));
            },
        };
        self.bounded("subscribe", pubsub.subscribe(channel)).await?;

        let (feed, subscription) = Subscription::channel_pair(channel);
        tokio::spawn(forward_messages(pubsub, feed, channel.to_owned()));
        Ok(subscription)
    }

    async fn health_check(&self) -> StoreResult<HealthStatus> {
        let start = Instant::now();
        let result = self.bounded("ping", self.run_cmd(&redis::cmd("PING"))).await;
        let elapsed = start.elapsed();
        let metadata = HealthMetadata::new(elapsed, self.handle.name()).with_detail("target", self.target.clone());

        Ok(match result {
            Ok(_) if elapsed > SLOW_PING => {
                HealthStatus::degraded(metadata, format!("PING took {elapsed:?}"))
            },
            Ok(_) => HealthStatus::healthy(metadata),
            Err(err) => {
                tracing::warn!(target_store = %self.target, error = %err, "redis health check failed");
                HealthStatus::unhealthy(metadata, err.to_string())
            },
        })
    }
}
