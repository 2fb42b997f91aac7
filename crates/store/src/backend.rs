//! Backend abstraction.
//!
//! [`StoreBackend`] is one live connection (or connection pool) to a
//! Redis-compatible store. [`Connector`] knows how to establish one; the
//! [`StoreCluster`](crate::StoreCluster) calls it lazily and again on reconnect.
//!
//! Both traits are object-safe so the cluster can hold `Arc<dyn StoreBackend>`
//! regardless of whether the connection is in-memory, a single Redis node, or a
//! Redis Cluster.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    command::{Command, Reply},
    error::StoreResult,
    health::HealthStatus,
    pubsub::Subscription,
};

/// A live connection to a key-value store.
///
/// # Error classification
///
/// Implementations must report a lost or refused connection as
/// [`StoreError::Connection`](crate::StoreError::Connection); the client only
/// reconnects on that variant. Replies of the wrong type, server-side command
/// errors and similar must be [`StoreError::Protocol`](crate::StoreError::Protocol).
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Executes a single command.
    async fn query(&self, command: Command) -> StoreResult<Reply>;

    /// Executes `commands` atomically (`MULTI`/`EXEC`).
    ///
    /// No other client observes an intermediate state. Returns one reply per
    /// command, in order.
    async fn transaction(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>>;

    /// Sends `commands` in one round trip without atomicity.
    ///
    /// Returns one reply per command, in order.
    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>>;

    /// Subscribes to `channel`.
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// Probes the store.
    async fn health_check(&self) -> StoreResult<HealthStatus>;
}

/// Establishes connections for a [`StoreCluster`](crate::StoreCluster).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> StoreResult<Arc<dyn StoreBackend>>;

    /// Human-readable target description for logs, without credentials.
    fn describe(&self) -> String;
}
