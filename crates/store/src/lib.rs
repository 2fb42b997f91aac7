//! Key-value store layer for the tollgate admission gateway.
//!
//! Sessions, quota counters, rate-limit windows and health counters all live
//! in a shared Redis-compatible store. This crate provides the access layer:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Gateway (session store, limiters)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │   StoreClient: KeySpace + typed operations + reconnect      │
//! ├─────────────────────────────────────────────────────────────┤
//! │   StoreCluster: lazy, shared, replaceable connection        │
//! ├──────────────────────┬──────────────────────────────────────┤
//! │  MemoryBackend       │  RedisBackend (tollgate-store-redis) │
//! │  (tests, dev)        │  (standalone or cluster)             │
//! └──────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use tollgate_store::{KeySpace, MemoryConnector, StoreClient, StoreCluster};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = StoreCluster::new(MemoryConnector::new());
//!     let sessions = StoreClient::new(cluster, KeySpace::new("apikey-", true));
//!
//!     sessions.set_key("54321111", r#"{"rate":100}"#, None).await?;
//!     assert_eq!(sessions.get_key("54321111").await?, r#"{"rate":100}"#);
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: test helpers and assertion macros, plus the backend conformance suite.
//! - **`failpoints`**: enables `fail` injection points in the in-memory backend.

#![deny(unsafe_code)]

pub mod backend;
pub mod client;
pub mod cluster;
pub mod command;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod health;
pub mod keyspace;
pub mod memory;
pub mod pubsub;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod window;

pub use backend::{Connector, StoreBackend};
pub use client::{MAX_RECONNECT_ATTEMPTS, StoreClient};
pub use cluster::StoreCluster;
pub use command::{Command, Reply, ScoreBound};
pub use error::{BoxError, ConfigError, StoreError, StoreResult};
pub use health::{HealthMetadata, HealthStatus};
pub use keyspace::KeySpace;
pub use memory::{MemoryBackend, MemoryConnector};
pub use pubsub::{Message, Subscription, SubscriptionFeed};
pub use window::WindowObservation;
