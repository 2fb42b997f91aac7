//! Redis backend for `tollgate-store`.
//!
//! Implements [`StoreBackend`](tollgate_store::StoreBackend) over a single
//! Redis node or a Redis Cluster, using the `redis` crate's multiplexed
//! connections.
//!
//! # Quick Start
//!
//! ```no_run
//! use tollgate_store::{KeySpace, StoreClient};
//! use tollgate_store_redis::{RedisConnector, RedisStoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisStoreConfig::builder()
//!         .hosts(["localhost:6379"])
//!         .password("secret")
//!         .build()?;
//!
//!     let cluster = RedisConnector::new(config)?.into_cluster();
//!     let client = StoreClient::new(cluster, KeySpace::new("apikey-", true));
//!     client.set_key("54321111", "{}", None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error mapping
//!
//! | Redis failure                         | `StoreError`  |
//! |---------------------------------------|---------------|
//! | I/O, dropped or refused connection    | `Connection`  |
//! | `CLUSTERDOWN`, `MASTERDOWN`, `TRYAGAIN`, `LOADING` | `Connection` |
//! | Wrong reply type, server command error | `Protocol`   |
//! | Command exceeded the configured timeout | `Timeout`   |
//! | Authentication, client configuration   | `Internal`   |
//!
//! Only `Connection` errors make the client reconnect.

#![deny(unsafe_code)]

mod backend;
mod config;
mod connector;
mod error;

pub use backend::RedisBackend;
pub use config::RedisStoreConfig;
pub use connector::RedisConnector;
pub use error::{RedisStoreError, Result, redis_error_to_store_error};
