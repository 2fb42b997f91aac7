//! Error types for the Redis backend.
//!
//! [`RedisStoreError`] covers configuration and connection setup. Command
//! failures are translated straight into [`StoreError`] by
//! [`redis_error_to_store_error`], which decides whether the client may answer
//! them with a reconnect.

use std::time::Duration;

use redis::{ErrorKind, RedisError};
use thiserror::Error;
use tollgate_store::{ConfigError, StoreError};

/// Result type alias for Redis backend setup.
pub type Result<T> = std::result::Result<T, RedisStoreError>;

/// Errors specific to the Redis backend.
#[derive(Debug, Error)]
pub enum RedisStoreError {
    /// Error from the Redis client.
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The connection could not be established in time.
    #[error("Connecting to {target} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target description, without credentials.
        target: String,
        /// The configured connect timeout.
        timeout: Duration,
    },
}

impl From<RedisStoreError> for StoreError {
    fn from(err: RedisStoreError) -> Self {
        match err {
            RedisStoreError::Redis(source) => redis_error_to_store_error(source),
            RedisStoreError::Config(source) => {
                StoreError::internal_with_source("invalid redis configuration", source)
            },
            RedisStoreError::ConnectTimeout { target, timeout } => {
                StoreError::connection(format!("connecting to {target} timed out after {timeout:?}"))
            },
        }
    }
}

/// Converts a Redis client error to a store error.
///
/// Lost, refused and I/O-failed connections, as well as cluster topology
/// hiccups, become [`StoreError::Connection`]. Wrong-type replies and
/// server-side command errors become [`StoreError::Protocol`].
#[must_use]
pub fn redis_error_to_store_error(err: RedisError) -> StoreError {
    if err.is_timeout() {
        tracing::warn!(error = %err, "redis operation timed out");
        return StoreError::timeout();
    }
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        return StoreError::connection_with_source("redis connection failed", err);
    }

    match err.kind() {
        ErrorKind::ClusterDown | ErrorKind::MasterDown | ErrorKind::TryAgain | ErrorKind::BusyLoadingError => {
            StoreError::connection_with_source("redis node unavailable", err)
        },
        ErrorKind::TypeError => StoreError::protocol_with_source("unexpected redis reply type", err),
        ErrorKind::ResponseError | ErrorKind::ExecAbortError => {
            StoreError::protocol_with_source("redis rejected the command", err)
        },
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => {
            StoreError::internal_with_source("redis client configuration rejected", err)
        },
        _ => StoreError::internal_with_source("redis error", err),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn io_failures_map_to_connection() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(redis_error_to_store_error(err).is_connection());
    }

    #[test]
    fn type_errors_map_to_protocol() {
        let err = RedisError::from((ErrorKind::TypeError, "not an integer"));
        assert!(matches!(redis_error_to_store_error(err), StoreError::Protocol { .. }));
    }

    #[test]
    fn response_errors_map_to_protocol() {
        let err = RedisError::from((ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(matches!(redis_error_to_store_error(err), StoreError::Protocol { .. }));
    }

    #[test]
    fn cluster_down_is_retryable() {
        let err = RedisError::from((ErrorKind::ClusterDown, "cluster down"));
        assert!(redis_error_to_store_error(err).is_connection());
    }

    #[test]
    fn auth_failure_is_internal() {
        let err = RedisError::from((ErrorKind::AuthenticationFailed, "bad password"));
        assert!(matches!(redis_error_to_store_error(err), StoreError::Internal { .. }));
    }

    #[test]
    fn config_errors_convert() {
        let err = RedisStoreError::from(ConfigError::Empty { field: "hosts" });
        assert!(matches!(StoreError::from(err), StoreError::Internal { .. }));
    }

    #[test]
    fn connect_timeout_is_a_connection_error() {
        let err = RedisStoreError::ConnectTimeout {
            target: "redis://localhost:6379".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(StoreError::from(err).is_connection());
    }
}
