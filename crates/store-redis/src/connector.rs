//! [`Connector`] that opens [`RedisBackend`] connections.

use std::sync::Arc;

use async_trait::async_trait;
use tollgate_store::{Connector, StoreBackend, StoreCluster, StoreResult};

use crate::{backend::RedisBackend, config::RedisStoreConfig, error::Result};

/// Opens Redis connections for a [`StoreCluster`].
///
/// The cluster calls [`connect`](Connector::connect) on first use and again
/// whenever a command fails with a connection error.
///
/// ```no_run
/// use tollgate_store::{KeySpace, StoreClient};
/// use tollgate_store_redis::{RedisConnector, RedisStoreConfig};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RedisStoreConfig::builder().hosts(["localhost:6379"]).build()?;
/// let cluster = RedisConnector::new(config)?.into_cluster();
/// let sessions = StoreClient::new(cluster, KeySpace::new("apikey-", true));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: RedisStoreConfig,
}

impl RedisConnector {
    /// Creates a connector after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The connection configuration.
    #[must_use]
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// Wraps this connector in a lazily connecting [`StoreCluster`].
    #[must_use]
    pub fn into_cluster(self) -> StoreCluster {
        StoreCluster::new(self)
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> StoreResult<Arc<dyn StoreBackend>> {
        let backend = RedisBackend::connect(&self.config).await?;
        Ok(Arc::new(backend))
    }

    fn describe(&self) -> String {
        self.config.describe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_hides_password() {
        let config = RedisStoreConfig::builder()
            .hosts(["cache.internal:6379"])
            .password("hunter2")
            .build()
            .unwrap();
        let connector = RedisConnector::new(config).unwrap();
        assert_eq!(connector.describe(), "redis://cache.internal:6379");
    }

    #[test]
    fn test_cluster_starts_disconnected() {
        let config = RedisStoreConfig::builder().hosts(["localhost:6379"]).build().unwrap();
        let cluster = RedisConnector::new(config).unwrap().into_cluster();
        assert!(!cluster.is_connected());
        assert_eq!(cluster.connect_attempts(), 0);
    }
}
