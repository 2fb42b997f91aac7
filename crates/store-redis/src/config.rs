//! Configuration for the Redis backend.
//!
//! [`RedisStoreConfig`] describes where the store lives and how long to wait
//! for it. It deserializes from the gateway's configuration file and can be
//! built in code with a validating builder.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tollgate_store::ConfigError;

use crate::error::Result;

/// Default per-command timeout (5 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connection timeout (2 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

/// Configuration for [`RedisConnector`](crate::RedisConnector).
///
/// # Standalone and cluster
///
/// With `enable_cluster` unset, the first entry of `hosts` is used and
/// `database` selects the logical database. With `enable_cluster` set, all
/// hosts seed the cluster topology and only database 0 is available.
/// Subscriptions always go to the first host.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tollgate_store_redis::RedisStoreConfig;
///
/// let config = RedisStoreConfig::builder()
///     .hosts(["localhost:6379"])
///     .database(2)
///     .timeout(Duration::from_secs(1))
///     .build()?;
/// assert_eq!(config.database(), 2);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStoreConfig {
    /// `host:port` pairs.
    pub(crate) hosts: Vec<String>,

    /// Logical database for standalone mode.
    #[serde(default)]
    pub(crate) database: i64,

    /// Password for `AUTH`.
    #[serde(default, skip_serializing)]
    pub(crate) password: Option<String>,

    /// Connect to a Redis Cluster instead of a single node.
    #[serde(default)]
    pub(crate) enable_cluster: bool,

    /// Per-command timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub(crate) timeout: Duration,

    /// Connection establishment timeout.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,
}

#[bon::bon]
impl RedisStoreConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `hosts` is empty or an entry is not `host:port`
    /// - `database` is negative, or non-zero in cluster mode
    /// - either timeout is zero
    #[builder]
    pub fn new(
        #[builder(with = |iter: impl IntoIterator<Item = impl Into<String>>| {
            iter.into_iter().map(Into::into).collect()
        })]
        hosts: Vec<String>,
        #[builder(default)] database: i64,
        #[builder(into)] password: Option<String>,
        #[builder(default)] enable_cluster: bool,
        #[builder(default = DEFAULT_TIMEOUT)] timeout: Duration,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
    ) -> Result<Self> {
        let config = Self { hosts, database, password, enable_cluster, timeout, connect_timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration, for instance one obtained by deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Empty { field: "hosts" });
        }
        for host in &self.hosts {
            split_host(host)?;
        }
        if self.database < 0 {
            return Err(ConfigError::Invalid {
                field: "database",
                reason: format!("must not be negative, got {}", self.database),
            });
        }
        if self.enable_cluster && self.database != 0 {
            return Err(ConfigError::Invalid {
                field: "database",
                reason: "cluster mode only supports database 0".into(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "timeout",
                value: format!("{:?}", self.timeout),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "connect_timeout",
                value: format!("{:?}", self.connect_timeout),
            });
        }
        Ok(())
    }

    /// The configured `host:port` pairs.
    #[must_use]
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// The logical database.
    #[must_use]
    pub fn database(&self) -> i64 {
        self.database
    }

    /// Whether cluster mode is enabled.
    #[must_use]
    pub fn enable_cluster(&self) -> bool {
        self.enable_cluster
    }

    /// The per-command timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// A log-safe description of the target.
    #[must_use]
    pub fn describe(&self) -> String {
        let scheme = if self.enable_cluster { "redis-cluster" } else { "redis" };
        format!("{scheme}://{}", self.hosts.join(","))
    }

    /// Connection URL for one node.
    ///
    /// The database is only part of the URL in standalone mode.
    pub(crate) fn node_url(&self, host: &str) -> String {
        let auth = self
            .password
            .as_deref()
            .map(|password| format!(":{}@", encode_userinfo(password)))
            .unwrap_or_default();
        if self.enable_cluster {
            format!("redis://{auth}{host}")
        } else {
            format!("redis://{auth}{host}/{}", self.database)
        }
    }

    /// The first configured host. Validation guarantees there is one.
    pub(crate) fn primary_host(&self) -> std::result::Result<&str, ConfigError> {
        self.hosts.first().map(String::as_str).ok_or(ConfigError::Empty { field: "hosts" })
    }
}

fn split_host(host: &str) -> std::result::Result<(&str, u16), ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid { field: "hosts", reason };
    let (name, port) =
        host.rsplit_once(':').ok_or_else(|| invalid(format!("{host:?} is not host:port")))?;
    if name.is_empty() {
        return Err(invalid(format!("{host:?} has an empty host name")));
    }
    let port = port.parse().map_err(|_| invalid(format!("{host:?} has an invalid port")))?;
    Ok((name, port))
}

/// Percent-encodes characters that would break the userinfo part of a URL.
fn encode_userinfo(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
