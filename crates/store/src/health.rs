//! Health check types for store backends.
//!
//! [`StoreBackend::health_check`](crate::StoreBackend::health_check) reports a
//! [`HealthStatus`] carrying [`HealthMetadata`] with the probe latency and
//! backend name.
//!
//! | `HealthStatus` | Meaning                                          |
//! |----------------|--------------------------------------------------|
//! | `Healthy`      | Store answers commands normally                  |
//! | `Degraded`     | Store answers, but slowly or from a partial view |
//! | `Unhealthy`    | Store cannot serve admission checks              |

use std::{collections::HashMap, fmt, time::Duration};

/// Health status returned by a backend probe.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// Backend is fully operational.
    Healthy(HealthMetadata),
    /// Backend is operational but with reduced capability.
    Degraded(HealthMetadata, String),
    /// Backend cannot serve traffic reliably.
    Unhealthy(HealthMetadata, String),
}

impl HealthStatus {
    /// Creates a `Healthy` status.
    #[must_use = "creating a status has no side effects"]
    pub fn healthy(metadata: HealthMetadata) -> Self {
        Self::Healthy(metadata)
    }

    /// Creates a `Degraded` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn degraded(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Degraded(metadata, reason.into())
    }

    /// Creates an `Unhealthy` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn unhealthy(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Unhealthy(metadata, reason.into())
    }

    /// Returns `true` if the backend is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }

    /// Returns `true` if admission checks can be served (healthy or degraded).
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unhealthy(..))
    }

    /// The metadata attached to this status.
    #[must_use]
    pub fn metadata(&self) -> &HealthMetadata {
        match self {
            Self::Healthy(meta) | Self::Degraded(meta, _) | Self::Unhealthy(meta, _) => meta,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy(_) => write!(f, "healthy"),
            Self::Degraded(_, reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(_, reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// Timing and backend details for a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMetadata {
    /// How long the probe took.
    pub check_duration: Duration,
    /// Backend identifier (`"memory"`, `"redis"`, `"redis-cluster"`).
    pub backend_name: String,
    /// Free-form details, such as the node that answered.
    pub details: HashMap<String, String>,
}

impl HealthMetadata {
    /// Creates metadata without details.
    #[must_use]
    pub fn new(check_duration: Duration, backend_name: impl Into<String>) -> Self {
        Self { check_duration, backend_name: backend_name.into(), details: HashMap::new() }
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
