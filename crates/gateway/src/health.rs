//! Per-API health counters.
//!
//! Every admission decision can be recorded as a [`HealthEvent`] in a rolling
//! window keyed `apihealth.<api_id>.<event>`. The window length bounds how far
//! back [`HealthRecorder::count`] looks.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use tollgate_store::{KeySpace, StoreClient, StoreCluster, keyspace::HEALTH_PREFIX};

use crate::error::{RejectionReason, Result};

/// Default length of the health window.
pub const DEFAULT_HEALTH_WINDOW: Duration = Duration::from_secs(60);

/// A kind of event counted per API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthEvent {
    /// A request reached the pipeline.
    Request,
    /// A request carried a missing, unknown or expired key.
    KeyFailure,
    /// A request was rate limited.
    ThrottledRequest,
    /// A request hit its quota.
    QuotaViolation,
}

impl HealthEvent {
    /// Name used in the store key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::KeyFailure => "KeyFailure",
            Self::ThrottledRequest => "ThrottledRequest",
            Self::QuotaViolation => "QuotaViolation",
        }
    }

    /// The event a rejection counts as, if any.
    #[must_use]
    pub fn for_rejection(reason: RejectionReason) -> Option<Self> {
        match reason {
            RejectionReason::AuthFailed | RejectionReason::Expired => Some(Self::KeyFailure),
            RejectionReason::RateLimited => Some(Self::ThrottledRequest),
            RejectionReason::QuotaExceeded => Some(Self::QuotaViolation),
            RejectionReason::IpBlocked
            | RejectionReason::VersionNotAllowed
            | RejectionReason::AccessDenied
            | RejectionReason::StoreUnavailable => None,
        }
    }
}

impl fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records health events in rolling windows.
#[derive(Debug, Clone)]
pub struct HealthRecorder {
    client: StoreClient,
    window: Duration,
}

impl HealthRecorder {
    /// Uses `client` as is, with the default window.
    #[must_use]
    pub fn new(client: StoreClient) -> Self {
        Self { client, window: DEFAULT_HEALTH_WINDOW }
    }

    /// A recorder on `cluster` under the `apihealth.` namespace. Keys are not
    /// hashed so they stay readable.
    #[must_use]
    pub fn from_cluster(cluster: StoreCluster) -> Self {
        Self::new(StoreClient::new(cluster, KeySpace::new(HEALTH_PREFIX, false)))
    }

    /// Sets the window length.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// The window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records `event` for `api_id` now. Returns the number of earlier events in the window.
    ///
    /// # Errors
    ///
    /// Returns the store error if the window cannot be updated.
    pub async fn record(&self, api_id: &str, event: HealthEvent) -> Result<usize> {
        self.record_at(api_id, event, SystemTime::now()).await
    }

    /// [`record`](Self::record) with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// Returns the store error if the window cannot be updated.
    #[tracing::instrument(skip(self), fields(event = %event))]
    pub async fn record_at(&self, api_id: &str, event: HealthEvent, at: SystemTime) -> Result<usize> {
        let key = self.key(api_id, event);
        let observation =
            self.client.set_rolling_window_pipeline_at(&key, self.window, None, at).await?;
        Ok(observation.count)
    }

    /// Number of `event`s for `api_id` inside the window ending at `at`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the window cannot be read.
    pub async fn count(&self, api_id: &str, event: HealthEvent, at: SystemTime) -> Result<usize> {
        let key = self.key(api_id, event);
        Ok(self.client.get_rolling_window_at(&key, self.window, at).await?.count)
    }

    fn key(&self, api_id: &str, event: HealthEvent) -> String {
        self.client.key_space().fix_key(&format!("{api_id}.{event}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tollgate_store::testutil::memory_client;

    use super::*;

    fn recorder() -> HealthRecorder {
        let (client, _) = memory_client(HEALTH_PREFIX, false);
        HealthRecorder::new(client).with_window(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_events_are_counted_per_api_and_kind() {
        let recorder = recorder();
        let start = SystemTime::now();
        let at = |ms: u64| start + Duration::from_millis(ms);

        assert_eq!(recorder.record_at("31", HealthEvent::Request, at(0)).await.unwrap(), 0);
        assert_eq!(recorder.record_at("31", HealthEvent::Request, at(1)).await.unwrap(), 1);
        recorder.record_at("31", HealthEvent::KeyFailure, at(2)).await.unwrap();
        recorder.record_at("32", HealthEvent::Request, at(3)).await.unwrap();

        assert_eq!(recorder.count("31", HealthEvent::Request, at(4)).await.unwrap(), 2);
        assert_eq!(recorder.count("31", HealthEvent::KeyFailure, at(4)).await.unwrap(), 1);
        assert_eq!(recorder.count("31", HealthEvent::QuotaViolation, at(4)).await.unwrap(), 0);
        assert_eq!(recorder.count("32", HealthEvent::Request, at(4)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_old_events_leave_the_window() {
        let recorder = recorder();
        let start = SystemTime::now();
        recorder.record_at("31", HealthEvent::Request, start).await.unwrap();
        let later = start + Duration::from_secs(11);
        assert_eq!(recorder.count("31", HealthEvent::Request, later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_readable() {
        let (client, _) = memory_client(HEALTH_PREFIX, false);
        let recorder = HealthRecorder::new(client.clone());
        recorder.record("31", HealthEvent::ThrottledRequest).await.unwrap();

        let keys = client.get_keys("").await.unwrap();
        assert_eq!(keys, ["31.ThrottledRequest"]);
    }

    #[test]
    fn test_rejection_mapping() {
        assert_eq!(
            HealthEvent::for_rejection(RejectionReason::AuthFailed),
            Some(HealthEvent::KeyFailure)
        );
        assert_eq!(
            HealthEvent::for_rejection(RejectionReason::Expired),
            Some(HealthEvent::KeyFailure)
        );
        assert_eq!(
            HealthEvent::for_rejection(RejectionReason::RateLimited),
            Some(HealthEvent::ThrottledRequest)
        );
        assert_eq!(
            HealthEvent::for_rejection(RejectionReason::QuotaExceeded),
            Some(HealthEvent::QuotaViolation)
        );
        assert_eq!(HealthEvent::for_rejection(RejectionReason::IpBlocked), None);
        assert_eq!(HealthEvent::for_rejection(RejectionReason::StoreUnavailable), None);
    }
}
