//! Rate limiting.
//!
//! Two algorithms are available, selected by [`RateLimitMode`]:
//!
//! - [`leaky_bucket`] refills `allowance` continuously at `rate / per` per
//!   second and spends one unit per request. It works on the session copy
//!   fetched for the request; the session is written back afterwards, so two
//!   gateways handling the same key at the same instant may both admit.
//! - [`SlidingWindowLimiter`] counts requests in the last `per` seconds with
//!   the store's transactional sliding window, which is exact across gateways
//!   at the cost of one round trip per request.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_store::{KeySpace, StoreClient, StoreCluster, keyspace::RATE_LIMIT_PREFIX};

use crate::{
    error::{GatewayError, Result},
    session::SessionState,
};

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request fits the limit.
    Allowed,
    /// The request exceeds the limit.
    Limited,
}

/// Which algorithm enforces `rate` per `per`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// In-session leaky bucket.
    #[default]
    LeakyBucket,
    /// Store-side sliding window.
    SlidingWindow,
}

/// Runs one leaky-bucket check against `session` at `now`.
///
/// Always moves `last_check` to `now`. A clock that went backwards refills
/// nothing. A non-positive `per` disables refilling.
pub fn leaky_bucket(session: &mut SessionState, now: DateTime<Utc>) -> RateDecision {
    let elapsed = (now - session.last_check).to_std().map_or(0.0, |d| d.as_secs_f64());
    session.last_check = now;

    let refill = if session.per > 0.0 { elapsed * (session.rate / session.per) } else { 0.0 };
    session.allowance = (session.allowance + refill).min(session.rate).max(0.0);

    if session.allowance < 1.0 {
        RateDecision::Limited
    } else {
        session.allowance -= 1.0;
        RateDecision::Allowed
    }
}

/// Rate limiting with the store's sliding window.
///
/// Each check records the request, so rejected requests count towards the
/// window too.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    client: StoreClient,
}

impl SlidingWindowLimiter {
    /// Uses `client` as is, including its key space.
    #[must_use]
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }

    /// A limiter on `cluster` under the `rate-limit-` namespace, with hashed keys.
    #[must_use]
    pub fn from_cluster(cluster: StoreCluster) -> Self {
        Self::new(StoreClient::new(cluster, KeySpace::new(RATE_LIMIT_PREFIX, true)))
    }

    /// Records a request of `token` at `now` and checks it against the session's limit.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidSession`] if `per` is not a positive
    /// duration, or the store error if the window cannot be updated.
    #[tracing::instrument(skip_all, fields(rate = session.rate, per = session.per))]
    pub async fn check(
        &self,
        token: &str,
        session: &SessionState,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let window = Duration::try_from_secs_f64(session.per)
            .ok()
            .filter(|window| !window.is_zero())
            .ok_or_else(|| {
                GatewayError::InvalidSession(format!("per must be positive, got {}", session.per))
            })?;

        let key = self.client.key_space().fix_key(token);
        let observation =
            self.client.set_rolling_window_at(&key, window, None, SystemTime::from(now)).await?;

        // Precision loss only matters beyond 2^53 requests in one window.
        #[allow(clippy::cast_precision_loss)]
        let seen = observation.count as f64;
        if seen >= session.rate {
            tracing::debug!(seen, "sliding window limit reached");
            Ok(RateDecision::Limited)
        } else {
            Ok(RateDecision::Allowed)
        }
    }
}
