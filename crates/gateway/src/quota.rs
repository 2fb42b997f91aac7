//! Quota accounting.
//!
//! A quota is a budget of `quota_max` requests per renewal period. With
//! [`QuotaCounter::Session`] the budget lives in the session record and renews
//! when `quota_renews` is reached. With [`QuotaCounter::Shared`] consumption is
//! counted by an atomic store counter that expires after one renewal period,
//! which stays exact when several gateways serve the same key concurrently.
//!
//! A `quota_max` below zero means unlimited in both modes; nothing is counted.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tollgate_store::{KeySpace, StoreClient, StoreCluster, keyspace::QUOTA_PREFIX};

use crate::{error::Result, session::SessionState};

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The key has no quota.
    Unlimited,
    /// The request was counted; `remaining` requests are left.
    Allowed {
        /// Requests left in the current period.
        remaining: i64,
    },
    /// The quota is used up.
    Exceeded,
}

/// Where quota consumption is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMode {
    /// In the session record.
    #[default]
    Session,
    /// In a shared store counter.
    Shared,
}

/// Counter backing a [`QuotaManager`].
#[derive(Debug, Clone)]
pub enum QuotaCounter {
    /// Session fields only.
    Session,
    /// Atomic counter in the store.
    Shared(StoreClient),
}

/// Applies quota rules to sessions.
#[derive(Debug, Clone)]
pub struct QuotaManager {
    counter: QuotaCounter,
}

impl QuotaManager {
    /// Counts in the session record.
    #[must_use]
    pub fn session() -> Self {
        Self { counter: QuotaCounter::Session }
    }

    /// Counts with `client`, using its key space as is.
    #[must_use]
    pub fn shared(client: StoreClient) -> Self {
        Self { counter: QuotaCounter::Shared(client) }
    }

    /// Counts on `cluster` under the `quota-` namespace, with hashed keys.
    #[must_use]
    pub fn shared_on(cluster: StoreCluster) -> Self {
        Self::shared(StoreClient::new(cluster, KeySpace::new(QUOTA_PREFIX, true)))
    }

    /// The counter in use.
    #[must_use]
    pub fn counter(&self) -> &QuotaCounter {
        &self.counter
    }

    /// Counts one request of `token` at `now`.
    ///
    /// In shared mode `session.quota_remaining` is updated from the counter so
    /// the persisted session reflects it.
    ///
    /// # Errors
    ///
    /// Returns the store error if the shared counter cannot be incremented.
    pub async fn check(
        &self,
        token: &str,
        session: &mut SessionState,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        match &self.counter {
            QuotaCounter::Session => Ok(check_session_quota(session, now)),
            QuotaCounter::Shared(client) => check_shared_quota(client, token, session).await,
        }
    }
}

/// Applies the renewal and decrement rules to the session's quota fields.
pub fn check_session_quota(session: &mut SessionState, now: DateTime<Utc>) -> QuotaDecision {
    if session.has_unlimited_quota() {
        return QuotaDecision::Unlimited;
    }

    if now >= session.quota_renews {
        session.quota_remaining = session.quota_max;
        session.quota_renews = renewal_after(now, session.quota_renewal_rate);
        tracing::debug!(renews = %session.quota_renews, "quota renewed");
    }

    if session.quota_remaining <= 0 {
        return QuotaDecision::Exceeded;
    }
    session.quota_remaining -= 1;
    QuotaDecision::Allowed { remaining: session.quota_remaining }
}

/// `now` plus `renewal_rate` seconds, saturating at the ends of the representable range.
fn renewal_after(now: DateTime<Utc>, renewal_rate: i64) -> DateTime<Utc> {
    TimeDelta::try_seconds(renewal_rate)
        .and_then(|period| now.checked_add_signed(period))
        .unwrap_or_else(|| {
            if renewal_rate < 0 { DateTime::<Utc>::MIN_UTC } else { DateTime::<Utc>::MAX_UTC }
        })
}

#[tracing::instrument(skip_all, fields(quota_max = session.quota_max))]
async fn check_shared_quota(
    client: &StoreClient,
    token: &str,
    session: &mut SessionState,
) -> Result<QuotaDecision> {
    if session.has_unlimited_quota() {
        return Ok(QuotaDecision::Unlimited);
    }

    // The counter must expire, so a renewal period below one second counts as one second.
    let period = Duration::from_secs(u64::try_from(session.quota_renewal_rate).unwrap_or(0).max(1));
    let key = client.key_space().fix_key(token);
    let used = client.increment_with_expire(&key, period).await?;

    if used > session.quota_max {
        session.quota_remaining = 0;
        return Ok(QuotaDecision::Exceeded);
    }
    session.quota_remaining = session.quota_max - used;
    Ok(QuotaDecision::Allowed { remaining: session.quota_remaining })
}
