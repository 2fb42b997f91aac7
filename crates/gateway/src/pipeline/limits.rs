use super::{AdmissionContext, FailurePolicy, Verdict};
use crate::{
    error::{GatewayError, RejectionReason},
    quota::{QuotaDecision, QuotaManager},
    rate_limiter::{RateDecision, SlidingWindowLimiter, leaky_bucket},
};

/// The rate check a [`RateLimitAndQuota`] stage runs.
#[derive(Debug, Clone)]
pub enum RateCheck {
    /// Leaky bucket on the session fields.
    LeakyBucket,
    /// Sliding window in the store.
    SlidingWindow(SlidingWindowLimiter),
}

/// Applies the rate limit, then the quota.
///
/// A rate-limited request does not consume quota. Store failures are handled
/// by the [`FailurePolicy`].
#[derive(Debug, Clone)]
pub struct RateLimitAndQuota {
    rate: RateCheck,
    quota: QuotaManager,
    policy: FailurePolicy,
}

impl RateLimitAndQuota {
    /// Creates the stage.
    #[must_use]
    pub fn new(rate: RateCheck, quota: QuotaManager, policy: FailurePolicy) -> Self {
        Self { rate, quota, policy }
    }

    pub(crate) async fn evaluate(&self, ctx: &mut AdmissionContext<'_>) -> Verdict {
        let now = ctx.now;
        let (Some(token), Some(session)) = (ctx.token.as_deref(), ctx.session.as_mut()) else {
            return Verdict::Continue;
        };

        let rate = match &self.rate {
            RateCheck::LeakyBucket => Ok(leaky_bucket(session, now)),
            RateCheck::SlidingWindow(limiter) => limiter.check(token, session, now).await,
        };
        match rate {
            Ok(RateDecision::Allowed) => {},
            Ok(RateDecision::Limited) => {
                tracing::info!(rate = session.rate, per = session.per, "key rate limited");
                return Verdict::reject(RejectionReason::RateLimited);
            },
            Err(err) => {
                if let Some(verdict) = self.on_error("rate limit", &err) {
                    return verdict;
                }
            },
        }

        match self.quota.check(token, session, now).await {
            Ok(QuotaDecision::Exceeded) => {
                tracing::info!(quota_max = session.quota_max, "key quota exceeded");
                Verdict::reject(RejectionReason::QuotaExceeded)
            },
            Ok(QuotaDecision::Allowed { .. } | QuotaDecision::Unlimited) => Verdict::Continue,
            Err(err) => self.on_error("quota", &err).unwrap_or(Verdict::Continue),
        }
    }

    fn on_error(&self, check: &str, err: &GatewayError) -> Option<Verdict> {
        match self.policy {
            FailurePolicy::Closed => {
                tracing::error!(check, error = %err, "limit check failed, rejecting");
                Some(Verdict::reject(RejectionReason::StoreUnavailable))
            },
            FailurePolicy::Open => {
                tracing::warn!(check, error = %err, "limit check failed, admitting");
                None
            },
        }
    }
}
