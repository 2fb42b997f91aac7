//! The admission pipeline.
//!
//! A [`Pipeline`] runs a fixed, ordered list of [`Stage`]s over each request.
//! Every stage either lets the request continue or rejects it; the first
//! rejection ends the run and later stages never see the request.
//!
//! | Order | Stage                 | Rejects with                          |
//! |-------|-----------------------|---------------------------------------|
//! | 1     | IP allow list         | `IpBlocked`                           |
//! | 2     | Key authentication    | `AuthFailed`, `StoreUnavailable`      |
//! | 3     | Version and paths     | `VersionNotAllowed`, `AccessDenied`   |
//! | 4     | Key expiry            | `Expired`                             |
//! | 5     | Access rights         | `AccessDenied`                        |
//! | 6     | Rate limit and quota  | `RateLimited`, `QuotaExceeded`, `StoreUnavailable` |
//!
//! The authentication stage loads the session; later stages read and mutate
//! it through the [`AdmissionContext`]. After the run a session the request
//! changed is handed to the [`SessionRecorder`], so the store stays the source
//! of truth across gateway processes. An unchanged session is not written, so
//! it cannot overwrite a concurrent update to the same key.

mod access_rights;
mod auth_key;
mod ip_allow;
mod key_expired;
mod limits;
mod version;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_store::StoreCluster;
use tracing::Instrument;

pub use self::{
    access_rights::AccessRights,
    auth_key::{AuthKey, strip_bearer},
    ip_allow::IpAllowList,
    key_expired::KeyExpired,
    limits::{RateCheck, RateLimitAndQuota},
    version::VersionCheck,
};
use crate::{
    api::{ApiSpec, PathStatus, VersionError, VersionInfo},
    error::{GatewayError, RejectionReason, Result},
    health::{HealthEvent, HealthRecorder},
    quota::{QuotaManager, QuotaMode},
    rate_limiter::{RateLimitMode, SlidingWindowLimiter},
    recorder::{SessionRecorder, StoreSessionRecorder},
    request::AdmissionRequest,
    session::SessionState,
    session_store::SessionStore,
};

/// What the limits stage does when the store fails mid-check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject with `StoreUnavailable`.
    #[default]
    Closed,
    /// Admit the request and log a warning.
    Open,
}

/// Pipeline settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Rate limiting algorithm.
    pub rate_limit_mode: RateLimitMode,
    /// Where quota consumption is counted.
    pub quota_mode: QuotaMode,
    /// Behaviour on store failures during limit checks.
    pub failure_policy: FailurePolicy,
}

/// The kinds of stage, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Client address check.
    IpAllowList,
    /// Key lookup.
    AuthKey,
    /// Version and path rules.
    VersionCheck,
    /// Key expiry.
    KeyExpired,
    /// Per-API grants.
    AccessRights,
    /// Rate limit, then quota.
    RateLimitAndQuota,
}

impl StageKind {
    /// Every stage kind in evaluation order.
    pub const ORDER: [Self; 6] = [
        Self::IpAllowList,
        Self::AuthKey,
        Self::VersionCheck,
        Self::KeyExpired,
        Self::AccessRights,
        Self::RateLimitAndQuota,
    ];

    /// Stable name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IpAllowList => "ip_allow_list",
            Self::AuthKey => "auth_key",
            Self::VersionCheck => "version_check",
            Self::KeyExpired => "key_expired",
            Self::AccessRights => "access_rights",
            Self::RateLimitAndQuota => "rate_limit_and_quota",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the request to the next stage.
    Continue,
    /// Stop with a rejection.
    Reject {
        /// Why.
        reason: RejectionReason,
        /// Message for the caller.
        message: String,
    },
}

impl Verdict {
    /// Rejects with the reason's default message.
    #[must_use]
    pub fn reject(reason: RejectionReason) -> Self {
        Self::reject_with(reason, reason.default_message())
    }

    /// Rejects with a custom message.
    #[must_use]
    pub fn reject_with(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self::Reject { reason, message: message.into() }
    }
}

/// State shared by the stages of one run.
#[derive(Debug)]
pub struct AdmissionContext<'a> {
    /// The API being called.
    pub spec: &'a ApiSpec,
    /// The request.
    pub request: &'a AdmissionRequest,
    /// Clock reading used by every stage.
    pub now: DateTime<Utc>,
    /// The version the request targets.
    pub version: std::result::Result<(&'a str, &'a VersionInfo), VersionError>,
    /// How the request path relates to the version's path rules.
    pub path_status: PathStatus,
    /// The key, once authenticated.
    pub token: Option<String>,
    /// The key's session, once loaded.
    pub session: Option<SessionState>,
    /// The session as it was read from the store.
    loaded: Option<SessionState>,
}

impl<'a> AdmissionContext<'a> {
    /// Resolves the version and classifies the path of `request`.
    #[must_use]
    pub fn new(spec: &'a ApiSpec, request: &'a AdmissionRequest, now: DateTime<Utc>) -> Self {
        let version = spec.resolve_version(request);
        let path_status = match &version {
            Ok((_, info)) => {
                info.paths.classify(&request.method, spec.proxy.relative_path(&request.path))
            },
            Err(_) => PathStatus::NotListed,
        };
        Self { spec, request, now, version, path_status, token: None, session: None, loaded: None }
    }

    /// Stores the authenticated key and its session as loaded.
    pub(crate) fn authenticate(&mut self, token: &str, session: SessionState) {
        self.token = Some(token.to_owned());
        self.loaded = Some(session.clone());
        self.session = Some(session);
    }

    /// Whether a stage changed the session since it was loaded.
    #[must_use]
    pub fn session_changed(&self) -> bool {
        self.session != self.loaded
    }
}

/// One pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    /// See [`IpAllowList`].
    IpAllowList(IpAllowList),
    /// See [`AuthKey`].
    AuthKey(AuthKey),
    /// See [`VersionCheck`].
    VersionCheck(VersionCheck),
    /// See [`KeyExpired`].
    KeyExpired(KeyExpired),
    /// See [`AccessRights`].
    AccessRights(AccessRights),
    /// See [`RateLimitAndQuota`].
    RateLimitAndQuota(RateLimitAndQuota),
}

impl Stage {
    /// The stage's kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        match self {
            Self::IpAllowList(_) => StageKind::IpAllowList,
            Self::AuthKey(_) => StageKind::AuthKey,
            Self::VersionCheck(_) => StageKind::VersionCheck,
            Self::KeyExpired(_) => StageKind::KeyExpired,
            Self::AccessRights(_) => StageKind::AccessRights,
            Self::RateLimitAndQuota(_) => StageKind::RateLimitAndQuota,
        }
    }

    /// Evaluates the stage against `ctx`.
    pub async fn evaluate(&self, ctx: &mut AdmissionContext<'_>) -> Verdict {
        match self {
            Self::IpAllowList(stage) => stage.evaluate(ctx),
            Self::AuthKey(stage) => stage.evaluate(ctx).await,
            Self::VersionCheck(stage) => stage.evaluate(ctx),
            Self::KeyExpired(stage) => stage.evaluate(ctx),
            Self::AccessRights(stage) => stage.evaluate(ctx),
            Self::RateLimitAndQuota(stage) => stage.evaluate(ctx).await,
        }
    }
}

/// A refused request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Stage that refused it.
    pub stage: StageKind,
    /// Why.
    pub reason: RejectionReason,
    /// Message for the caller.
    pub message: String,
}

/// An admitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    /// The key, absent on ignored paths.
    pub token: Option<String>,
    /// The session after this request was counted.
    pub session: Option<SessionState>,
    /// The version served.
    pub version: Option<String>,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Forward the request.
    Admitted(Admitted),
    /// Answer with the rejection.
    Rejected(Rejection),
}

impl Admission {
    /// Whether the request was admitted.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// The rejection, if any.
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Admitted(_) => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

/// The ordered stages for one API, plus health and session recording.
#[derive(Debug, Clone)]
pub struct Pipeline {
    spec: Arc<ApiSpec>,
    stages: Vec<Stage>,
    health: Option<HealthRecorder>,
    recorder: Arc<dyn SessionRecorder>,
    failure_policy: FailurePolicy,
}

#[bon::bon]
impl Pipeline {
    /// Assembles the default stage list for `spec`.
    ///
    /// Limiters that `config` asks for but that are not supplied are created
    /// on the session store's cluster. Without a `recorder`, sessions are
    /// written back through `sessions`.
    #[builder]
    pub fn new(
        spec: ApiSpec,
        sessions: SessionStore,
        #[builder(default)] config: PipelineConfig,
        window_limiter: Option<SlidingWindowLimiter>,
        quota: Option<QuotaManager>,
        health: Option<HealthRecorder>,
        recorder: Option<Arc<dyn SessionRecorder>>,
    ) -> Self {
        let cluster = sessions.client().cluster().clone();
        let rate = match config.rate_limit_mode {
            RateLimitMode::LeakyBucket => RateCheck::LeakyBucket,
            RateLimitMode::SlidingWindow => RateCheck::SlidingWindow(
                window_limiter.unwrap_or_else(|| SlidingWindowLimiter::from_cluster(cluster.clone())),
            ),
        };
        let quota = quota.unwrap_or_else(|| match config.quota_mode {
            QuotaMode::Session => QuotaManager::session(),
            QuotaMode::Shared => QuotaManager::shared_on(cluster),
        });
        let recorder = recorder.unwrap_or_else(|| Arc::new(StoreSessionRecorder::new(sessions.clone())));

        let stages = vec![
            Stage::IpAllowList(IpAllowList::from_spec(&spec)),
            Stage::AuthKey(AuthKey::new(sessions)),
            Stage::VersionCheck(VersionCheck),
            Stage::KeyExpired(KeyExpired),
            Stage::AccessRights(AccessRights),
            Stage::RateLimitAndQuota(RateLimitAndQuota::new(rate, quota, config.failure_policy)),
        ];

        Self { spec: Arc::new(spec), stages, health, recorder, failure_policy: config.failure_policy }
    }
}

impl Pipeline {
    /// A pipeline with every store-backed component on `cluster` under its
    /// default namespace, health recording included.
    #[must_use]
    pub fn on_cluster(spec: ApiSpec, cluster: &StoreCluster, config: PipelineConfig) -> Self {
        Self::builder()
            .spec(spec)
            .sessions(SessionStore::from_cluster(cluster.clone()))
            .config(config)
            .health(HealthRecorder::from_cluster(cluster.clone()))
            .build()
    }

    /// The API this pipeline admits requests for.
    #[must_use]
    pub fn spec(&self) -> &ApiSpec {
        &self.spec
    }

    /// The stages, in evaluation order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs the pipeline over `request` now.
    pub async fn admit(&self, request: &AdmissionRequest) -> Admission {
        self.admit_at(request, Utc::now()).await
    }

    /// Runs the pipeline over `request` with the clock reading `now`.
    #[tracing::instrument(
        name = "admission",
        skip_all,
        fields(api_id = %self.spec.api_id, method = %request.method, path = %request.path)
    )]
    pub async fn admit_at(&self, request: &AdmissionRequest, now: DateTime<Utc>) -> Admission {
        let mut ctx = AdmissionContext::new(&self.spec, request, now);

        let mut rejection = None;
        for stage in &self.stages {
            let kind = stage.kind();
            let span = tracing::debug_span!("stage", stage = %kind);
            if let Verdict::Reject { reason, message } = stage.evaluate(&mut ctx).instrument(span).await {
                tracing::debug!(stage = %kind, reason = %reason, "request rejected");
                rejection = Some(Rejection { stage: kind, reason, message });
                break;
            }
        }

        let rejection = match (rejection, self.record_session(&ctx).await) {
            (rejection, Ok(())) => rejection,
            (Some(rejection), Err(err)) => {
                tracing::error!(error = %err, "failed to record session of rejected request");
                Some(rejection)
            },
            (None, Err(err)) => self.on_record_failure(&err),
        };

        let event = match &rejection {
            None => Some(HealthEvent::Request),
            Some(rejection) => HealthEvent::for_rejection(rejection.reason),
        };
        if let Some(event) = event {
            self.record_health(event, now).await;
        }

        match rejection {
            Some(rejection) => Admission::Rejected(rejection),
            None => {
                let version = ctx.version.as_ref().ok().map(|(name, _)| (*name).to_owned());
                Admission::Admitted(Admitted { token: ctx.token, session: ctx.session, version })
            },
        }
    }

    async fn record_session(&self, ctx: &AdmissionContext<'_>) -> Result<()> {
        match (ctx.token.as_deref(), ctx.session.as_ref()) {
            (Some(token), Some(session)) if ctx.session_changed() => {
                self.recorder.record(token, session, ctx.now).await
            },
            (Some(_), Some(_)) => {
                tracing::debug!("session unchanged, not recording");
                Ok(())
            },
            _ => Ok(()),
        }
    }

    /// A failed write-back of an admitted request's session rejects it when
    /// the policy is fail-closed.
    fn on_record_failure(&self, err: &GatewayError) -> Option<Rejection> {
        match self.failure_policy {
            FailurePolicy::Closed => {
                tracing::error!(error = %err, "failed to record session, rejecting");
                let reason = RejectionReason::StoreUnavailable;
                Some(Rejection {
                    stage: StageKind::RateLimitAndQuota,
                    reason,
                    message: reason.default_message().to_owned(),
                })
            },
            FailurePolicy::Open => {
                tracing::warn!(error = %err, "failed to record session, admitting anyway");
                None
            },
        }
    }

    async fn record_health(&self, event: HealthEvent, now: DateTime<Utc>) {
        let Some(health) = &self.health else {
            return;
        };
        if let Err(err) = health.record_at(&self.spec.api_id, event, now.into()).await {
            tracing::warn!(event = %event, error = %err, "failed to record health event");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_fixed() {
        let names: Vec<_> = StageKind::ORDER.iter().map(|kind| kind.as_str()).collect();
        assert_eq!(
            names,
            ["ip_allow_list", "auth_key", "version_check", "key_expired", "access_rights", "rate_limit_and_quota"]
        );
    }

    #[test]
    fn test_config_defaults_are_conservative() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.rate_limit_mode, RateLimitMode::LeakyBucket);
        assert_eq!(config.quota_mode, QuotaMode::Session);

        let config: PipelineConfig =
            serde_json::from_str(r#"{"failure_policy":"open","rate_limit_mode":"sliding_window"}"#).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Open);
        assert_eq!(config.rate_limit_mode, RateLimitMode::SlidingWindow);

        assert!(serde_json::from_str::<PipelineConfig>(r#"{"policy":"open"}"#).is_err());
    }

    #[test]
    fn test_verdict_default_message() {
        let Verdict::Reject { reason, message } = Verdict::reject(RejectionReason::QuotaExceeded) else {
            panic!("expected a rejection");
        };
        assert_eq!(reason, RejectionReason::QuotaExceeded);
        assert_eq!(message, "Quota exceeded");
    }
}
