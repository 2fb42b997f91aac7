//! End-to-end admission scenarios over the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use http::{Method, StatusCode};
use tollgate_gateway::{
    AccessDefinition, Admission, AdmissionRequest, FailurePolicy, Gateway, HealthEvent,
    HealthRecorder, Pipeline, PipelineConfig, PathRule, QuotaManager, RateLimitMode,
    RejectionReason, SessionRecorder, SessionState, SessionStore, SlidingWindowLimiter, StageKind,
    assert_rejected,
    testutil::{
        AUTH_KEY_TOKEN, RecordingForwarder, auth_key_api_spec, auth_key_session, bearer_request,
        memory_session_store,
    },
};
use tollgate_store::{
    KeySpace, MemoryConnector, StoreClient, StoreCluster,
    keyspace::{HEALTH_PREFIX, QUOTA_PREFIX, RATE_LIMIT_PREFIX},
};

async fn store_with(session: &SessionState) -> (SessionStore, MemoryConnector) {
    let (sessions, connector) = memory_session_store();
    sessions.update_session(AUTH_KEY_TOKEN, session, Some(Duration::from_secs(60))).await.unwrap();
    (sessions, connector)
}

fn pipeline(sessions: &SessionStore) -> Pipeline {
    Pipeline::builder().spec(auth_key_api_spec()).sessions(sessions.clone()).build()
}

/// A client on a store that refuses every connection.
fn unreachable_client(prefix: &str) -> StoreClient {
    let connector = MemoryConnector::new();
    connector.refuse_connections(true);
    StoreClient::new(StoreCluster::new(connector), KeySpace::new(prefix, true))
}

#[tokio::test]
async fn valid_bearer_token_is_admitted_and_forwarded() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let forwarder = Arc::new(RecordingForwarder::new());
    let gateway = Gateway::new(pipeline(&sessions), forwarder.clone());

    let response = gateway.handle_at(&bearer_request(AUTH_KEY_TOKEN), now).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(forwarder.calls(), 1);
    assert_eq!(forwarder.upstream_paths().await, ["/"]);
    let stored = sessions.session_detail(AUTH_KEY_TOKEN).await.unwrap().unwrap();
    assert_eq!(stored.quota_remaining, 9);
}

#[tokio::test]
async fn admission_reports_token_session_and_version() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;

    let admission = pipeline(&sessions).admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;

    let Admission::Admitted(admitted) = admission else {
        panic!("expected admission, got {admission:?}");
    };
    assert_eq!(admitted.token.as_deref(), Some(AUTH_KEY_TOKEN));
    assert_eq!(admitted.version.as_deref(), Some("Default"));
    let session = admitted.session.unwrap();
    assert_eq!(session.quota_remaining, 9);
    assert!((session.allowance - 99.0).abs() < 1e-9);
}

#[tokio::test]
async fn unknown_token_fails_auth_without_forwarding() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let forwarder = Arc::new(RecordingForwarder::new());
    let gateway = Gateway::new(pipeline(&sessions), forwarder.clone());

    let response = gateway.handle_at(&bearer_request("99999999"), now).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert!(response.body.contains("auth_failed"), "{}", response.body);
    assert_eq!(forwarder.calls(), 0);
}

#[tokio::test]
async fn missing_auth_header_fails_auth() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let forwarder = Arc::new(RecordingForwarder::new());
    let gateway = Gateway::new(pipeline(&sessions), forwarder.clone());
    let request = AdmissionRequest::new(Method::GET, "/auth_key_test/");

    let admission = gateway.pipeline().admit_at(&request, now).await;
    assert_rejected!(admission, RejectionReason::AuthFailed);
    assert_eq!(admission.rejection().unwrap().message, "Authorization field missing");

    let response = gateway.handle_at(&request, now).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(forwarder.calls(), 0);
}

#[tokio::test]
async fn raw_token_without_bearer_prefix_is_accepted() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let request =
        AdmissionRequest::new(Method::GET, "/auth_key_test/").with_header("Authorization", AUTH_KEY_TOKEN);

    assert!(pipeline(&sessions).admit_at(&request, now).await.is_admitted());
}

#[tokio::test]
async fn expired_key_is_rejected_regardless_of_limits() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.expires = Some(now - TimeDelta::seconds(10));
    let (sessions, _) = store_with(&session).await;

    let admission = pipeline(&sessions).admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;

    assert_rejected!(admission, RejectionReason::Expired);
    assert_eq!(admission.rejection().unwrap().stage, StageKind::KeyExpired);
    // The stored record is left as it was.
    let stored = sessions.session_detail(AUTH_KEY_TOKEN).await.unwrap().unwrap();
    assert_eq!(stored.quota_remaining, 10);
}

#[tokio::test(start_paused = true)]
async fn key_served_before_expiry_is_reported_expired_afterwards() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.expires = Some(now + TimeDelta::seconds(1));
    let (sessions, _) = memory_session_store();
    sessions.update_session(AUTH_KEY_TOKEN, &session, None).await.unwrap();
    let pipeline = pipeline(&sessions);
    let request = bearer_request(AUTH_KEY_TOKEN);

    assert!(pipeline.admit_at(&request, now).await.is_admitted());
    // The write-back must not tie the record's lifetime to the key's expiry.
    assert_eq!(sessions.client().get_exp(AUTH_KEY_TOKEN).await.unwrap(), -1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let admission = pipeline.admit_at(&request, now + TimeDelta::seconds(2)).await;

    assert_rejected!(admission, RejectionReason::Expired);
    assert_eq!(admission.rejection().unwrap().stage, StageKind::KeyExpired);
    let stored = sessions.session_detail(AUTH_KEY_TOKEN).await.unwrap().unwrap();
    assert_eq!(stored.quota_remaining, 9);
}

#[tokio::test]
async fn oversized_quota_renewal_rate_is_admitted() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.quota_renewal_rate = 10_000_000_000_000;
    session.quota_renews = now - TimeDelta::seconds(1);
    let (sessions, _) = store_with(&session).await;

    let admission = pipeline(&sessions).admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;

    assert!(admission.is_admitted(), "{admission:?}");
    let stored = sessions.session_detail(AUTH_KEY_TOKEN).await.unwrap().unwrap();
    assert_eq!(stored.quota_remaining, 9);
    assert_eq!(stored.quota_renews.timestamp(), DateTime::<Utc>::MAX_UTC.timestamp());
}

#[tokio::test]
async fn quota_exhausts_then_renews() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let pipeline = pipeline(&sessions);
    let request = bearer_request(AUTH_KEY_TOKEN);

    for _ in 0..10 {
        assert!(pipeline.admit_at(&request, now).await.is_admitted());
    }
    let admission = pipeline.admit_at(&request, now).await;
    assert_rejected!(admission, RejectionReason::QuotaExceeded);
    assert_eq!(RejectionReason::QuotaExceeded.status(), StatusCode::FORBIDDEN);

    let renewal = now + TimeDelta::seconds(300);
    assert!(pipeline.admit_at(&request, renewal).await.is_admitted());
    let stored = sessions.session_detail(AUTH_KEY_TOKEN).await.unwrap().unwrap();
    assert_eq!(stored.quota_remaining, 9);
}

#[tokio::test]
async fn unlimited_quota_is_never_exceeded() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.quota_max = tollgate_gateway::UNLIMITED_QUOTA;
    let (sessions, _) = store_with(&session).await;
    let pipeline = pipeline(&sessions);

    for _ in 0..50 {
        assert!(pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await.is_admitted());
    }
}

#[tokio::test]
async fn rate_limit_rejects_without_consuming_quota() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.rate = 2.0;
    session.per = 60.0;
    session.allowance = 2.0;
    let (sessions, _) = store_with(&session).await;
    let pipeline = pipeline(&sessions);
    let request = bearer_request(AUTH_KEY_TOKEN);

    assert!(pipeline.admit_at(&request, now).await.is_admitted());
    assert!(pipeline.admit_at(&request, now).await.is_admitted());
    let admission = pipeline.admit_at(&request, now).await;
    assert_rejected!(admission, RejectionReason::RateLimited);

    let stored = sessions.session_detail(AUTH_KEY_TOKEN).await.unwrap().unwrap();
    assert_eq!(stored.quota_remaining, 8);
    assert!(stored.allowance < 1.0);

    // 2 per 60s earns one request every 30 seconds.
    let later = now + TimeDelta::seconds(31);
    assert!(pipeline.admit_at(&request, later).await.is_admitted());
}

#[tokio::test]
async fn sliding_window_mode_limits_across_pipelines() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.rate = 3.0;
    session.per = 60.0;
    let (sessions, _) = store_with(&session).await;
    let config =
        PipelineConfig { rate_limit_mode: RateLimitMode::SlidingWindow, ..PipelineConfig::default() };
    let first = Pipeline::builder()
        .spec(auth_key_api_spec())
        .sessions(sessions.clone())
        .config(config)
        .build();
    let second = first.clone();
    let request = bearer_request(AUTH_KEY_TOKEN);

    let at = |ms: i64| now + TimeDelta::milliseconds(ms);
    assert!(first.admit_at(&request, at(0)).await.is_admitted());
    assert!(second.admit_at(&request, at(1)).await.is_admitted());
    assert!(first.admit_at(&request, at(2)).await.is_admitted());
    assert_rejected!(second.admit_at(&request, at(3)).await, RejectionReason::RateLimited);
}

#[tokio::test]
async fn shared_quota_counts_in_the_store() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.quota_max = 2;
    let (sessions, _) = store_with(&session).await;
    let quota_client = sessions.client().with_key_space(KeySpace::new(QUOTA_PREFIX, true));
    let pipeline = Pipeline::builder()
        .spec(auth_key_api_spec())
        .sessions(sessions.clone())
        .quota(QuotaManager::shared(quota_client.clone()))
        .build();
    let request = bearer_request(AUTH_KEY_TOKEN);

    assert!(pipeline.admit_at(&request, now).await.is_admitted());
    assert!(pipeline.admit_at(&request, now).await.is_admitted());
    assert_rejected!(pipeline.admit_at(&request, now).await, RejectionReason::QuotaExceeded);

    let counter = quota_client.key_space().fix_key(AUTH_KEY_TOKEN);
    assert_eq!(quota_client.get_raw_key(&counter).await.unwrap(), "3");
}

#[tokio::test]
async fn store_outage_during_limits_fails_closed() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let config =
        PipelineConfig { rate_limit_mode: RateLimitMode::SlidingWindow, ..PipelineConfig::default() };
    let forwarder = Arc::new(RecordingForwarder::new());
    let pipeline = Pipeline::builder()
        .spec(auth_key_api_spec())
        .sessions(sessions.clone())
        .config(config)
        .window_limiter(SlidingWindowLimiter::new(unreachable_client(RATE_LIMIT_PREFIX)))
        .build();
    let gateway = Gateway::new(pipeline, forwarder.clone());

    let admission = gateway.pipeline().admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;
    assert_rejected!(admission, RejectionReason::StoreUnavailable);
    assert_eq!(admission.rejection().unwrap().stage, StageKind::RateLimitAndQuota);

    let response = gateway.handle_at(&bearer_request(AUTH_KEY_TOKEN), now).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(forwarder.calls(), 0);
}

#[tokio::test]
async fn store_outage_during_limits_can_fail_open() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let config = PipelineConfig {
        rate_limit_mode: RateLimitMode::SlidingWindow,
        failure_policy: FailurePolicy::Open,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::builder()
        .spec(auth_key_api_spec())
        .sessions(sessions.clone())
        .config(config)
        .window_limiter(SlidingWindowLimiter::new(unreachable_client(RATE_LIMIT_PREFIX)))
        .quota(QuotaManager::shared(unreachable_client(QUOTA_PREFIX)))
        .build();

    assert!(pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await.is_admitted());
}

#[tokio::test]
async fn session_store_outage_rejects_as_unavailable() {
    let now = Utc::now();
    let (sessions, connector) = store_with(&auth_key_session(now)).await;
    connector.refuse_connections(true);
    connector.sever_connections();

    let admission = pipeline(&sessions).admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;

    assert_rejected!(admission, RejectionReason::StoreUnavailable);
    assert_eq!(admission.rejection().unwrap().stage, StageKind::AuthKey);
}

#[tokio::test]
async fn ignored_path_skips_authentication() {
    let now = Utc::now();
    let (sessions, _) = memory_session_store();
    let mut spec = auth_key_api_spec();
    spec.version_data.versions.get_mut("Default").unwrap().paths.ignored.push(PathRule::new("health"));
    let pipeline = Pipeline::builder().spec(spec).sessions(sessions).build();

    let request = AdmissionRequest::new(Method::GET, "/auth_key_test/health");
    let admission = pipeline.admit_at(&request, now).await;

    let Admission::Admitted(admitted) = admission else {
        panic!("expected admission, got {admission:?}");
    };
    assert!(admitted.token.is_none());
    assert!(admitted.session.is_none());
}

#[tokio::test]
async fn black_listed_path_is_denied() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let mut spec = auth_key_api_spec();
    spec.version_data.versions.get_mut("Default").unwrap().paths.black_list.push(PathRule::new("admin"));
    let pipeline = Pipeline::builder().spec(spec).sessions(sessions).build();

    let request = AdmissionRequest::new(Method::GET, "/auth_key_test/admin/users")
        .with_header("authorization", AUTH_KEY_TOKEN);
    let admission = pipeline.admit_at(&request, now).await;

    assert_rejected!(admission, RejectionReason::AccessDenied);
    assert_eq!(admission.rejection().unwrap().stage, StageKind::VersionCheck);
}

#[tokio::test]
async fn expired_version_is_not_allowed() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let mut spec = auth_key_api_spec();
    spec.version_data.versions.get_mut("Default").unwrap().expires = Some(now - TimeDelta::days(1));
    let pipeline = Pipeline::builder().spec(spec).sessions(sessions).build();

    let admission = pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;

    assert_rejected!(admission, RejectionReason::VersionNotAllowed);
    assert_eq!(admission.rejection().unwrap().message, "API version expired");
}

#[tokio::test]
async fn key_without_grant_for_api_is_denied() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.access_rights.clear();
    session.grant(AccessDefinition::new("99", "Other API", ["default"]));
    let (sessions, _) = store_with(&session).await;

    let admission = pipeline(&sessions).admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;

    assert_rejected!(admission, RejectionReason::AccessDenied);
    assert_eq!(admission.rejection().unwrap().stage, StageKind::AccessRights);
}

/// Counts the sessions handed over for write-back.
#[derive(Debug, Default)]
struct CountingRecorder {
    records: AtomicUsize,
}

#[async_trait]
impl SessionRecorder for CountingRecorder {
    async fn record(
        &self,
        _token: &str,
        _session: &SessionState,
        _now: DateTime<Utc>,
    ) -> tollgate_gateway::Result<()> {
        self.records.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn unchanged_session_is_not_written_back() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.access_rights.clear();
    session.grant(AccessDefinition::new("99", "Other API", ["default"]));
    let (sessions, _) = store_with(&session).await;
    let recorder = Arc::new(CountingRecorder::default());
    let pipeline = Pipeline::builder()
        .spec(auth_key_api_spec())
        .sessions(sessions.clone())
        .recorder(recorder.clone())
        .build();

    let admission = pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;
    assert_rejected!(admission, RejectionReason::AccessDenied);
    assert_eq!(recorder.records.load(Ordering::SeqCst), 0);

    session.grant(AccessDefinition::new("31", "Tollgate Auth Key Test", ["default"]));
    sessions.update_session(AUTH_KEY_TOKEN, &session, None).await.unwrap();
    assert!(pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await.is_admitted());
    assert_eq!(recorder.records.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn versioned_api_requires_granted_version() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let mut spec = auth_key_api_spec();
    spec.version_data.not_versioned = false;
    let v2 = spec.version_data.versions["Default"].clone();
    spec.version_data.versions.insert("v2".into(), v2);
    let pipeline = Pipeline::builder().spec(spec).sessions(sessions).build();

    let request = bearer_request(AUTH_KEY_TOKEN).with_header("version", "v2");
    assert_rejected!(pipeline.admit_at(&request, now).await, RejectionReason::AccessDenied);

    let request = bearer_request(AUTH_KEY_TOKEN).with_header("version", "v3");
    assert_rejected!(pipeline.admit_at(&request, now).await, RejectionReason::VersionNotAllowed);

    let request = bearer_request(AUTH_KEY_TOKEN);
    assert_rejected!(pipeline.admit_at(&request, now).await, RejectionReason::VersionNotAllowed);
}

#[tokio::test]
async fn ip_allow_list_runs_before_authentication() {
    let now = Utc::now();
    let mut session = auth_key_session(now);
    session.expires = Some(now - TimeDelta::seconds(1));
    let (sessions, connector) = store_with(&session).await;
    let connects = connector.connect_count();
    let mut spec = auth_key_api_spec();
    spec.enable_ip_whitelisting = true;
    spec.allowed_ips = vec!["10.0.0.0/8".into()];
    let pipeline = Pipeline::builder().spec(spec).sessions(sessions).build();

    let blocked = bearer_request(AUTH_KEY_TOKEN).with_peer_addr("192.168.0.10".parse().unwrap());
    let admission = pipeline.admit_at(&blocked, now).await;
    assert_rejected!(admission, RejectionReason::IpBlocked);
    assert_eq!(admission.rejection().unwrap().stage, StageKind::IpAllowList);
    assert_eq!(connector.connect_count(), connects);

    let allowed = bearer_request(AUTH_KEY_TOKEN).with_peer_addr("10.1.2.3".parse().unwrap());
    assert_rejected!(pipeline.admit_at(&allowed, now).await, RejectionReason::Expired);
}

#[tokio::test]
async fn stages_run_in_fixed_order() {
    let (sessions, _) = memory_session_store();
    let kinds: Vec<_> = pipeline(&sessions).stages().iter().map(|stage| stage.kind()).collect();
    assert_eq!(kinds, StageKind::ORDER);
}

#[tokio::test]
async fn health_events_are_recorded() {
    let now = Utc::now();
    let (sessions, _) = store_with(&auth_key_session(now)).await;
    let health = HealthRecorder::new(
        sessions.client().with_key_space(KeySpace::new(HEALTH_PREFIX, false)),
    );
    let pipeline = Pipeline::builder()
        .spec(auth_key_api_spec())
        .sessions(sessions.clone())
        .health(health.clone())
        .build();

    pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await;
    pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now + TimeDelta::milliseconds(1)).await;
    pipeline.admit_at(&bearer_request("nope"), now + TimeDelta::milliseconds(2)).await;

    let at = SystemTime::from(now + TimeDelta::milliseconds(3));
    assert_eq!(health.count("31", HealthEvent::Request, at).await.unwrap(), 2);
    assert_eq!(health.count("31", HealthEvent::KeyFailure, at).await.unwrap(), 1);
    assert_eq!(health.count("31", HealthEvent::QuotaViolation, at).await.unwrap(), 0);
}

#[tokio::test]
async fn pipeline_on_cluster_shares_one_store() {
    let now = Utc::now();
    let connector = MemoryConnector::new();
    let cluster = StoreCluster::new(connector.clone());
    let sessions = SessionStore::from_cluster(cluster.clone());
    sessions.update_session(AUTH_KEY_TOKEN, &auth_key_session(now), None).await.unwrap();

    let pipeline = Pipeline::on_cluster(auth_key_api_spec(), &cluster, PipelineConfig::default());
    assert!(pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await.is_admitted());

    let health = HealthRecorder::from_cluster(cluster.clone());
    let at = SystemTime::from(now + TimeDelta::milliseconds(1));
    assert_eq!(health.count("31", HealthEvent::Request, at).await.unwrap(), 1);
    assert_eq!(connector.connect_count(), 1);
}
