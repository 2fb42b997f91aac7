//! Shared test utilities for admission testing.
//!
//! Fixtures for the auth-key scenario, an in-memory session store and a
//! forwarder that records what reached it. Feature-gated behind `testutil`
//! to keep it out of production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! tollgate-gateway = { path = "../gateway", features = ["testutil"] }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use tollgate_store::{MemoryConnector, keyspace::SESSION_PREFIX, testutil::memory_client};
use tokio::sync::Mutex;

use crate::{
    api::ApiSpec,
    forward::{Forwarder, GatewayResponse},
    request::AdmissionRequest,
    session::{AccessDefinition, SessionState},
    session_store::SessionStore,
};

/// Token the auth-key fixtures are stored under.
pub const AUTH_KEY_TOKEN: &str = "54321111";

/// The auth-key API definition, in its JSON layout.
pub const AUTH_KEY_API_DEFINITION: &str = r#"{
    "name": "Tollgate Auth Key Test",
    "api_id": "31",
    "org_id": "default",
    "use_keyless": false,
    "definition": {
        "location": "header",
        "key": "version"
    },
    "auth": {
        "auth_header_name": "authorization"
    },
    "version_data": {
        "not_versioned": true,
        "versions": {
            "Default": {
                "name": "Default",
                "use_extended_paths": true,
                "expires": "3000-01-02 15:04",
                "paths": {
                    "ignored": [],
                    "white_list": [],
                    "black_list": []
                }
            }
        }
    },
    "proxy": {
        "listen_path": "/auth_key_test/",
        "target_url": "http://example.com/",
        "strip_listen_path": true
    }
}"#;

/// Parses [`AUTH_KEY_API_DEFINITION`].
///
/// # Panics
///
/// Panics if the fixture no longer parses.
#[must_use]
#[allow(clippy::expect_used)]
pub fn auth_key_api_spec() -> ApiSpec {
    ApiSpec::from_json(AUTH_KEY_API_DEFINITION).expect("auth key fixture parses")
}

/// An essentially unthrottled session with a quota of 10 per 5 minutes,
/// granted API `31` version `default`, never expiring.
#[must_use]
pub fn auth_key_session(now: DateTime<Utc>) -> SessionState {
    let mut session = SessionState::builder()
        .rate(100.0)
        .per(1.0)
        .allowance(100.0)
        .last_check(now)
        .quota_max(10)
        .quota_remaining(10)
        .quota_renews(now)
        .quota_renewal_rate(300)
        .build();
    session.grant(AccessDefinition::new("31", "Tollgate Auth Key Test", ["default"]));
    session
}

/// A session store over a fresh in-memory store, plus its connector for
/// fault injection.
#[must_use]
pub fn memory_session_store() -> (SessionStore, MemoryConnector) {
    let (client, connector) = memory_client(SESSION_PREFIX, true);
    (SessionStore::new(client), connector)
}

/// `GET /auth_key_test/` carrying `token` as a bearer key.
#[must_use]
pub fn bearer_request(token: &str) -> AdmissionRequest {
    AdmissionRequest::new(Method::GET, "/auth_key_test/")
        .with_header("authorization", &format!("Bearer {token}"))
}

/// A forwarder answering `200 OK` and remembering what it was given.
#[derive(Debug, Default)]
pub struct RecordingForwarder {
    calls: AtomicUsize,
    paths: Mutex<Vec<String>>,
}

impl RecordingForwarder {
    /// Creates a forwarder with no calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of forwarded requests.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Upstream paths of the forwarded requests, in order.
    pub async fn upstream_paths(&self) -> Vec<String> {
        self.paths.lock().await.clone()
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(&self, request: &AdmissionRequest, spec: &ApiSpec) -> GatewayResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().await.push(spec.proxy.upstream_path(&request.path));
        let mut response = GatewayResponse::new(StatusCode::OK);
        response.body = "ok".to_owned();
        response
    }
}

/// Assert that an [`Admission`](crate::pipeline::Admission) is a rejection
/// with the given [`RejectionReason`](crate::error::RejectionReason).
#[macro_export]
macro_rules! assert_rejected {
    ($admission:expr, $reason:expr) => {
        match &$admission {
            $crate::pipeline::Admission::Rejected(rejection) => assert_eq!(
                rejection.reason, $reason,
                "unexpected rejection reason: {}",
                rejection.message
            ),
            other => panic!("expected rejection {:?}, got {other:?}", $reason),
        }
    };
}
