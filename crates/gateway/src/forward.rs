//! Handing admitted requests on, and answering rejected ones.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};

use crate::{
    api::ApiSpec,
    pipeline::{Admission, Pipeline, Rejection},
    request::AdmissionRequest,
};

/// A response produced by the gateway or the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: String,
}

impl GatewayResponse {
    /// An empty response with `status`.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: String::new() }
    }

    /// The JSON error response for `rejection`:
    /// `{"error": <message>, "code": <reason code>}`.
    #[must_use]
    pub fn rejected(rejection: &Rejection) -> Self {
        let body = serde_json::json!({
            "error": rejection.message,
            "code": rejection.reason.code(),
        });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self { status: rejection.reason.status(), headers, body: body.to_string() }
    }
}

/// Sends admitted requests upstream.
///
/// Only called after the pipeline admitted the request.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forwards `request` to the upstream of `spec`.
    async fn forward(&self, request: &AdmissionRequest, spec: &ApiSpec) -> GatewayResponse;
}

/// A pipeline in front of a forwarder.
#[derive(Clone)]
pub struct Gateway {
    pipeline: Pipeline,
    forwarder: Arc<dyn Forwarder>,
}

impl Gateway {
    /// Admits with `pipeline` and forwards through `forwarder`.
    #[must_use]
    pub fn new(pipeline: Pipeline, forwarder: Arc<dyn Forwarder>) -> Self {
        Self { pipeline, forwarder }
    }

    /// The admission pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Handles `request` now.
    pub async fn handle(&self, request: &AdmissionRequest) -> GatewayResponse {
        self.handle_at(request, Utc::now()).await
    }

    /// Handles `request` with the clock reading `now`.
    pub async fn handle_at(&self, request: &AdmissionRequest, now: DateTime<Utc>) -> GatewayResponse {
        match self.pipeline.admit_at(request, now).await {
            Admission::Admitted(_) => self.forwarder.forward(request, self.pipeline.spec()).await,
            Admission::Rejected(rejection) => GatewayResponse::rejected(&rejection),
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("pipeline", &self.pipeline).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{error::RejectionReason, pipeline::StageKind};

    #[test]
    fn test_rejection_body() {
        let rejection = Rejection {
            stage: StageKind::RateLimitAndQuota,
            reason: RejectionReason::QuotaExceeded,
            message: "Quota exceeded".into(),
        };
        let response = GatewayResponse::rejected(&rejection);
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.headers[CONTENT_TYPE], "application/json");

        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"], "Quota exceeded");
        assert_eq!(body["code"], "quota_exceeded");
    }
}
