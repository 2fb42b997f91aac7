//! # Tollgate Gateway
//!
//! Request admission for an API gateway: every inbound request is
//! authenticated by its key, checked against the API's version and path
//! rules and the key's access rights, and counted against the key's rate
//! limit and quota before it may be forwarded.
//!
//! This crate provides:
//! - **Sessions**: [`SessionState`] and its persistence in a [`SessionStore`]
//! - **Limits**: leaky-bucket and sliding-window rate limiting, quotas with renewal
//! - **Admission**: the ordered [`Pipeline`] of stages and the [`Gateway`] front end
//! - **Health**: per-API event counters in rolling windows
//!
//! All state lives in a [`tollgate_store`] cluster shared by every gateway
//! process; the pipeline itself keeps nothing between requests.
//!
//! ## Failure policy
//!
//! A store failure while checking limits rejects the request with
//! `503 StoreUnavailable` unless the pipeline is configured with
//! [`FailurePolicy::Open`].
//!
//! ## Example
//!
//! ```no_run
//! use tollgate_gateway::{AdmissionRequest, ApiSpec, Pipeline, PipelineConfig};
//! use tollgate_store::{MemoryConnector, StoreCluster};
//!
//! # async fn example(spec: ApiSpec) {
//! let cluster = StoreCluster::new(MemoryConnector::new());
//! let pipeline = Pipeline::on_cluster(spec, &cluster, PipelineConfig::default());
//!
//! let request = AdmissionRequest::new(http::Method::GET, "/orders/")
//!     .with_header("Authorization", "Bearer 54321111");
//! let admission = pipeline.admit(&request).await;
//! println!("admitted: {}", admission.is_admitted());
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Parsed API definitions.
pub mod api;
/// Error and rejection types.
pub mod error;
/// Forwarding collaborator and gateway front end.
pub mod forward;
/// Per-API health counters.
pub mod health;
/// The admission pipeline and its stages.
pub mod pipeline;
/// Quota accounting.
pub mod quota;
/// Rate limiting.
pub mod rate_limiter;
/// Session write-back collaborator.
pub mod recorder;
/// Inbound request model.
pub mod request;
/// Session state of an API key.
pub mod session;
/// Session persistence.
pub mod session_store;
/// Shared test utilities.
#[cfg(feature = "testutil")]
pub mod testutil;

// Re-export key types for convenience
pub use api::{ApiSpec, PathRule, PathStatus, VersionInfo};
pub use error::{GatewayError, RejectionReason, Result};
pub use forward::{Forwarder, Gateway, GatewayResponse};
pub use health::{HealthEvent, HealthRecorder};
pub use pipeline::{
    Admission, Admitted, FailurePolicy, Pipeline, PipelineConfig, Rejection, Stage, StageKind,
};
pub use quota::{QuotaCounter, QuotaDecision, QuotaManager, QuotaMode};
pub use rate_limiter::{RateDecision, RateLimitMode, SlidingWindowLimiter, leaky_bucket};
pub use recorder::{SessionRecorder, StoreSessionRecorder};
pub use request::AdmissionRequest;
pub use session::{AccessDefinition, SessionState, UNLIMITED_QUOTA};
pub use session_store::SessionStore;
