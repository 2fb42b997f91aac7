//! Gateway error types.
//!
//! Two kinds of failure leave the admission pipeline:
//!
//! - [`RejectionReason`]: a business decision about the request (bad key,
//!   exhausted quota, ...). Each reason carries a stable HTTP status and code.
//! - [`GatewayError`]: something went wrong talking to the store or decoding a
//!   session. The pipeline turns these into a `StoreUnavailable` rejection
//!   according to its failure policy; they never reach the caller raw.

use std::fmt;

use http::StatusCode;
use thiserror::Error;
use tollgate_store::StoreError;

/// Errors raised by session persistence and limiters.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. Downstream match expressions must
/// include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The store failed.
    #[error("Store error: {0}")]
    Store(
        /// The underlying store error.
        #[from]
        StoreError,
    ),

    /// A session record could not be encoded or decoded.
    #[error("Session encoding error: {0}")]
    Serialization(
        /// The underlying JSON error.
        #[from]
        serde_json::Error,
    ),

    /// A session holds values the limiters cannot work with.
    #[error("Invalid session: {0}")]
    InvalidSession(String),
}

impl GatewayError {
    /// Returns `true` if the error came from the store rather than the data.
    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Why a request was refused.
///
/// Every reason maps to its own code and message, so callers can tell a
/// throttled key from an exhausted quota even where the HTTP status is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RejectionReason {
    /// The client address is not on the API's allow list.
    IpBlocked,
    /// The key is missing or unknown.
    AuthFailed,
    /// The requested API version is missing, unknown or expired.
    VersionNotAllowed,
    /// The key has expired.
    Expired,
    /// The key may not access this API, version or path.
    AccessDenied,
    /// The key exceeded its rate limit.
    RateLimited,
    /// The key used up its quota.
    QuotaExceeded,
    /// The limits could not be checked because the store failed.
    StoreUnavailable,
}

impl RejectionReason {
    /// HTTP status returned for this reason.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::AuthFailed | Self::Expired => StatusCode::UNAUTHORIZED,
            Self::IpBlocked | Self::VersionNotAllowed | Self::AccessDenied | Self::QuotaExceeded => {
                StatusCode::FORBIDDEN
            },
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::IpBlocked => "ip_blocked",
            Self::AuthFailed => "auth_failed",
            Self::VersionNotAllowed => "version_not_allowed",
            Self::Expired => "key_expired",
            Self::AccessDenied => "access_denied",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    /// Default human-readable message.
    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            Self::IpBlocked => "Access from this IP has been disallowed",
            Self::AuthFailed => "Key not authorised",
            Self::VersionNotAllowed => "Access to this API version has been disallowed",
            Self::Expired => "Key has expired, please renew",
            Self::AccessDenied => "Access to this API has been disallowed",
            Self::RateLimited => "Rate limit exceeded",
            Self::QuotaExceeded => "Quota exceeded",
            Self::StoreUnavailable => "Limits could not be verified, try again later",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
