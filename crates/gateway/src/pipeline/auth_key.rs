use super::{AdmissionContext, Verdict};
use crate::{api::PathStatus, error::RejectionReason, session_store::SessionStore};

/// Resolves the key in the API's auth header to its session.
///
/// The header value is used as the token, after removing an optional
/// `Bearer ` prefix. Requests on ignored paths pass without a session.
#[derive(Debug, Clone)]
pub struct AuthKey {
    sessions: SessionStore,
}

impl AuthKey {
    /// Looks sessions up in `sessions`.
    #[must_use]
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions }
    }

    pub(crate) async fn evaluate(&self, ctx: &mut AdmissionContext<'_>) -> Verdict {
        if ctx.path_status == PathStatus::Ignored {
            tracing::debug!("ignored path, skipping authentication");
            return Verdict::Continue;
        }

        let (spec, request) = (ctx.spec, ctx.request);
        let header = spec.auth.auth_header_name.as_str();
        let token = request.header(header).map(strip_bearer).unwrap_or_default();
        if token.is_empty() {
            tracing::info!(header, "attempted access with malformed header, no auth header found");
            return Verdict::reject_with(RejectionReason::AuthFailed, "Authorization field missing");
        }

        match self.sessions.session_detail(token).await {
            Ok(Some(session)) => {
                ctx.authenticate(token, session);
                Verdict::Continue
            },
            Ok(None) => {
                tracing::info!("attempted access with non-existent key");
                Verdict::reject(RejectionReason::AuthFailed)
            },
            Err(err) if err.is_store() => {
                tracing::error!(error = %err, "session lookup failed");
                Verdict::reject(RejectionReason::StoreUnavailable)
            },
            Err(err) => {
                tracing::warn!(error = %err, "stored session is unusable");
                Verdict::reject(RejectionReason::AuthFailed)
            },
        }
    }
}

/// Removes a case-insensitive `Bearer ` prefix and surrounding whitespace.
#[must_use]
pub fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim_start(),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("Bearer 54321111", "54321111")]
    #[case("bearer   54321111", "54321111")]
    #[case("BEARER 54321111 ", "54321111")]
    #[case("54321111", "54321111")]
    #[case("Bearer", "Bearer")]
    #[case("Bearer ", "Bearer")]
    #[case("", "")]
    #[case("Bearér x", "Bearér x")]
    fn test_strip_bearer(#[case] raw: &str, #[case] token: &str) {
        assert_eq!(strip_bearer(raw), token);
    }
}
