use super::{AdmissionContext, Verdict};
use crate::error::RejectionReason;

/// Checks the requested version and the version's path rules.
///
/// Ignored paths still need a valid, unexpired version.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionCheck;

impl VersionCheck {
    pub(crate) fn evaluate(self, ctx: &AdmissionContext<'_>) -> Verdict {
        let (name, info) = match &ctx.version {
            Ok(resolved) => *resolved,
            Err(err) => {
                tracing::debug!(error = %err, "no usable version");
                return Verdict::reject_with(RejectionReason::VersionNotAllowed, err.to_string());
            },
        };

        if info.is_expired(ctx.now) {
            tracing::info!(version = name, "attempted access to expired version");
            return Verdict::reject_with(RejectionReason::VersionNotAllowed, "API version expired");
        }

        if ctx.path_status.is_denied() {
            tracing::info!(version = name, status = ?ctx.path_status, "attempted access to forbidden path");
            return Verdict::reject_with(RejectionReason::AccessDenied, "Requested endpoint is forbidden");
        }

        Verdict::Continue
    }
}
