use super::{AdmissionContext, Verdict};
use crate::error::RejectionReason;

/// Checks the session's grants for the API and version.
///
/// A session without any grant may call every API. Unversioned APIs only
/// need a grant for the API itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRights;

impl AccessRights {
    pub(crate) fn evaluate(self, ctx: &AdmissionContext<'_>) -> Verdict {
        let Some(session) = &ctx.session else {
            return Verdict::Continue;
        };
        if session.access_rights.is_empty() {
            return Verdict::Continue;
        }

        let Some(grant) = session.access_rights.get(&ctx.spec.api_id) else {
            tracing::info!(api_id = %ctx.spec.api_id, "attempted access to unauthorised API");
            return Verdict::reject_with(
                RejectionReason::AccessDenied,
                "Attempted access to disallowed API",
            );
        };
        if ctx.spec.version_data.not_versioned {
            return Verdict::Continue;
        }

        match &ctx.version {
            Ok((name, _)) if grant.allows_version(name) => Verdict::Continue,
            _ => {
                tracing::info!(api_id = %ctx.spec.api_id, "attempted access to unauthorised version");
                Verdict::reject_with(
                    RejectionReason::AccessDenied,
                    "Attempted access to disallowed version",
                )
            },
        }
    }
}
