use super::{AdmissionContext, Verdict};
use crate::error::RejectionReason;

/// Rejects keys whose session has expired.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyExpired;

impl KeyExpired {
    pub(crate) fn evaluate(self, ctx: &AdmissionContext<'_>) -> Verdict {
        match &ctx.session {
            Some(session) if session.is_expired(ctx.now) => {
                tracing::info!(expires = ?session.expires, "attempted access from expired key");
                Verdict::reject(RejectionReason::Expired)
            },
            _ => Verdict::Continue,
        }
    }
}
