//! Writing sessions back after a request.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{error::Result, session::SessionState, session_store::SessionStore};

/// Receives the session of every request that got past authentication.
#[async_trait]
pub trait SessionRecorder: fmt::Debug + Send + Sync {
    /// Records `session` as it stood after the request, at `now`.
    async fn record(&self, token: &str, session: &SessionState, now: DateTime<Utc>) -> Result<()>;
}

/// Persists sessions through a [`SessionStore`].
///
/// Records are written without a store-level TTL unless a session lifetime
/// is configured. The record has to outlive the session's `expires`, or an
/// expired key would fail authentication instead of being reported as
/// expired. Expired sessions are not written.
#[derive(Debug, Clone)]
pub struct StoreSessionRecorder {
    sessions: SessionStore,
    session_lifetime: Option<Duration>,
}

impl StoreSessionRecorder {
    /// Writes to `sessions` with no store-level TTL.
    #[must_use]
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions, session_lifetime: None }
    }

    /// Gives every written record a store-level TTL of `lifetime`.
    ///
    /// A lifetime shorter than a key's remaining validity removes the key
    /// from the store before it expires.
    #[must_use]
    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = Some(lifetime).filter(|lifetime| !lifetime.is_zero());
        self
    }

    /// The configured store-level TTL, if any.
    #[must_use]
    pub fn session_lifetime(&self) -> Option<Duration> {
        self.session_lifetime
    }
}

#[async_trait]
impl SessionRecorder for StoreSessionRecorder {
    async fn record(&self, token: &str, session: &SessionState, now: DateTime<Utc>) -> Result<()> {
        if session.is_expired(now) {
            tracing::debug!("not recording expired session");
            return Ok(());
        }
        self.sessions.update_session(token, session, self.session_lifetime).await
    }
}
