//! Session persistence on top of the store client.
//!
//! Sessions live under the `apikey-` namespace with hashed tokens, so the
//! store never holds a usable key in plain text.

use std::{collections::HashMap, time::Duration};

use fail::fail_point;
use tollgate_store::{KeySpace, StoreClient, StoreCluster, StoreError, keyspace::SESSION_PREFIX};

use crate::{
    error::{GatewayError, Result},
    session::SessionState,
};

/// Reads and writes [`SessionState`] records keyed by token.
#[derive(Debug, Clone)]
pub struct SessionStore {
    client: StoreClient,
}

impl SessionStore {
    /// Uses `client` as is, including its key space.
    #[must_use]
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }

    /// A store on `cluster` under the default `apikey-` namespace, with hashed keys.
    #[must_use]
    pub fn from_cluster(cluster: StoreCluster) -> Self {
        Self::new(StoreClient::new(cluster, KeySpace::new(SESSION_PREFIX, true)))
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    /// Looks up the session of `token`.
    ///
    /// Returns `Ok(None)` when no session exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the record cannot be decoded.
    #[tracing::instrument(skip_all)]
    pub async fn session_detail(&self, token: &str) -> Result<Option<SessionState>> {
        match self.client.get_key(token).await {
            Ok(raw) => Ok(Some(SessionState::from_json(&raw)?)),
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!("no session for key");
                Ok(None)
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the session of `token`, expiring it after `ttl` if given.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    #[tracing::instrument(skip_all, fields(ttl = ?ttl))]
    pub async fn update_session(
        &self,
        token: &str,
        session: &SessionState,
        ttl: Option<Duration>,
    ) -> Result<()> {
        fail_point!("session-store-update", |_| {
            Err(GatewayError::Store(StoreError::connection("injected session write failure")))
        });

        let raw = session.to_json()?;
        self.client.set_key(token, &raw, ttl).await.map_err(|err| {
            tracing::error!(error = %err, "failed to write session");
            GatewayError::from(err)
        })
    }

    /// Deletes the session of `token`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    #[tracing::instrument(skip_all)]
    pub async fn remove_session(&self, token: &str) -> Result<bool> {
        Ok(self.client.delete_key(token).await?)
    }

    /// All sessions whose stored key starts with `filter`.
    ///
    /// The map is keyed by stored key, which is the hashed token when the key
    /// space hashes. Records that fail to decode are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(skip(self))]
    pub async fn sessions(&self, filter: &str) -> Result<HashMap<String, SessionState>> {
        let raw = self.client.get_keys_and_values_with_filter(filter).await?;
        let mut sessions = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            match SessionState::from_json(&value) {
                Ok(session) => {
                    sessions.insert(key, session);
                },
                Err(err) => tracing::warn!(key = %key, error = %err, "skipping undecodable session"),
            }
        }
        Ok(sessions)
    }
}
