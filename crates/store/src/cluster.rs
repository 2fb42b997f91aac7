//! Shared connection handle.
//!
//! A [`StoreCluster`] owns at most one live connection produced by a
//! [`Connector`]. It connects lazily on first use, is cheap to clone, and all
//! clones share the same connection. There is no process-wide registry: the
//! application creates one cluster at startup and hands clones to every
//! component that needs the store.
//!
//! # Reconnects
//!
//! Every successful connect bumps a generation counter. A caller that saw a
//! connection fail passes the generation it was using to
//! [`reconnect`](StoreCluster::reconnect); if another task already replaced
//! that connection, the fresh one is returned instead of connecting again.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::{
    backend::{Connector, StoreBackend},
    error::{StoreError, StoreResult},
};

/// A connection together with the generation it belongs to.
#[derive(Clone)]
pub(crate) struct Lease {
    pub(crate) backend: Arc<dyn StoreBackend>,
    pub(crate) generation: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Lease>>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
    connect_attempts: AtomicU64,
    closed: AtomicBool,
}

/// Lazily connected, shareable store connection.
#[derive(Clone)]
pub struct StoreCluster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StoreCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCluster")
            .field("target", &self.inner.connector.describe())
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StoreCluster {
    /// Creates a cluster that will connect through `connector` on first use.
    #[must_use]
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::from_connector(Arc::new(connector))
    }

    /// Creates a cluster from a shared connector.
    #[must_use]
    pub fn from_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                current: RwLock::new(None),
                connect_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether a connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.current.read().is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of connection attempts made so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Acquire)
    }

    /// Returns the live connection, connecting first if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the cluster is closed or the
    /// connector fails.
    pub async fn connection(&self) -> StoreResult<Arc<dyn StoreBackend>> {
        Ok(self.lease().await?.backend)
    }

    pub(crate) async fn lease(&self) -> StoreResult<Lease> {
        self.ensure_open()?;
        if let Some(lease) = self.inner.current.read().clone() {
            return Ok(lease);
        }

        let _guard = self.inner.connect_lock.lock().await;
        self.ensure_open()?;
        if let Some(lease) = self.inner.current.read().clone() {
            return Ok(lease);
        }
        self.connect_locked().await
    }

    /// Replaces the connection of generation `stale` with a new one.
    ///
    /// Makes exactly one connection attempt, unless another caller already
    /// replaced that generation, in which case its connection is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the cluster is closed or the
    /// connector fails.
    pub(crate) async fn reconnect(&self, stale: u64) -> StoreResult<Lease> {
        let _guard = self.inner.connect_lock.lock().await;
        self.ensure_open()?;
        if let Some(lease) = self.inner.current.read().clone()
            && lease.generation != stale
        {
            return Ok(lease);
        }
        *self.inner.current.write() = None;
        self.connect_locked().await
    }

    /// Drops the connection and refuses further use.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if self.inner.current.write().take().is_some() {
            tracing::info!(target_store = %self.inner.connector.describe(), "store connection closed");
        }
    }

    async fn connect_locked(&self) -> StoreResult<Lease> {
        let target = self.inner.connector.describe();
        let attempt = self.inner.connect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(target_store = %target, attempt, "connecting to store");

        match self.inner.connector.connect().await {
            Ok(backend) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let lease = Lease { backend, generation };
                *self.inner.current.write() = Some(lease.clone());
                tracing::info!(target_store = %target, generation, "store connection established");
                Ok(lease)
            },
            Err(err) => {
                tracing::error!(target_store = %target, error = %err, "store connection failed");
                Err(err)
            },
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::connection("store cluster is closed"));
        }
        Ok(())
    }
}
