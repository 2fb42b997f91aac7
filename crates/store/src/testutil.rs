//! Shared test helpers for store consumers.
//!
//! Feature-gated behind `testutil`. Enable it in `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! tollgate-store = { path = "../store", features = ["testutil"] }
//! ```

use crate::{
    client::StoreClient,
    cluster::StoreCluster,
    keyspace::KeySpace,
    memory::MemoryConnector,
};

/// A client over a fresh in-memory store, plus the connector for fault injection.
#[must_use]
pub fn memory_client(prefix: &str, hash_keys: bool) -> (StoreClient, MemoryConnector) {
    let connector = MemoryConnector::new();
    let cluster = StoreCluster::new(connector.clone());
    (StoreClient::new(cluster, KeySpace::new(prefix, hash_keys)), connector)
}

/// Assert that a [`StoreResult`](crate::StoreResult) is a [`StoreError::NotFound`](crate::StoreError::NotFound).
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StoreError::NotFound { .. })),
            "expected StoreError::NotFound, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StoreResult`](crate::StoreResult) is a [`StoreError::Connection`](crate::StoreError::Connection).
#[macro_export]
macro_rules! assert_connection_error {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StoreError::Connection { .. })),
            "expected StoreError::Connection, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StoreError::Connection { .. })),
            "{}: expected StoreError::Connection, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StoreResult`](crate::StoreResult) is `Ok` and return the value.
#[macro_export]
macro_rules! assert_store_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StoreError: {e:?}"),
        }
    };
}
