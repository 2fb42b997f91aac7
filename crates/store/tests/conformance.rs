//! Conformance suite for `MemoryBackend`, and for connections handed out by
//! `MemoryConnector`.

#![allow(clippy::expect_used, clippy::panic)]

use tollgate_store::{Connector, MemoryBackend, MemoryConnector, conformance};

#[tokio::test]
async fn strings_round_trip() {
    conformance::strings_round_trip(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn ttl_is_reported() {
    conformance::ttl_is_reported(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn counters() {
    conformance::counters(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn keys_and_mget() {
    conformance::keys_and_mget(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn set_membership() {
    conformance::set_membership(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn list_append_and_range() {
    conformance::list_append_and_range(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn sorted_set_window() {
    conformance::sorted_set_window(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn batches_preserve_order() {
    conformance::batches_preserve_order(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn publish_reaches_subscriber() {
    conformance::publish_reaches_subscriber(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn health_check_is_available() {
    conformance::health_check_is_available(&MemoryBackend::new()).await;
}

/// The whole suite through a connector-issued `dyn StoreBackend`.
#[tokio::test]
async fn run_all_through_connector() {
    let connector = MemoryConnector::new();
    let backend = connector.connect().await.expect("connect");
    let backend = backend.as_ref();

    conformance::strings_round_trip(backend).await;
    conformance::ttl_is_reported(backend).await;
    conformance::counters(backend).await;
    conformance::keys_and_mget(backend).await;
    conformance::set_membership(backend).await;
    conformance::list_append_and_range(backend).await;
    conformance::sorted_set_window(backend).await;
    conformance::batches_preserve_order(backend).await;
    conformance::publish_reaches_subscriber(backend).await;
    conformance::health_check_is_available(backend).await;
}
