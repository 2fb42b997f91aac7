//! Verifies that store operations produce the expected spans.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use tollgate_store::{Command, MemoryBackend, StoreBackend, testutil::memory_client};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn collect() -> (SpanCollector, Arc<Mutex<Vec<String>>>) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    (collector, spans)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backend_operations_create_spans() {
    let (collector, spans) = collect();
    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let backend = MemoryBackend::new();
    let _ = backend.query(Command::Get { key: "k".into() }).await;
    let _ = backend.transaction(vec![Command::Get { key: "k".into() }]).await;
    let _ = backend.pipeline(vec![Command::Get { key: "k".into() }]).await;
    let _ = backend.health_check().await;

    let recorded = spans.lock().expect("lock poisoned");
    for name in ["query", "transaction", "pipeline", "health_check"] {
        assert!(recorded.iter().any(|s| s == name), "missing span '{name}', recorded: {recorded:?}");
    }
}

#[tokio::test]
async fn client_operations_nest_backend_spans() {
    let (collector, spans) = collect();
    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let (client, _) = memory_client("apikey-", true);
    client.set_key("token", "v", None).await.expect("set");
    let _ = client.get_key("token").await;
    let _ = client.set_rolling_window("w", std::time::Duration::from_secs(1), None).await;

    let recorded = spans.lock().expect("lock poisoned");
    for name in ["set_key", "get_key", "set_rolling_window_at", "query", "transaction"] {
        assert!(recorded.iter().any(|s| s == name), "missing span '{name}', recorded: {recorded:?}");
    }
}
