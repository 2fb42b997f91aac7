//! Verifies that admission produces the expected spans.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tollgate_gateway::{
    Pipeline,
    testutil::{AUTH_KEY_TOKEN, auth_key_api_spec, auth_key_session, bearer_request, memory_session_store},
};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names and their `stage` field
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

struct StageVisitor(Option<String>);

impl tracing::field::Visit for StageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "stage" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = StageVisitor(None);
        attrs.record(&mut visitor);
        let name = match visitor.0 {
            Some(stage) => format!("{}:{stage}", span.name()),
            None => span.name().to_owned(),
        };
        self.spans.lock().expect("lock poisoned").push(name);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admission_creates_one_span_per_stage() {
    let spans = Arc::new(Mutex::new(Vec::new()));
    let subscriber =
        tracing_subscriber::registry().with(SpanCollector { spans: Arc::clone(&spans) });
    let _guard = tracing::subscriber::set_default(subscriber);

    let now = Utc::now();
    let (sessions, _) = memory_session_store();
    sessions.update_session(AUTH_KEY_TOKEN, &auth_key_session(now), None).await.unwrap();
    let pipeline = Pipeline::builder().spec(auth_key_api_spec()).sessions(sessions).build();
    assert!(pipeline.admit_at(&bearer_request(AUTH_KEY_TOKEN), now).await.is_admitted());

    let recorded = spans.lock().expect("lock poisoned");
    let expected = [
        "admission",
        "stage:ip_allow_list",
        "stage:auth_key",
        "stage:version_check",
        "stage:key_expired",
        "stage:access_rights",
        "stage:rate_limit_and_quota",
        "session_detail",
        "update_session",
    ];
    for name in expected {
        assert!(recorded.iter().any(|s| s == name), "missing span '{name}', recorded: {recorded:?}");
    }
}

#[tokio::test]
async fn rejected_admission_stops_creating_stage_spans() {
    let spans = Arc::new(Mutex::new(Vec::new()));
    let subscriber =
        tracing_subscriber::registry().with(SpanCollector { spans: Arc::clone(&spans) });
    let _guard = tracing::subscriber::set_default(subscriber);

    let (sessions, _) = memory_session_store();
    let pipeline = Pipeline::builder().spec(auth_key_api_spec()).sessions(sessions).build();
    assert!(!pipeline.admit(&bearer_request("unknown")).await.is_admitted());

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "stage:auth_key"), "recorded: {recorded:?}");
    assert!(!recorded.iter().any(|s| s == "stage:version_check"), "recorded: {recorded:?}");
}
