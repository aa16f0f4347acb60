//! End-to-end propagation tests: incoming headers are extracted into a
//! context, baggage rides along across task boundaries, and finished spans
//! come out of the exporter annotated with `baggage.*` attributes.

use carryon::baggage::BaggageExt;
use carryon::http::{HeaderExtractor, HeaderInjector};
use carryon::propagation::{
    BaggagePropagator, TextMapCompositePropagator, TextMapPropagator, TraceContextPropagator,
};
use carryon::trace::{
    BaggageSpanProcessor, InMemorySpanExporter, SpanId, TraceContextExt, TraceId, TracerProvider,
};
use carryon::{Context, FutureExt, KeyValue};
use std::collections::HashMap;

fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

fn annotated_pipeline() -> (TracerProvider, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    let provider = TracerProvider::builder()
        .with_span_processor(BaggageSpanProcessor::new())
        .with_simple_exporter(exporter.clone())
        .build();
    (provider, exporter)
}

#[test]
fn extracted_headers_annotate_spans() {
    let propagator = composite_propagator();
    let (provider, exporter) = annotated_pipeline();

    let mut headers = http::HeaderMap::new();
    headers.insert(
        "traceparent",
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
            .parse()
            .unwrap(),
    );
    headers.insert("baggage", "tenant.id=acme,region=eu-west".parse().unwrap());
    headers.insert("x-user-id", "user123".parse().unwrap());

    // middleware: extract the carrier, then promote request headers to baggage
    let cx = propagator.extract(&HeaderExtractor(&headers));
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");
    let cx = cx.with_baggage_entry("user.id", user_id.to_string());

    let span = provider.tracer("server").start_with_context("handle", &cx);
    drop(span);

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];

    assert_eq!(
        span.span_context.trace_id(),
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
    );
    assert_eq!(
        span.parent_span_id,
        SpanId::from_hex("00f067aa0ba902b7").unwrap()
    );
    assert_eq!(
        span.attributes,
        vec![
            KeyValue::new("baggage.tenant.id", "acme"),
            KeyValue::new("baggage.region", "eu-west"),
            KeyValue::new("baggage.user.id", "user123"),
        ],
        "annotation preserves carrier insertion order"
    );

    provider.shutdown().unwrap();
}

#[test]
fn malformed_headers_fall_back_to_clean_root() {
    let propagator = composite_propagator();
    let (provider, exporter) = annotated_pipeline();

    let mut headers = http::HeaderMap::new();
    headers.insert("traceparent", "00-not-a-trace".parse().unwrap());
    headers.insert("baggage", "no equals sign anywhere".parse().unwrap());

    let cx = propagator.extract(&HeaderExtractor(&headers));
    assert!(!cx.has_active_span(), "invalid traceparent is discarded");
    assert_eq!(cx.baggage().len(), 0, "malformed baggage yields no entries");

    drop(provider.tracer("server").start_with_context("handle", &cx));

    let spans = exporter.get_finished_spans().unwrap();
    assert_ne!(spans[0].span_context.trace_id(), TraceId::INVALID);
    assert_eq!(spans[0].parent_span_id, SpanId::INVALID);
    assert!(spans[0].attributes.is_empty());

    provider.shutdown().unwrap();
}

#[test]
fn context_round_trips_through_headers() {
    let propagator = composite_propagator();
    let provider = TracerProvider::builder().build();

    let span = provider.tracer("client").start("outbound");
    let cx = Context::current_with_span(span)
        .with_baggage_entry("user.id", "user123")
        .with_baggage_entry("tenant.id", "acme");
    let sent_span_context = cx.span().span_context().clone();

    let mut headers = http::HeaderMap::new();
    propagator.inject_context(&cx, &mut HeaderInjector(&mut headers));

    assert!(headers.contains_key("traceparent"));
    assert_eq!(
        headers.get("baggage").unwrap(),
        "user.id=user123,tenant.id=acme"
    );

    // server side
    let remote_cx = propagator.extract(&HeaderExtractor(&headers));
    let remote_span_context = remote_cx.span().span_context().clone();
    assert_eq!(remote_span_context.trace_id(), sent_span_context.trace_id());
    assert_eq!(remote_span_context.span_id(), sent_span_context.span_id());
    assert!(remote_span_context.is_remote());
    assert_eq!(
        remote_cx.baggage().to_string(),
        "user.id=user123,tenant.id=acme"
    );
}

#[test]
fn injection_into_hashmap_carrier() {
    let propagator = BaggagePropagator::new();
    let cx = Context::new().with_baggage_entry("request.path", "/user/42");

    let mut carrier = HashMap::new();
    propagator.inject_context(&cx, &mut carrier);
    assert_eq!(
        carrier.get("baggage").map(String::as_str),
        Some("request.path=/user/42")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_do_not_share_baggage() {
    let (provider, exporter) = annotated_pipeline();

    let mut handles = Vec::new();
    for i in 0..16 {
        let provider = provider.clone();
        let cx = Context::new().with_baggage_entry("user.id", format!("user-{i}"));
        handles.push(tokio::spawn(
            async move {
                // hop across await points so tasks interleave on the worker
                // threads while each carries its own context
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                let span = Context::map_current(|cx| {
                    provider.tracer("worker").start_with_context("job", cx)
                });
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                drop(span);
            }
            .with_context(cx),
        ));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 16);

    let mut seen = std::collections::HashSet::new();
    for span in &spans {
        assert_eq!(span.attributes.len(), 1);
        let value = span.attributes[0].value.as_str().into_owned();
        assert_eq!(span.attributes[0].key.as_str(), "baggage.user.id");
        assert!(seen.insert(value), "baggage leaked between tasks");
    }

    provider.shutdown().unwrap();
}
