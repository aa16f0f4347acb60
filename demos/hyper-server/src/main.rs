//! Hyper server demonstrating baggage propagation and span annotation.
//!
//! Incoming requests get their `traceparent` and `baggage` headers extracted
//! into a context, selected request headers are promoted to baggage entries,
//! and every span created while handling the request carries the baggage as
//! `baggage.*` attributes.
//!
//! Try it:
//!
//! ```text
//! cargo run -p carryon-hyper-demo
//! curl -H 'x-user-id: user123' -H 'x-tenant-id: acme' http://localhost:3000/hello
//! ```

use carryon::baggage::BaggageExt;
use carryon::http::HeaderExtractor;
use carryon::propagation::{
    BaggagePropagator, TextMapCompositePropagator, TextMapPropagator, TraceContextPropagator,
};
use carryon::trace::{
    BaggageSpanProcessor, HttpJsonExporter, Status, StdoutSpanExporter, TraceContextExt, Tracer,
    TracerProvider,
};
use carryon::{Context, FutureExt, KeyValue};
use chrono::Utc;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static PROVIDER: OnceLock<TracerProvider> = OnceLock::new();
static PROPAGATOR: OnceLock<TextMapCompositePropagator> = OnceLock::new();

fn provider() -> &'static TracerProvider {
    PROVIDER.get_or_init(init_tracing)
}

fn tracer() -> Tracer {
    provider().tracer("demo/hyper-server")
}

fn propagator() -> &'static TextMapCompositePropagator {
    PROPAGATOR.get_or_init(|| {
        TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ])
    })
}

/// Spans go to a collector when `CARRYON_EXPORTER_ENDPOINT` is set, to
/// stdout otherwise.
fn init_tracing() -> TracerProvider {
    let builder = TracerProvider::builder().with_span_processor(BaggageSpanProcessor::new());
    match std::env::var("CARRYON_EXPORTER_ENDPOINT") {
        Ok(endpoint) => builder
            .with_batch_exporter(HttpJsonExporter::new(endpoint))
            .build(),
        Err(_) => builder
            .with_simple_exporter(StdoutSpanExporter::new())
            .build(),
    }
}

/// Promote request headers to baggage on top of the extracted context.
fn context_for_request<B>(req: &Request<B>) -> Context {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    };

    propagator()
        .extract(&HeaderExtractor(req.headers()))
        .with_baggage_entry("user.id", header("x-user-id").unwrap_or("anonymous").to_string())
        .with_baggage_entry(
            "tenant.id",
            header("x-tenant-id").unwrap_or("unknown").to_string(),
        )
        .with_baggage_entry("user.agent", header("user-agent").unwrap_or("unknown").to_string())
        .with_baggage_entry("request.path", req.uri().path().to_string())
        .with_baggage_entry("request.method", req.method().to_string())
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Simulated database call, traced as a child of the active span.
async fn database_query(tracer: &Tracer) {
    let mut span = tracer.start("database-query");
    span.set_attribute(KeyValue::new("db.operation", "SELECT"));
    span.set_attribute(KeyValue::new("db.table", "users"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    span.end();
}

async fn handle_hello(tracer: Tracer) -> Response<Full<Bytes>> {
    let span = tracer.start("hello-handler");
    let cx = Context::current_with_span(span);

    database_query(&tracer).with_context(cx.clone()).await;

    let baggage = cx
        .baggage()
        .iter()
        .map(|(key, value)| (key.to_string(), serde_json::Value::from(value.as_str())))
        .collect::<serde_json::Map<_, _>>();

    info!(name: "hello", "hello endpoint hit");
    json_response(
        StatusCode::OK,
        json!({
            "message": "Hello from the traced server",
            "baggage": baggage,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

#[derive(Debug, thiserror::Error)]
enum UserLookupError {
    #[error("invalid user id: {0}")]
    InvalidId(String),
}

fn lookup_user(id: &str) -> Result<serde_json::Value, UserLookupError> {
    let numeric: u64 = id
        .parse()
        .map_err(|_| UserLookupError::InvalidId(id.to_string()))?;
    Ok(json!({ "id": numeric, "name": format!("user-{numeric}") }))
}

async fn handle_get_user(tracer: Tracer, id: String) -> Response<Full<Bytes>> {
    let span = tracer.start("get-user");
    let cx = Context::current_with_span(span);
    cx.span()
        .set_attribute(KeyValue::new("http.route", "/user/{id}"));
    cx.span()
        .set_attribute(KeyValue::new("user.requested_id", id.clone()));

    match lookup_user(&id) {
        Ok(user) => {
            cx.span().set_status(Status::Ok);
            let context = cx
                .baggage()
                .iter()
                .map(|(key, value)| (key.to_string(), serde_json::Value::from(value.as_str())))
                .collect::<serde_json::Map<_, _>>();
            json_response(StatusCode::OK, json!({ "user": user, "context": context }))
        }
        Err(err) => {
            error!(name: "get_user", error = %err, "user lookup failed");
            cx.span().record_exception(&err);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal server error" }),
            )
        }
    }
}

async fn router(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let cx = context_for_request(&req);
    let tracer = tracer();

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/hello") => handle_hello(tracer).with_context(cx).await,
        (&Method::GET, path) if path.starts_with("/user/") => {
            let id = path.trim_start_matches("/user/").to_string();
            handle_get_user(tracer, id).with_context(cx).await
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "Not found" })),
    };

    Ok(response)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let provider = provider().clone();
    let port = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    info!("listening on http://{addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _addr)) = accepted else { continue };
                tokio::spawn(async move {
                    if let Err(err) = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service_fn(router))
                        .await
                    {
                        error!("connection error: {err}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down, flushing remaining spans");
    if let Err(err) = provider.shutdown() {
        error!("tracer provider shutdown failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carryon::trace::InMemorySpanExporter;
    use http_body_util::BodyExt;

    fn test_pipeline() -> (TracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_span_processor(BaggageSpanProcessor::new())
            .with_simple_exporter(exporter.clone())
            .build();
        (provider, exporter)
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn lookup_user_parses_numeric_ids() {
        assert_eq!(lookup_user("42").unwrap()["name"], "user-42");
        assert!(lookup_user("forty-two").is_err());
    }

    #[tokio::test]
    async fn hello_reports_baggage_in_body_and_span() {
        let (provider, exporter) = test_pipeline();
        let cx = Context::new().with_baggage_entry("user.id", "user123");

        let response = handle_hello(provider.tracer("test")).with_context(cx).await;
        let body = body_json(response).await;
        assert_eq!(body["baggage"]["user.id"], "user123");

        let spans = exporter.get_finished_spans().unwrap();
        let hello = spans.iter().find(|s| s.name == "hello-handler").unwrap();
        assert!(hello
            .attributes
            .contains(&KeyValue::new("baggage.user.id", "user123")));

        let query = spans.iter().find(|s| s.name == "database-query").unwrap();
        assert_eq!(query.parent_span_id, hello.span_context.span_id());
        assert!(query
            .attributes
            .contains(&KeyValue::new("db.operation", "SELECT")));
    }

    #[tokio::test]
    async fn get_user_error_path_records_exception() {
        let (provider, exporter) = test_pipeline();

        let response = handle_get_user(provider.tracer("test"), "oops".to_string()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal server error");

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].status, Status::error("invalid user id: oops"));
        assert!(spans[0]
            .attributes
            .contains(&KeyValue::new("exception.message", "invalid user id: oops")));
    }

    #[tokio::test]
    async fn get_user_happy_path_sets_ok_status() {
        let (provider, exporter) = test_pipeline();

        let response = handle_get_user(provider.tracer("test"), "7".to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user"]["id"], 7);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].status, Status::Ok);
        assert!(spans[0]
            .attributes
            .contains(&KeyValue::new("user.requested_id", "7")));
    }

    #[tokio::test]
    async fn malformed_propagation_headers_still_serve_the_request() {
        let (provider, _exporter) = test_pipeline();
        let req = Request::builder()
            .uri("/hello")
            .header("baggage", "not-a-pair,also;bad")
            .header("traceparent", "zz-garbage")
            .header("x-user-id", "user123")
            .body(())
            .unwrap();

        let cx = context_for_request(&req);
        let response = handle_hello(provider.tracer("test")).with_context(cx).await;
        assert_eq!(response.status(), StatusCode::OK);

        // the garbage headers contribute nothing; only promoted entries remain
        let body = body_json(response).await;
        assert_eq!(body["baggage"]["user.id"], "user123");
        assert_eq!(body["baggage"].as_object().unwrap().len(), 5);
    }
}
