//! Axum server demonstrating baggage propagation and span annotation.
//!
//! A middleware layer extracts `traceparent` and `baggage` from incoming
//! requests, promotes selected headers to baggage entries, and runs the rest
//! of the stack inside that context. Handlers only create spans; the
//! [`BaggageSpanProcessor`] annotates them from the carrier.
//!
//! Try it:
//!
//! ```text
//! cargo run -p carryon-axum-demo
//! curl -H 'x-user-id: user123' http://localhost:3000/user/42
//! ```

use axum::extract::{Path, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
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
use serde_json::json;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static PROVIDER: OnceLock<TracerProvider> = OnceLock::new();
static PROPAGATOR: OnceLock<TextMapCompositePropagator> = OnceLock::new();

fn provider() -> &'static TracerProvider {
    PROVIDER.get_or_init(init_tracing)
}

fn tracer() -> Tracer {
    provider().tracer("demo/axum-server")
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

/// Extract the remote context, promote request headers to baggage, and run
/// the rest of the stack inside that context.
async fn propagation_middleware(req: Request, next: Next) -> Response {
    // Keep the header borrows inside this block: holding them across the
    // `next.run` await would make the middleware future !Send.
    let cx = {
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
    };

    next.run(req).with_context(cx).await
}

/// Simulated database call, traced as a child of the active span.
async fn database_query(tracer: &Tracer) {
    let mut span = tracer.start("database-query");
    span.set_attribute(KeyValue::new("db.operation", "SELECT"));
    span.set_attribute(KeyValue::new("db.table", "users"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    span.end();
}

async fn hello_handler() -> Json<serde_json::Value> {
    let tracer = tracer();
    let span = tracer.start("hello-handler");
    let cx = Context::current_with_span(span);

    database_query(&tracer).with_context(cx.clone()).await;

    let baggage = cx
        .baggage()
        .iter()
        .map(|(key, value)| (key.to_string(), serde_json::Value::from(value.as_str())))
        .collect::<serde_json::Map<_, _>>();

    info!(name: "hello", "hello endpoint hit");
    Json(json!({
        "message": "Hello from the traced server",
        "baggage": baggage,
        "timestamp": Utc::now().to_rfc3339(),
    }))
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

async fn get_user_handler(Path(id): Path<String>) -> Response {
    get_user(tracer(), id).await
}

async fn get_user(tracer: Tracer, id: String) -> Response {
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
            Json(json!({ "user": user, "context": context })).into_response()
        }
        Err(err) => {
            error!(name: "get_user", error = %err, "user lookup failed");
            cx.span().record_exception(&err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}

fn app() -> Router {
    Router::new()
        .route("/hello", get(hello_handler))
        .route("/user/:id", get(get_user_handler))
        .layer(middleware::from_fn(propagation_middleware))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    info!("listening on http://{addr}");

    if let Err(err) = axum::serve(listener, app())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {err}");
    }

    info!("shutting down, flushing remaining spans");
    if let Err(err) = provider.shutdown() {
        error!("tracer provider shutdown failed: {err}");
    }
}
