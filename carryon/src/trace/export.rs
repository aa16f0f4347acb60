//! Span export sinks.
//!
//! A [`SpanExporter`] receives batches of finished [`SpanData`] from a span
//! processor and delivers them somewhere — memory, stdout, or a collector
//! over HTTP. Exporters are a best-effort sink: a failed delivery is logged
//! and the batch dropped, the request path is never blocked or failed.

use crate::trace::{SpanContext, SpanId, Status, TraceError, TraceResult};
use crate::KeyValue;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Results of an export attempt.
pub type ExportResult = Result<(), TraceError>;

/// Describes the result of the span export pipeline.
pub trait SpanExporter: Send + Sync + Debug {
    /// Exports a batch of readable spans. Protocol exporters that will
    /// implement this function are typically expected to serialize and
    /// transmit the data to the destination.
    ///
    /// This function will never be called concurrently for the same exporter
    /// instance. It can be called again only after the current call returns.
    ///
    /// This function must not block indefinitely, there must be a reasonable
    /// upper limit after which the call must time out with an error result.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. Called when the pipeline containing this
    /// exporter is shut down.
    fn shutdown(&mut self) {}

    /// This is a hint to ensure that the export of any Spans the exporter
    /// has received prior to the call to this function SHOULD be completed
    /// as soon as possible, preferably before returning from this method.
    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        Box::pin(async { Ok(()) })
    }
}

/// Representation of a finished span, as handed to exporters.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Exportable `SpanContext`
    pub span_context: SpanContext,
    /// Span parent id, [`SpanId::INVALID`] for root spans
    pub parent_span_id: SpanId,
    /// Span name
    pub name: Cow<'static, str>,
    /// Span start time
    pub start_time: SystemTime,
    /// Span end time
    pub end_time: SystemTime,
    /// Span attributes
    pub attributes: Vec<KeyValue>,
    /// The number of attributes that were above the limit, and thus dropped.
    pub dropped_attributes_count: u32,
    /// Span status
    pub status: Status,
}

/// The JSON shape spans take on the wire and on stdout.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanRecord<'a> {
    name: &'a str,
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    start_time: u64,
    end_time: u64,
    status: &'a Status,
    attributes: serde_json::Map<String, serde_json::Value>,
}

impl<'a> From<&'a SpanData> for SpanRecord<'a> {
    fn from(span: &'a SpanData) -> Self {
        let attributes = span
            .attributes
            .iter()
            .filter_map(|kv| {
                serde_json::to_value(&kv.value)
                    .ok()
                    .map(|value| (kv.key.to_string(), value))
            })
            .collect();

        SpanRecord {
            name: &span.name,
            trace_id: span.span_context.trace_id().to_string(),
            span_id: span.span_context.span_id().to_string(),
            parent_span_id: (span.parent_span_id != SpanId::INVALID)
                .then(|| span.parent_span_id.to_string()),
            start_time: unix_nanos(span.start_time),
            end_time: unix_nanos(span.end_time),
            status: &span.status,
            attributes,
        }
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// An exporter that keeps finished spans in memory, for tests and assertions.
///
/// Cloning shares the underlying storage, so a clone kept by the test sees
/// everything the pipeline exports.
///
/// # Examples
///
/// ```
/// use carryon::trace::{InMemorySpanExporter, TracerProvider};
///
/// let exporter = InMemorySpanExporter::default();
/// let provider = TracerProvider::builder()
///     .with_simple_exporter(exporter.clone())
///     .build();
///
/// let span = provider.tracer("test").start("work");
/// drop(span);
///
/// assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
/// provider.shutdown().unwrap();
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemorySpanExporter {
    /// Returns the finished spans this exporter has received so far.
    pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanData>> {
        self.spans
            .lock()
            .map(|spans_guard| spans_guard.iter().cloned().collect())
            .map_err(TraceError::from)
    }

    /// Clears the in-memory storage.
    pub fn reset(&self) {
        let _ = self.spans.lock().map(|mut spans_guard| spans_guard.clear());
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .spans
            .lock()
            .map(|mut spans_guard| spans_guard.append(&mut batch.clone()))
            .map_err(TraceError::from);
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.reset()
    }
}

impl<T> From<std::sync::PoisonError<T>> for TraceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TraceError::Other(err.to_string().into())
    }
}

/// An exporter that writes spans to stdout as JSON lines, one span per line.
#[derive(Debug, Default)]
pub struct StdoutSpanExporter {
    _private: (),
}

impl StdoutSpanExporter {
    /// Create a new stdout exporter.
    pub fn new() -> Self {
        StdoutSpanExporter { _private: () }
    }
}

impl SpanExporter for StdoutSpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = (|| {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            for span in &batch {
                let record = SpanRecord::from(span);
                serde_json::to_writer(&mut handle, &record)
                    .map_err(|err| TraceError::ExportFailed(err.to_string()))?;
                std::io::Write::write_all(&mut handle, b"\n")
                    .map_err(|err| TraceError::ExportFailed(err.to_string()))?;
            }
            Ok(())
        })();
        Box::pin(std::future::ready(result))
    }
}

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// An exporter that POSTs span batches as JSON to a collector endpoint.
///
/// Delivery is retried a bounded number of times with a short delay; after
/// that the batch is dropped with a warning. This exporter uses a blocking
/// HTTP client and is meant to run on the batch processor's own thread,
/// never on an async runtime worker.
#[derive(Debug)]
pub struct HttpJsonExporter {
    endpoint: String,
    client: reqwest::blocking::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpJsonExporter {
    /// Create an exporter that delivers spans to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpJsonExporter {
            endpoint: endpoint.into(),
            client: reqwest::blocking::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the number of delivery attempts before a batch is dropped.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between delivery attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn send(&self, body: &[SpanRecord<'_>]) -> Result<(), String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(body)
            .send()
            .map_err(|err| err.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("collector responded with {}", response.status()))
        }
    }
}

impl SpanExporter for HttpJsonExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let records = batch.iter().map(SpanRecord::from).collect::<Vec<_>>();

        let mut last_error = String::new();
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.retry_delay);
            }
            match self.send(&records) {
                Ok(()) => return Box::pin(std::future::ready(Ok(()))),
                Err(err) => last_error = err,
            }
        }

        tracing::warn!(
            name: "HttpJsonExporter.Export.Dropped",
            endpoint = self.endpoint.as_str(),
            dropped_spans = batch.len(),
            error = last_error.as_str(),
            "span batch dropped after retries were exhausted"
        );
        Box::pin(std::future::ready(Err(TraceError::ExportFailed(
            last_error,
        ))))
    }
}
