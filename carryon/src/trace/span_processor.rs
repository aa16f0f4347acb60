//! # Span Processor
//!
//! Span processors sit between span creation and export. Every processor
//! registered on a [`TracerProvider`] is invoked, in registration order, with
//! `on_start` when a span is created and `on_end` when it finishes. This is
//! where spans are annotated from the baggage carrier and where finished
//! spans are handed to an exporter, either immediately
//! ([`SimpleSpanProcessor`]) or in background batches
//! ([`BatchSpanProcessor`]).
//!
//! [`TracerProvider`]: crate::trace::TracerProvider

use crate::baggage::BaggageExt;
use crate::trace::export::{SpanData, SpanExporter};
use crate::trace::{Span, TraceError, TraceResult};
use crate::{Context, KeyValue};
use futures_executor::block_on;
use std::cmp::min;
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Delay interval between two consecutive exports, in milliseconds.
pub(crate) const CARRYON_BSP_SCHEDULE_DELAY: &str = "CARRYON_BSP_SCHEDULE_DELAY";
/// Default delay interval between two consecutive exports.
pub(crate) const CARRYON_BSP_SCHEDULE_DELAY_DEFAULT: u64 = 5_000;
/// Maximum queue size.
pub(crate) const CARRYON_BSP_MAX_QUEUE_SIZE: &str = "CARRYON_BSP_MAX_QUEUE_SIZE";
/// Default maximum queue size.
pub(crate) const CARRYON_BSP_MAX_QUEUE_SIZE_DEFAULT: usize = 2_048;
/// Maximum batch size, must be less than or equal to the maximum queue size.
pub(crate) const CARRYON_BSP_MAX_EXPORT_BATCH_SIZE: &str = "CARRYON_BSP_MAX_EXPORT_BATCH_SIZE";
/// Default maximum batch size.
pub(crate) const CARRYON_BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT: usize = 512;
/// Maximum allowed time to export data, in milliseconds.
pub(crate) const CARRYON_BSP_EXPORT_TIMEOUT: &str = "CARRYON_BSP_EXPORT_TIMEOUT";
/// Default maximum allowed time to export data.
pub(crate) const CARRYON_BSP_EXPORT_TIMEOUT_DEFAULT: u64 = 30_000;

/// A hook into the span start and end lifecycle events.
///
/// `on_start` runs synchronously while the caller is still waiting for the
/// span, so it must stay cheap and must never perform I/O. `on_end` receives
/// the finished span's data and owns delivery from there.
pub trait SpanProcessor: Send + Sync + std::fmt::Debug {
    /// `on_start` is called when a `Span` is started, before the caller
    /// receives it. The parent context (holding the baggage carrier) is
    /// passed along.
    fn on_start(&self, span: &mut Span, cx: &Context);
    /// `on_end` is called after a `Span` is ended (i.e., the end timestamp
    /// is already set).
    fn on_end(&self, span: SpanData);
    /// Force the spans lying in the cache to be exported.
    fn force_flush(&self) -> TraceResult<()>;
    /// Shuts down the processor. Implementation should make sure shutdown
    /// can be called multiple times.
    fn shutdown(&self) -> TraceResult<()>;
}

/// A [`SpanProcessor`] that copies every baggage entry of the parent context
/// onto new spans as a `baggage.<key>` attribute.
///
/// Annotation happens exactly once per span, at creation time, in carrier
/// iteration order — so it deterministically overwrites any same-named
/// attribute supplied through the span builder. It is a pure function of
/// the carrier: the same baggage always yields the same attribute set.
///
/// # Examples
///
/// ```
/// use carryon::baggage::BaggageExt;
/// use carryon::trace::{BaggageSpanProcessor, InMemorySpanExporter, TracerProvider};
/// use carryon::Context;
///
/// let exporter = InMemorySpanExporter::default();
/// let provider = TracerProvider::builder()
///     .with_span_processor(BaggageSpanProcessor::new())
///     .with_simple_exporter(exporter.clone())
///     .build();
///
/// let cx = Context::new().with_baggage_entry("tenant.id", "acme");
/// drop(provider.tracer("example").start_with_context("work", &cx));
///
/// let span = &exporter.get_finished_spans().unwrap()[0];
/// assert_eq!(span.attributes[0].key.as_str(), "baggage.tenant.id");
/// provider.shutdown().unwrap();
/// ```
#[derive(Debug, Default)]
pub struct BaggageSpanProcessor {
    _private: (),
}

impl BaggageSpanProcessor {
    /// Create a new baggage annotation processor.
    pub fn new() -> Self {
        BaggageSpanProcessor { _private: () }
    }
}

impl SpanProcessor for BaggageSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        for (key, value) in cx.baggage() {
            span.set_attribute(KeyValue::new(
                format!("baggage.{key}"),
                value.clone(),
            ));
        }
    }

    fn on_end(&self, _span: SpanData) {
        // Ignored
    }

    fn force_flush(&self) -> TraceResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        Ok(())
    }
}

/// A [SpanProcessor] that passes finished spans to the configured
/// `SpanExporter`, as soon as they are finished, without any batching. This is
/// typically useful for debugging and testing. For scenarios requiring higher
/// performance/throughput, consider using [BatchSpanProcessor].
#[derive(Debug)]
pub struct SimpleSpanProcessor {
    exporter: Mutex<Box<dyn SpanExporter>>,
}

impl SimpleSpanProcessor {
    /// Create a new [SimpleSpanProcessor] using the provided exporter.
    pub fn new(exporter: Box<dyn SpanExporter>) -> Self {
        Self {
            exporter: Mutex::new(exporter),
        }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {
        // Ignored
    }

    fn on_end(&self, span: SpanData) {
        let result = self
            .exporter
            .lock()
            .map_err(|_| TraceError::Other("SimpleSpanProcessor mutex poison".into()))
            .and_then(|mut exporter| block_on(exporter.export(vec![span])));

        if let Err(err) = result {
            tracing::debug!(
                name: "SimpleSpanProcessor.OnEnd.Error",
                reason = format!("{err:?}"),
                "failed to export span"
            );
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        // Nothing to flush for simple span processor.
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        if let Ok(mut exporter) = self.exporter.lock() {
            exporter.shutdown();
            Ok(())
        } else {
            Err(TraceError::Other(
                "SimpleSpanProcessor mutex poison at shutdown".into(),
            ))
        }
    }
}

/// Messages exchanged between the main thread and the background thread.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum BatchMessage {
    ExportSpan(SpanData),
    ForceFlush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
}

/// A batch span processor with a dedicated background thread.
///
/// Finished spans go into a bounded queue with a non-blocking `try_send`;
/// when the queue is full the span is dropped and counted, the request path
/// never waits. The background thread exports when a batch fills up or the
/// schedule delay elapses, whichever comes first.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    forceflush_timeout: Duration,
    shutdown_timeout: Duration,
    is_shutdown: AtomicBool,
    dropped_span_count: Arc<AtomicUsize>,
}

impl BatchSpanProcessor {
    /// Creates a new instance of `BatchSpanProcessor` with the given config.
    pub fn new<E>(mut exporter: E, config: BatchConfig) -> Self
    where
        E: SpanExporter + Send + 'static,
    {
        let (message_sender, message_receiver) = sync_channel(config.max_queue_size);
        let export_timeout = config.max_export_timeout;

        let handle = thread::Builder::new()
            .name("BatchSpanProcessorThread".to_string())
            .spawn(move || {
                let mut spans: Vec<SpanData> = Vec::new();
                let mut last_export_time = Instant::now();

                let mut export = |spans: &mut Vec<SpanData>| -> TraceResult<()> {
                    if spans.is_empty() {
                        return Ok(());
                    }
                    block_on(exporter.export(spans.split_off(0)))
                };

                loop {
                    let timeout = config
                        .scheduled_delay
                        .saturating_sub(last_export_time.elapsed());
                    match message_receiver.recv_timeout(timeout) {
                        Ok(BatchMessage::ExportSpan(span)) => {
                            spans.push(span);
                            if spans.len() >= config.max_export_batch_size {
                                if let Err(err) = export(&mut spans) {
                                    tracing::debug!(
                                        name: "BatchSpanProcessor.Export.Error",
                                        reason = format!("{err:?}"),
                                        "batch export failed"
                                    );
                                }
                                last_export_time = Instant::now();
                            }
                        }
                        Ok(BatchMessage::ForceFlush(sender)) => {
                            let result = export(&mut spans);
                            last_export_time = Instant::now();
                            let _ = sender.send(result);
                        }
                        Ok(BatchMessage::Shutdown(sender)) => {
                            let result = export(&mut spans);
                            exporter.shutdown();
                            let _ = sender.send(result);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(err) = export(&mut spans) {
                                tracing::debug!(
                                    name: "BatchSpanProcessor.Export.Error",
                                    reason = format!("{err:?}"),
                                    "scheduled batch export failed"
                                );
                            }
                            last_export_time = Instant::now();
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            tracing::debug!(
                                name: "BatchSpanProcessor.ChannelDisconnected",
                                "channel disconnected, shutting down processor thread"
                            );
                            break;
                        }
                    }
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(
                    name: "BatchSpanProcessor.ThreadSpawnFailed",
                    error = %err,
                    "failed to spawn batch export thread, spans will be dropped"
                );
                None
            }
        };

        Self {
            message_sender,
            handle: Mutex::new(handle),
            forceflush_timeout: export_timeout,
            shutdown_timeout: export_timeout,
            is_shutdown: AtomicBool::new(false),
            dropped_span_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a builder for a processor that will forward spans to the given
    /// exporter.
    pub fn builder<E>(exporter: E) -> BatchSpanProcessorBuilder<E>
    where
        E: SpanExporter + Send + 'static,
    {
        BatchSpanProcessorBuilder {
            exporter,
            config: BatchConfig::default(),
        }
    }
}

impl SpanProcessor for BatchSpanProcessor {
    /// Handles span start.
    fn on_start(&self, _span: &mut Span, _cx: &Context) {
        // Ignored
    }

    /// Handles span end. Never blocks: a full queue drops the span.
    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        let result = self.message_sender.try_send(BatchMessage::ExportSpan(span));

        if result.is_err() {
            // Count the drop; only the first occurrence logs, the total is
            // reported at shutdown.
            if self.dropped_span_count.fetch_add(1, Ordering::Relaxed) == 0 {
                tracing::warn!(
                    name: "BatchSpanProcessor.SpanDroppingStarted",
                    "span dropped because the export queue is full; subsequent drops are counted and reported at shutdown"
                );
            }
        }
    }

    /// Flushes all pending spans.
    fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::Other("Processor already shutdown".into()));
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::ForceFlush(sender))
            .map_err(|_| TraceError::Other("Failed to send ForceFlush message".into()))?;

        receiver
            .recv_timeout(self.forceflush_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.forceflush_timeout))?
    }

    /// Shuts down the processor, draining the queue first.
    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::Other("Processor already shutdown".into()));
        }
        let dropped_spans = self.dropped_span_count.load(Ordering::Relaxed);
        if dropped_spans > 0 {
            tracing::warn!(
                name: "BatchSpanProcessor.SpansDropped",
                dropped_spans,
                "spans were dropped due to a full export queue"
            );
        }

        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::Shutdown(sender))
            .map_err(|_| TraceError::Other("Failed to send Shutdown message".into()))?;

        let result = receiver
            .recv_timeout(self.shutdown_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.shutdown_timeout))?;
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        result
    }
}

/// Builder for [`BatchSpanProcessor`].
#[derive(Debug, Default)]
pub struct BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + Send + 'static,
{
    exporter: E,
    config: BatchConfig,
}

impl<E> BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + Send + 'static,
{
    /// Set the BatchConfig for [BatchSpanProcessorBuilder]
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        BatchSpanProcessorBuilder { config, ..self }
    }

    /// Build a new instance of `BatchSpanProcessor`.
    pub fn build(self) -> BatchSpanProcessor {
        BatchSpanProcessor::new(self.exporter, self.config)
    }
}

/// Batch span processor configuration.
/// Use [`BatchConfigBuilder`] to configure your own instance of [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfig {
    /// The maximum queue size to buffer spans for delayed processing. If the
    /// queue gets full it drops the spans. The default value is 2048.
    pub(crate) max_queue_size: usize,

    /// The delay interval in milliseconds between two consecutive processing
    /// of batches. The default value is 5 seconds.
    pub(crate) scheduled_delay: Duration,

    /// The maximum number of spans to process in a single batch. If there are
    /// more than one batch worth of spans then it processes multiple batches
    /// of spans one batch after the other without any delay. The default
    /// value is 512.
    pub(crate) max_export_batch_size: usize,

    /// The maximum duration to export a batch of data.
    pub(crate) max_export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// A builder for creating [`BatchConfig`] instances.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    max_export_timeout: Duration,
}

impl Default for BatchConfigBuilder {
    /// Create a new [`BatchConfigBuilder`] initialized with the default batch
    /// config values. The values are overridden by environment variables if
    /// set. The supported environment variables are:
    /// * `CARRYON_BSP_MAX_QUEUE_SIZE`
    /// * `CARRYON_BSP_SCHEDULE_DELAY`
    /// * `CARRYON_BSP_MAX_EXPORT_BATCH_SIZE`
    /// * `CARRYON_BSP_EXPORT_TIMEOUT`
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: CARRYON_BSP_MAX_QUEUE_SIZE_DEFAULT,
            scheduled_delay: Duration::from_millis(CARRYON_BSP_SCHEDULE_DELAY_DEFAULT),
            max_export_batch_size: CARRYON_BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT,
            max_export_timeout: Duration::from_millis(CARRYON_BSP_EXPORT_TIMEOUT_DEFAULT),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Set max_queue_size for [`BatchConfigBuilder`].
    /// It's the maximum queue size to buffer spans for delayed processing.
    /// If the queue gets full it will drop the spans.
    /// The default value is 2048.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set max_export_batch_size for [`BatchConfigBuilder`].
    /// It's the maximum number of spans to process in a single batch. If
    /// there are more than one batch worth of spans then it processes
    /// multiple batches of spans one batch after the other without any
    /// delay. The default value is 512.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set scheduled_delay for [`BatchConfigBuilder`].
    /// It's the delay interval in milliseconds between two consecutive
    /// processing of batches. The default value is 5000 milliseconds.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set max_export_timeout for [`BatchConfigBuilder`].
    /// It's the maximum duration to export a batch of data.
    /// The default value is 30000 milliseconds.
    pub fn with_max_export_timeout(mut self, max_export_timeout: Duration) -> Self {
        self.max_export_timeout = max_export_timeout;
        self
    }

    /// Builds a `BatchConfig` enforcing the following invariants:
    /// * `max_export_batch_size` must be less than or equal to `max_queue_size`.
    pub fn build(self) -> BatchConfig {
        // max export batch size must be less or equal to max queue size.
        // we set max export batch size to max queue size if it's larger than max queue size.
        let max_export_batch_size = min(self.max_export_batch_size, self.max_queue_size);

        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_timeout: self.max_export_timeout,
            max_export_batch_size,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env::var(CARRYON_BSP_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|queue_size| usize::from_str(&queue_size).ok())
        {
            self.max_queue_size = max_queue_size;
        }

        if let Some(scheduled_delay) = env::var(CARRYON_BSP_SCHEDULE_DELAY)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay);
        }

        if let Some(max_export_batch_size) = env::var(CARRYON_BSP_MAX_EXPORT_BATCH_SIZE)
            .ok()
            .and_then(|batch_size| usize::from_str(&batch_size).ok())
        {
            self.max_export_batch_size = max_export_batch_size;
        }

        if let Some(max_export_timeout) = env::var(CARRYON_BSP_EXPORT_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.max_export_timeout = Duration::from_millis(max_export_timeout);
        }

        self
    }
}
