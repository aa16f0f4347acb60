//! # Tracer Provider
//!
//! The `TracerProvider` handles the creation and management of [`Tracer`]
//! instances and coordinates span processing. It is the central
//! configuration point for tracing: every `Tracer` it hands out shares its
//! processors and id generator.
//!
//! Cloning a `TracerProvider` creates a new reference to the same provider,
//! not a new instance. Dropping the last reference triggers shutdown, which
//! flushes all remaining spans through the configured processors. Once shut
//! down, the provider is disabled: its tracers produce non-recording spans
//! and nothing further is exported.
use crate::trace::id_generator::{IdGenerator, RandomIdGenerator};
use crate::trace::span_processor::{
    BatchSpanProcessor, SimpleSpanProcessor, SpanProcessor,
};
use crate::trace::{SpanExporter, TraceError, TraceResult, Tracer};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// TracerProvider inner type
#[derive(Debug)]
pub(crate) struct TracerProviderInner {
    processors: Vec<Box<dyn SpanProcessor>>,
    id_generator: Box<dyn IdGenerator>,
    is_shutdown: AtomicBool,
}

impl TracerProviderInner {
    /// Shutdown shared by explicit `shutdown` calls and `Drop` of the last
    /// reference.
    fn shutdown(&self) -> Vec<TraceResult<()>> {
        let mut results = Vec::with_capacity(self.processors.len());
        for processor in &self.processors {
            let result = processor.shutdown();
            if let Err(err) = &result {
                tracing::debug!(
                    name: "TracerProvider.Shutdown.Error",
                    error = format!("{err}"),
                    "span processor failed to shut down"
                );
            }
            results.push(result);
        }
        results
    }
}

impl Drop for TracerProviderInner {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            let _ = self.shutdown(); // errors are handled within shutdown
        }
    }
}

/// Creator and registry of named [`Tracer`] instances.
///
/// # Examples
///
/// ```
/// use carryon::trace::{StdoutSpanExporter, TracerProvider};
///
/// let provider = TracerProvider::builder()
///     .with_simple_exporter(StdoutSpanExporter::new())
///     .build();
///
/// let tracer = provider.tracer("service");
/// tracer.in_span("operation", |_cx| {
///     // traced work
/// });
///
/// provider.shutdown().unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct TracerProvider {
    inner: Arc<TracerProviderInner>,
}

impl Default for TracerProvider {
    fn default() -> Self {
        TracerProvider::builder().build()
    }
}

impl TracerProvider {
    /// Create a new `TracerProvider` builder.
    pub fn builder() -> TracerProviderBuilder {
        TracerProviderBuilder::default()
    }

    /// Create a [`Tracer`] with the given instrumentation name.
    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> Tracer {
        Tracer::new(name.into(), self.clone())
    }

    /// Span processors associated with this provider.
    pub(crate) fn span_processors(&self) -> &[Box<dyn SpanProcessor>] {
        &self.inner.processors
    }

    /// Id generator associated with this provider.
    pub(crate) fn id_generator(&self) -> &dyn IdGenerator {
        self.inner.id_generator.as_ref()
    }

    /// true if this provider has been shut down.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Relaxed)
    }

    /// Force flush all remaining spans in span processors and return results.
    ///
    /// This blocks the calling thread until all pending spans have been
    /// handed to the exporters.
    pub fn force_flush(&self) -> TraceResult<()> {
        let results: Vec<_> = self
            .span_processors()
            .iter()
            .map(|processor| processor.force_flush())
            .collect();
        if results.iter().all(|r| r.is_ok()) {
            Ok(())
        } else {
            Err(TraceError::ExportFailed(format!(
                "force flush errors: {:?}",
                results.into_iter().filter_map(Result::err).collect::<Vec<_>>()
            )))
        }
    }

    /// Shuts down this `TracerProvider`, draining and flushing the
    /// processors.
    ///
    /// Shutdown happens exactly once: a second call returns
    /// [`TraceError::TracerProviderAlreadyShutdown`] without touching the
    /// processors again.
    pub fn shutdown(&self) -> TraceResult<()> {
        if self
            .inner
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let results = self.inner.shutdown();
            if results.iter().all(|res| res.is_ok()) {
                Ok(())
            } else {
                Err(TraceError::ExportFailed(format!(
                    "shutdown errors: {:?}",
                    results.into_iter().filter_map(Result::err).collect::<Vec<_>>()
                )))
            }
        } else {
            Err(TraceError::TracerProviderAlreadyShutdown)
        }
    }
}

/// Builder for provider attributes.
#[derive(Debug, Default)]
pub struct TracerProviderBuilder {
    processors: Vec<Box<dyn SpanProcessor>>,
    id_generator: Option<Box<dyn IdGenerator>>,
}

impl TracerProviderBuilder {
    /// Adds a [SimpleSpanProcessor] with the configured exporter to the
    /// pipeline.
    ///
    /// Every finished span is exported immediately on the thread that ended
    /// it. Prefer [`with_batch_exporter`](Self::with_batch_exporter) outside
    /// of tests and debugging.
    pub fn with_simple_exporter<T: SpanExporter + 'static>(self, exporter: T) -> Self {
        self.with_span_processor(SimpleSpanProcessor::new(Box::new(exporter)))
    }

    /// Adds a [BatchSpanProcessor] with the configured exporter to the
    /// pipeline, using the default batch configuration (overridable through
    /// `CARRYON_BSP_*` environment variables).
    pub fn with_batch_exporter<T: SpanExporter + Send + 'static>(self, exporter: T) -> Self {
        self.with_span_processor(BatchSpanProcessor::builder(exporter).build())
    }

    /// Adds a custom [`SpanProcessor`] to the pipeline.
    ///
    /// Processors run in registration order for both `on_start` and `on_end`.
    pub fn with_span_processor<T: SpanProcessor + 'static>(mut self, processor: T) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Replace the default [`RandomIdGenerator`].
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Create a new provider from this configuration.
    pub fn build(self) -> TracerProvider {
        TracerProvider {
            inner: Arc::new(TracerProviderInner {
                processors: self.processors,
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Box::<RandomIdGenerator>::default()),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::export::{ExportResult, SpanData};
    use crate::trace::InMemorySpanExporter;
    use crate::Context;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct CountingProcessor(Arc<AtomicUsize>);

    impl SpanProcessor for CountingProcessor {
        fn on_start(&self, _span: &mut crate::trace::Span, _cx: &Context) {}

        fn on_end(&self, _span: SpanData) {}

        fn force_flush(&self) -> TraceResult<()> {
            Ok(())
        }

        fn shutdown(&self) -> TraceResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let shutdown_count = Arc::new(AtomicUsize::new(0));
        let provider = TracerProvider::builder()
            .with_span_processor(CountingProcessor(shutdown_count.clone()))
            .build();

        assert!(provider.shutdown().is_ok());
        assert!(matches!(
            provider.shutdown(),
            Err(TraceError::TracerProviderAlreadyShutdown)
        ));
        assert_eq!(shutdown_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_of_last_reference_shuts_down() {
        let shutdown_count = Arc::new(AtomicUsize::new(0));
        let provider = TracerProvider::builder()
            .with_span_processor(CountingProcessor(shutdown_count.clone()))
            .build();

        let clone = provider.clone();
        drop(provider);
        assert_eq!(shutdown_count.load(Ordering::SeqCst), 0, "clone still alive");

        drop(clone);
        assert_eq!(shutdown_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_shutdown_prevents_drop_shutdown() {
        let shutdown_count = Arc::new(AtomicUsize::new(0));
        let provider = TracerProvider::builder()
            .with_span_processor(CountingProcessor(shutdown_count.clone()))
            .build();

        provider.shutdown().unwrap();
        drop(provider);
        assert_eq!(shutdown_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn processors_run_in_registration_order() {
        #[derive(Debug)]
        struct OrderProcessor(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

        impl SpanProcessor for OrderProcessor {
            fn on_start(&self, _span: &mut crate::trace::Span, _cx: &Context) {
                self.1.lock().unwrap().push(self.0);
            }
            fn on_end(&self, _span: SpanData) {}
            fn force_flush(&self) -> TraceResult<()> {
                Ok(())
            }
            fn shutdown(&self) -> TraceResult<()> {
                Ok(())
            }
        }

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let provider = TracerProvider::builder()
            .with_span_processor(OrderProcessor("first", order.clone()))
            .with_span_processor(OrderProcessor("second", order.clone()))
            .build();

        drop(provider.tracer("ordering").start("span"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn force_flush_reaches_all_processors() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter.clone())
            .build();

        drop(provider.tracer("flush").start("pending"));
        provider.force_flush().unwrap();
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
        provider.shutdown().unwrap();
    }

    #[test]
    fn custom_id_generator_is_used_for_new_spans() {
        use crate::trace::{SpanId, TraceId};

        #[derive(Debug)]
        struct FixedIdGenerator;

        impl IdGenerator for FixedIdGenerator {
            fn new_trace_id(&self) -> TraceId {
                TraceId::from_u128(0xfeed)
            }
            fn new_span_id(&self) -> SpanId {
                SpanId::from_u64(0xbeef)
            }
        }

        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_id_generator(FixedIdGenerator)
            .with_simple_exporter(exporter.clone())
            .build();

        drop(provider.tracer("ids").start("span"));
        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].span_context.trace_id(), TraceId::from_u128(0xfeed));
        assert_eq!(spans[0].span_context.span_id(), SpanId::from_u64(0xbeef));
        provider.shutdown().unwrap();
    }

    #[test]
    fn shutdown_error_is_surfaced() {
        #[derive(Debug)]
        struct FailingExporter;

        impl SpanExporter for FailingExporter {
            fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
                Box::pin(std::future::ready(Err(TraceError::ExportFailed(
                    "collector offline".into(),
                ))))
            }
        }

        let provider = TracerProvider::builder()
            .with_batch_exporter(FailingExporter)
            .build();
        drop(provider.tracer("failing").start("span"));

        let result = provider.shutdown();
        assert!(matches!(result, Err(TraceError::ExportFailed(_))));
    }
}
