//! # Tracer
//!
//! The `Tracer` is the entry point for creating `Span`s. It tracks the
//! currently active span through the [`Context`] and wires new spans to the
//! processors of the [`TracerProvider`] that created it.
use crate::trace::span::{Span, SpanData, MAX_ATTRIBUTES_PER_SPAN};
use crate::trace::{SpanContext, SpanId, Status, TraceContextExt, TraceFlags, TracerProvider};
use crate::{Context, KeyValue};
use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

/// `Tracer` implementation to create and manage spans
#[derive(Clone)]
pub struct Tracer {
    name: Cow<'static, str>,
    provider: TracerProvider,
}

impl fmt::Debug for Tracer {
    /// Formats the `Tracer` using the given formatter.
    /// Omitting `provider` here is necessary to avoid cycles.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer").field("name", &self.name).finish()
    }
}

impl Tracer {
    /// Create a new tracer (used internally by `TracerProvider`s).
    pub(crate) fn new(name: Cow<'static, str>, provider: TracerProvider) -> Self {
        Tracer { name, provider }
    }

    /// The instrumentation name of this tracer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// TracerProvider associated with this tracer.
    pub(crate) fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    /// Returns a [`SpanBuilder`] for the given span name, to set extra
    /// options before starting the span.
    pub fn span_builder<T>(&self, name: T) -> SpanBuilder
    where
        T: Into<Cow<'static, str>>,
    {
        SpanBuilder::from_name(name)
    }

    /// Starts a new `Span` in the currently active [`Context`].
    ///
    /// Each span has zero or one parent spans and zero or more child spans,
    /// which represent causally related operations. A tree of related spans
    /// comprises a trace. A span is said to be a _root span_ if it does not
    /// have a parent.
    pub fn start<T>(&self, name: T) -> Span
    where
        T: Into<Cow<'static, str>>,
    {
        let builder = self.span_builder(name);
        Context::map_current(|cx| self.build_with_context(builder, cx))
    }

    /// Starts a new `Span` with a given parent context.
    pub fn start_with_context<T>(&self, name: T, parent_cx: &Context) -> Span
    where
        T: Into<Cow<'static, str>>,
    {
        self.build_with_context(self.span_builder(name), parent_cx)
    }

    /// Start a new span and execute the given closure with a reference to the
    /// context in which the span is active.
    ///
    /// The span is ended when the closure returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use carryon::trace::{TraceContextExt, TracerProvider};
    /// use carryon::{Context, KeyValue};
    ///
    /// let provider = TracerProvider::builder().build();
    /// let tracer = provider.tracer("example");
    ///
    /// tracer.in_span("handle-request", |cx| {
    ///     cx.span().set_attribute(KeyValue::new("http.route", "/hello"));
    /// });
    /// ```
    pub fn in_span<T, F, N>(&self, name: N, f: F) -> T
    where
        F: FnOnce(Context) -> T,
        N: Into<Cow<'static, str>>,
    {
        let span = self.start(name);
        let cx = Context::current_with_span(span);
        let _guard = cx.clone().attach();
        f(cx)
    }

    /// Starts a span from a `SpanBuilder`.
    ///
    /// If the parent context holds an active span, the new span joins its
    /// trace and records it as parent; otherwise a fresh trace id is
    /// generated and the span becomes a root. All spans are recorded and
    /// marked sampled.
    pub(crate) fn build_with_context(&self, mut builder: SpanBuilder, parent_cx: &Context) -> Span {
        let provider = self.provider();
        // no point starting a span if the tracer provider has already shut down
        if provider.is_shutdown() {
            return Span::new(SpanContext::empty_context(), None, self.clone());
        }

        let span_id = provider.id_generator().new_span_id();
        let (trace_id, parent_span_id) = if parent_cx.has_active_span() {
            let psc = parent_cx.span().span_context().clone();
            (psc.trace_id(), psc.span_id())
        } else {
            (provider.id_generator().new_trace_id(), SpanId::INVALID)
        };

        let span_context = SpanContext::new(trace_id, span_id, TraceFlags::SAMPLED, false);

        // attribute keys are unique, later builder entries win
        let mut attributes: Vec<KeyValue> = Vec::new();
        let mut dropped_attributes_count = 0;
        for attribute in builder.attributes.take().unwrap_or_default() {
            if let Some(existing) = attributes.iter_mut().find(|kv| kv.key == attribute.key) {
                existing.value = attribute.value;
            } else if attributes.len() < MAX_ATTRIBUTES_PER_SPAN {
                attributes.push(attribute);
            } else {
                dropped_attributes_count += 1;
            }
        }

        let start_time = builder.start_time.unwrap_or_else(SystemTime::now);
        let mut span = Span::new(
            span_context,
            Some(SpanData {
                parent_span_id,
                name: builder.name,
                start_time,
                end_time: start_time,
                attributes,
                dropped_attributes_count,
                status: Status::Unset,
            }),
            self.clone(),
        );

        // Call `on_start` for all processors
        for processor in provider.span_processors() {
            processor.on_start(&mut span, parent_cx);
        }

        span
    }
}

/// [`Span`] options before the span is started.
#[derive(Clone, Debug, Default)]
pub struct SpanBuilder {
    /// The new span's name
    pub name: Cow<'static, str>,
    /// Span start time, `SystemTime::now()` when unset
    pub start_time: Option<SystemTime>,
    /// Span attributes
    pub attributes: Option<Vec<KeyValue>>,
}

impl SpanBuilder {
    /// Create a new span builder from a span name
    pub fn from_name<T: Into<Cow<'static, str>>>(name: T) -> Self {
        SpanBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Specify the start time of the span
    pub fn with_start_time<T: Into<SystemTime>>(self, start_time: T) -> Self {
        SpanBuilder {
            start_time: Some(start_time.into()),
            ..self
        }
    }

    /// Specify the attributes of the span
    pub fn with_attributes<I>(self, attributes: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        SpanBuilder {
            attributes: Some(attributes.into_iter().collect()),
            ..self
        }
    }

    /// Builds and starts the span with the currently active context.
    pub fn start(self, tracer: &Tracer) -> Span {
        Context::map_current(|cx| tracer.build_with_context(self, cx))
    }

    /// Builds and starts the span with the given parent context.
    pub fn start_with_context(self, tracer: &Tracer, parent_cx: &Context) -> Span {
        tracer.build_with_context(self, parent_cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{mark_span_as_active, InMemorySpanExporter, TraceId};

    fn test_pipeline() -> (Tracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider.tracer("tracer-tests"), exporter)
    }

    #[test]
    fn root_span_gets_fresh_trace_id_and_no_parent() {
        let (tracer, exporter) = test_pipeline();
        drop(tracer.start("root"));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_ne!(spans[0].span_context.trace_id(), TraceId::INVALID);
        assert_eq!(spans[0].parent_span_id, SpanId::INVALID);
        assert!(spans[0].span_context.is_sampled());
    }

    #[test]
    fn child_span_inherits_trace_id_and_records_parent() {
        let (tracer, exporter) = test_pipeline();
        let parent = tracer.start("parent");
        let parent_context = parent.span_context().clone();
        {
            let _guard = mark_span_as_active(parent);
            drop(tracer.start("child"));
        }

        let spans = exporter.get_finished_spans().unwrap();
        let child = spans.iter().find(|s| s.name == "child").unwrap();
        assert_eq!(child.span_context.trace_id(), parent_context.trace_id());
        assert_eq!(child.parent_span_id, parent_context.span_id());
        assert_ne!(child.span_context.span_id(), parent_context.span_id());
    }

    #[test]
    fn remote_parent_is_honored() {
        let (tracer, exporter) = test_pipeline();
        let remote = SpanContext::new(
            TraceId::from_u128(0xdead),
            SpanId::from_u64(0xbeef),
            TraceFlags::SAMPLED,
            true,
        );
        let cx = Context::new().with_remote_span_context(remote);
        drop(tracer.start_with_context("served", &cx));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].span_context.trace_id(), TraceId::from_u128(0xdead));
        assert_eq!(spans[0].parent_span_id, SpanId::from_u64(0xbeef));
    }

    #[test]
    fn builder_attributes_are_unique_by_key() {
        let (tracer, _exporter) = test_pipeline();
        let span = tracer
            .span_builder("deduped")
            .with_attributes([
                KeyValue::new("k", "first"),
                KeyValue::new("other", true),
                KeyValue::new("k", "second"),
            ])
            .start(&tracer);

        let data = span.data().unwrap();
        assert_eq!(data.attributes.len(), 2);
        assert_eq!(data.attributes[0], KeyValue::new("k", "second"));
    }

    #[test]
    fn builder_start_time_is_respected() {
        let (tracer, exporter) = test_pipeline();
        let start = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        drop(tracer.span_builder("timed").with_start_time(start).start(&tracer));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].start_time, start);
        assert!(spans[0].end_time >= start);
    }

    #[test]
    fn in_span_ends_span_when_closure_returns() {
        let (tracer, exporter) = test_pipeline();
        let result = tracer.in_span("scoped", |cx| {
            assert!(cx.has_active_span());
            42
        });
        assert_eq!(result, 42);
        assert_eq!(exporter.get_finished_spans().unwrap()[0].name, "scoped");
    }

    #[test]
    fn spans_after_shutdown_are_not_recording() {
        let (tracer, exporter) = test_pipeline();
        tracer.provider().shutdown().unwrap();

        let span = tracer.start("late");
        assert!(!span.is_recording());
        drop(span);
        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }
}
