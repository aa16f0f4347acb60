//! Context extensions for tracing
use crate::trace::{Span, SpanContext, Status};
use crate::{Context, ContextGuard, KeyValue};
use std::borrow::Cow;
use std::error::Error;
use std::sync::{Mutex, OnceLock};

static NOOP_SPAN: OnceLock<SynchronizedSpan> = OnceLock::new();

fn noop_span() -> &'static SynchronizedSpan {
    NOOP_SPAN.get_or_init(|| SynchronizedSpan {
        span_context: SpanContext::empty_context(),
        inner: None,
    })
}

/// A reference to the currently active span in this context.
#[derive(Debug)]
pub struct SpanRef<'a>(&'a SynchronizedSpan);

#[derive(Debug)]
pub(crate) struct SynchronizedSpan {
    /// Immutable span context
    span_context: SpanContext,
    /// Mutable span inner that requires synchronization
    inner: Option<Mutex<Span>>,
}

impl From<SpanContext> for SynchronizedSpan {
    fn from(value: SpanContext) -> Self {
        Self {
            span_context: value,
            inner: None,
        }
    }
}

impl From<Span> for SynchronizedSpan {
    fn from(value: Span) -> Self {
        Self {
            span_context: value.span_context().clone(),
            inner: Some(Mutex::new(value)),
        }
    }
}

impl SpanRef<'_> {
    fn with_inner_mut<F: FnOnce(&mut Span)>(&self, f: F) {
        if let Some(ref inner) = self.0.inner {
            match inner.lock() {
                Ok(mut locked) => f(&mut locked),
                Err(err) => tracing::debug!(
                    name: "SpanRef.LockPoisoned",
                    error = %err,
                    "active span lock poisoned, dropping span operation"
                ),
            }
        }
    }

    /// A reference to the [`SpanContext`] for this span.
    pub fn span_context(&self) -> &SpanContext {
        &self.0.span_context
    }

    /// Returns `true` if this span is recording information.
    ///
    /// Spans stop recording information after they have ended.
    pub fn is_recording(&self) -> bool {
        self.0
            .inner
            .as_ref()
            .and_then(|inner| inner.lock().ok().map(|active| active.is_recording()))
            .unwrap_or(false)
    }

    /// Set an attribute of this span.
    ///
    /// Setting an attribute with the same key as an existing attribute
    /// overwrites the existing attribute's value.
    pub fn set_attribute(&self, attribute: KeyValue) {
        self.with_inner_mut(move |inner| inner.set_attribute(attribute))
    }

    /// Set multiple attributes of this span.
    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = KeyValue>) {
        self.with_inner_mut(move |inner| inner.set_attributes(attributes))
    }

    /// Sets the status of this `Span`.
    ///
    /// If used, this will override the default span status, which is [`Status::Unset`].
    pub fn set_status(&self, status: Status) {
        self.with_inner_mut(move |inner| inner.set_status(status))
    }

    /// Records an exception on this span.
    ///
    /// The error message lands in the `exception.message` attribute and the
    /// span status moves toward [`Status::Error`]; the span is not ended.
    pub fn record_exception(&self, err: &dyn Error) {
        self.with_inner_mut(move |inner| inner.record_exception(err))
    }

    /// Records an exception on this span along with its type name.
    pub fn record_exception_with_type<T>(&self, err: &dyn Error, exception_type: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_inner_mut(move |inner| {
            inner.record_exception_with_type(err, exception_type)
        })
    }

    /// Updates the span name.
    pub fn update_name<T>(&self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_inner_mut(move |inner| inner.update_name(new_name))
    }

    /// Signals that the operation described by this span has now ended.
    pub fn end(&self) {
        self.with_inner_mut(|inner| inner.end())
    }

    /// Signals that the operation described by this span ended at the given time.
    pub fn end_with_timestamp(&self, timestamp: std::time::SystemTime) {
        self.with_inner_mut(move |inner| inner.end_with_timestamp(timestamp))
    }
}

/// Methods for storing and retrieving trace data in a [`Context`].
pub trait TraceContextExt {
    /// Returns a clone of the current context with the included [`Span`].
    ///
    /// This is useful for building spans and instrumenting transactions.
    ///
    /// # Examples
    ///
    /// ```
    /// use carryon::trace::{TraceContextExt, TracerProvider};
    /// use carryon::Context;
    ///
    /// let provider = TracerProvider::builder().build();
    /// let tracer = provider.tracer("example");
    ///
    /// // build a span
    /// let span = tracer.start("parent-operation");
    ///
    /// // up-to-date context with the span added
    /// let cx = Context::current_with_span(span);
    ///
    /// // spans created in this context will be children of `parent-operation`
    /// let _guard = cx.attach();
    /// let child = tracer.start("child-operation");
    /// ```
    fn current_with_span(span: Span) -> Self;

    /// Returns a clone of this context with the included span.
    fn with_span(&self, span: Span) -> Self;

    /// Returns a reference to this context's span, or the default no-op span
    /// if none has been set.
    ///
    /// # Examples
    ///
    /// ```
    /// use carryon::trace::TraceContextExt;
    /// use carryon::Context;
    ///
    /// // Add an event to the currently active span
    /// Context::map_current(|cx| cx.span().set_attribute(carryon::KeyValue::new("step", 1i64)));
    /// ```
    fn span(&self) -> SpanRef<'_>;

    /// Returns whether or not an active span has been set.
    ///
    /// This is useful for knowing if the context has an active span without
    /// allocating the default no-op span.
    fn has_active_span(&self) -> bool;

    /// Returns a copy of this context with the span context included.
    ///
    /// This is useful for building propagators that deserialize a parent span
    /// identity received from a remote process.
    fn with_remote_span_context(&self, span_context: SpanContext) -> Self;
}

impl TraceContextExt for Context {
    fn current_with_span(span: Span) -> Self {
        Context::current_with_synchronized_span(span.into())
    }

    fn with_span(&self, span: Span) -> Self {
        self.with_synchronized_span(span.into())
    }

    fn span(&self) -> SpanRef<'_> {
        if let Some(span) = self.span.as_ref() {
            SpanRef(span)
        } else {
            SpanRef(noop_span())
        }
    }

    fn has_active_span(&self) -> bool {
        self.span.is_some()
    }

    fn with_remote_span_context(&self, span_context: SpanContext) -> Self {
        self.with_synchronized_span(span_context.into())
    }
}

/// Mark a given `Span` as active.
///
/// A span is released (its guard dropped) when it goes out of scope, which
/// also restores the previously active context.
///
/// # Examples
///
/// ```
/// use carryon::trace::{mark_span_as_active, TraceContextExt, TracerProvider};
/// use carryon::Context;
///
/// let provider = TracerProvider::builder().build();
/// let tracer = provider.tracer("example");
///
/// let parent = tracer.start("parent-operation");
/// {
///     let _guard = mark_span_as_active(parent);
///     // spans created here are children of `parent-operation`
///     let _child = tracer.start("child-operation");
/// }
/// ```
#[must_use = "Dropping the guard detaches the context."]
pub fn mark_span_as_active(span: Span) -> ContextGuard {
    let cx = Context::current_with_span(span);
    cx.attach()
}

/// Executes a closure with a reference to the current span.
///
/// The closure runs against the no-op span if no span is active.
pub fn get_active_span<F, T>(f: F) -> T
where
    F: FnOnce(SpanRef<'_>) -> T,
{
    Context::map_current(|cx| f(cx.span()))
}
