//! # Span
//!
//! `Span`s represent a single operation within a trace. `Span`s can be nested
//! to form a trace tree. Each trace contains a root span, which typically
//! describes the end-to-end latency and, optionally, one or more sub-spans
//! for its sub-operations.
//!
//! A span moves through exactly three states: requested (a builder),
//! started (this type, while it still holds recording data), and ended. The
//! start time is set on creation; [`Span::end`] is the only forward
//! transition and is terminal. After end, attribute and status mutations are
//! silently ignored. Dropping a started span ends it, so aborted requests
//! still produce terminated spans.
use crate::trace::{SpanContext, SpanId, Status, Tracer};
use crate::KeyValue;
use std::borrow::Cow;
use std::error::Error;
use std::time::SystemTime;

/// Hard cap on attributes recorded per span; excess sets are counted and
/// dropped.
pub(crate) const MAX_ATTRIBUTES_PER_SPAN: usize = 128;

/// Single operation within a trace.
#[derive(Debug)]
pub struct Span {
    span_context: SpanContext,
    data: Option<SpanData>,
    tracer: Tracer,
}

/// Recording state of a started span. `None` once the span has ended.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SpanData {
    /// Span parent id
    pub(crate) parent_span_id: SpanId,
    /// Span name
    pub(crate) name: Cow<'static, str>,
    /// Span start time
    pub(crate) start_time: SystemTime,
    /// Span end time
    pub(crate) end_time: SystemTime,
    /// Span attributes, unique by key
    pub(crate) attributes: Vec<KeyValue>,
    /// The number of attributes that were above the limit, and thus dropped.
    pub(crate) dropped_attributes_count: u32,
    /// Span status
    pub(crate) status: Status,
}

impl Span {
    pub(crate) fn new(span_context: SpanContext, data: Option<SpanData>, tracer: Tracer) -> Self {
        Span {
            span_context,
            data,
            tracer,
        }
    }

    /// Operate on a mutable reference to span data
    fn with_data<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&mut SpanData) -> T,
    {
        self.data.as_mut().map(f)
    }

    /// Returns the `SpanContext` for the given `Span`.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Returns true if this `Span` is recording information like attributes
    /// using `set_attribute` or status with `set_status`.
    /// Always returns false after span `end`.
    pub fn is_recording(&self) -> bool {
        self.data.is_some()
    }

    /// Sets a single attribute on this span.
    ///
    /// Attribute keys are unique: setting a key that is already present
    /// replaces its value in place, keeping the attribute's original
    /// position. Ignored after the span has ended.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        self.with_data(|data| data_set_attribute(data, attribute));
    }

    /// Sets multiple attributes on this span.
    pub fn set_attributes(&mut self, attributes: impl IntoIterator<Item = KeyValue>) {
        self.with_data(|data| {
            for attribute in attributes {
                data_set_attribute(data, attribute);
            }
        });
    }

    /// Sets the status of this `Span`.
    ///
    /// If used, this will override the default span status, which is
    /// [`Status::Unset`]. Status values form a total order:
    /// `Ok > Error > Unset`, and an update only applies if the new status is
    /// greater than the current one — an `Ok` outcome cannot be downgraded
    /// back to an error.
    pub fn set_status(&mut self, status: Status) {
        self.with_data(|data| {
            // check if we should update the status
            if status > data.status {
                data.status = status;
            }
        });
    }

    /// Updates the `Span`'s name.
    pub fn update_name<T>(&mut self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_data(|data| {
            data.name = new_name.into();
        });
    }

    /// Records an exception on this span.
    ///
    /// The error message is attached as the `exception.message` attribute
    /// and the span status moves toward [`Status::Error`] carrying the same
    /// message. The span is not ended; the caller decides when the operation
    /// is over.
    pub fn record_exception(&mut self, err: &dyn Error) {
        let message = err.to_string();
        self.set_attribute(KeyValue::new("exception.message", message.clone()));
        self.set_status(Status::error(message));
    }

    /// Records an exception on this span along with its type name, attached
    /// as the `exception.type` attribute.
    pub fn record_exception_with_type<T>(&mut self, err: &dyn Error, exception_type: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.set_attribute(KeyValue::new("exception.type", exception_type.into()));
        self.record_exception(err);
    }

    /// Signals that the operation described by this span has now ended.
    pub fn end(&mut self) {
        self.end_internal(None);
    }

    /// Finishes the span with given timestamp.
    pub fn end_with_timestamp(&mut self, timestamp: SystemTime) {
        self.end_internal(Some(timestamp));
    }

    fn end_internal(&mut self, timestamp: Option<SystemTime>) {
        match self.data.take() {
            Some(data) => {
                end_and_export_span(data, self.span_context.clone(), &self.tracer, timestamp)
            }
            None => {
                // ending twice is legal but worth a diagnostic
                tracing::debug!(
                    name: "Span.End.AlreadyEnded",
                    span_id = %self.span_context.span_id(),
                    "end() called on a span that has already ended, ignoring"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn data(&self) -> Option<&SpanData> {
        self.data.as_ref()
    }
}

impl Drop for Span {
    /// Report span on inner drop
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            end_and_export_span(data, self.span_context.clone(), &self.tracer, None);
        }
    }
}

fn data_set_attribute(data: &mut SpanData, attribute: KeyValue) {
    if let Some(existing) = data
        .attributes
        .iter_mut()
        .find(|kv| kv.key == attribute.key)
    {
        existing.value = attribute.value;
    } else if data.attributes.len() < MAX_ATTRIBUTES_PER_SPAN {
        data.attributes.push(attribute);
    } else {
        data.dropped_attributes_count += 1;
    }
}

fn build_export_data(data: SpanData, span_context: SpanContext) -> crate::trace::export::SpanData {
    crate::trace::export::SpanData {
        span_context,
        parent_span_id: data.parent_span_id,
        name: data.name,
        start_time: data.start_time,
        end_time: data.end_time,
        attributes: data.attributes,
        dropped_attributes_count: data.dropped_attributes_count,
        status: data.status,
    }
}

fn end_and_export_span(
    mut data: SpanData,
    span_context: SpanContext,
    tracer: &Tracer,
    timestamp: Option<SystemTime>,
) {
    let provider = tracer.provider();
    // skip if provider has been shut down
    if provider.is_shutdown() {
        return;
    }

    // ensure end time is set via explicit end or implicitly on drop
    if let Some(timestamp) = timestamp {
        data.end_time = timestamp;
    } else if data.end_time == data.start_time {
        data.end_time = SystemTime::now();
    }

    match provider.span_processors() {
        [] => {}
        [processor] => {
            processor.on_end(build_export_data(data, span_context));
        }
        processors => {
            for processor in processors {
                processor.on_end(build_export_data(data.clone(), span_context.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{InMemorySpanExporter, TracerProvider};
    use std::time::Duration;

    fn tracer_with_exporter() -> (crate::trace::Tracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider.tracer("span-tests"), exporter)
    }

    #[test]
    fn set_attribute_replaces_existing_key_in_place() {
        let (tracer, _exporter) = tracer_with_exporter();
        let mut span = tracer.start("attrs");
        span.set_attribute(KeyValue::new("first", 1_i64));
        span.set_attribute(KeyValue::new("second", 2_i64));
        span.set_attribute(KeyValue::new("first", 10_i64));

        let data = span.data().unwrap();
        assert_eq!(data.attributes.len(), 2);
        assert_eq!(data.attributes[0], KeyValue::new("first", 10_i64));
        assert_eq!(data.attributes[1], KeyValue::new("second", 2_i64));
    }

    #[test]
    fn attributes_above_limit_are_dropped_and_counted() {
        let (tracer, _exporter) = tracer_with_exporter();
        let mut span = tracer.start("limits");
        for i in 0..MAX_ATTRIBUTES_PER_SPAN + 3 {
            span.set_attribute(KeyValue::new(format!("key{i}"), i as i64));
        }

        let data = span.data().unwrap();
        assert_eq!(data.attributes.len(), MAX_ATTRIBUTES_PER_SPAN);
        assert_eq!(data.dropped_attributes_count, 3);
    }

    #[test]
    fn mutations_after_end_are_ignored() {
        let (tracer, exporter) = tracer_with_exporter();
        let mut span = tracer.start("ended");
        span.set_attribute(KeyValue::new("kept", true));
        span.end();

        assert!(!span.is_recording());
        span.set_attribute(KeyValue::new("late", true));
        span.set_status(Status::error("late"));
        drop(span);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1, "double end must not re-export");
        assert_eq!(spans[0].attributes, vec![KeyValue::new("kept", true)]);
        assert_eq!(spans[0].status, Status::Unset);
    }

    #[test]
    fn double_end_preserves_first_end_time() {
        let (tracer, exporter) = tracer_with_exporter();
        let mut span = tracer.start("times");
        let first_end = SystemTime::now() + Duration::from_secs(1);
        span.end_with_timestamp(first_end);
        span.end_with_timestamp(first_end + Duration::from_secs(100));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end_time, first_end);
    }

    #[test]
    fn drop_ends_span() {
        let (tracer, exporter) = tracer_with_exporter();
        {
            let _span = tracer.start("dropped");
        }
        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "dropped");
        assert!(spans[0].end_time >= spans[0].start_time);
    }

    #[test]
    fn status_order_is_unset_error_ok() {
        let (tracer, _exporter) = tracer_with_exporter();
        let mut span = tracer.start("status");
        span.set_status(Status::error("failed"));
        assert_eq!(span.data().unwrap().status, Status::error("failed"));

        // Ok beats Error
        span.set_status(Status::Ok);
        assert_eq!(span.data().unwrap().status, Status::Ok);

        // and nothing downgrades Ok
        span.set_status(Status::error("late failure"));
        assert_eq!(span.data().unwrap().status, Status::Ok);
    }

    #[test]
    fn record_exception_sets_attribute_and_status() {
        let (tracer, _exporter) = tracer_with_exporter();
        let mut span = tracer.start("exceptions");
        let err = std::io::Error::new(std::io::ErrorKind::Other, "database unavailable");
        span.record_exception(&err);

        let data = span.data().unwrap();
        assert_eq!(
            data.attributes,
            vec![KeyValue::new("exception.message", "database unavailable")]
        );
        assert_eq!(data.status, Status::error("database unavailable"));
        assert!(span.is_recording(), "recording an exception does not end the span");
    }

    #[test]
    fn record_exception_with_type_adds_type_attribute() {
        let (tracer, _exporter) = tracer_with_exporter();
        let mut span = tracer.start("typed-exceptions");
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "query timed out");
        span.record_exception_with_type(&err, "TimeoutError");

        let data = span.data().unwrap();
        assert!(data
            .attributes
            .contains(&KeyValue::new("exception.type", "TimeoutError")));
        assert!(data
            .attributes
            .contains(&KeyValue::new("exception.message", "query timed out")));
        assert_eq!(data.status, Status::error("query timed out"));
    }
}
