//! # Composite Propagator
//!
//! A utility over multiple `Propagator`s to group multiple Propagators from
//! different cross-cutting concerns in order to leverage them as a single
//! entity.

use crate::propagation::{Extractor, FieldIter, Injector, TextMapPropagator};
use crate::Context;
use std::collections::HashSet;

/// Composite propagator for [`TextMapPropagator`]s.
///
/// A propagator that chains multiple [`TextMapPropagator`] propagators
/// together, injecting or extracting by their respective HTTP header names.
///
/// Injection and extraction from this propagator will preserve the order of
/// the propagators passed in during initialization.
///
/// # Examples
///
/// ```
/// use carryon::baggage::BaggageExt;
/// use carryon::propagation::{
///     BaggagePropagator, TextMapCompositePropagator, TextMapPropagator,
///     TraceContextPropagator,
/// };
/// use carryon::trace::{TraceContextExt, TracerProvider};
/// use carryon::Context;
/// use std::collections::HashMap;
///
/// // First create 1 or more propagators
/// let trace_context_propagator = TraceContextPropagator::new();
/// let baggage_propagator = BaggagePropagator::new();
///
/// // Then create a composite propagator
/// let composite_propagator = TextMapCompositePropagator::new(vec![
///     Box::new(trace_context_propagator),
///     Box::new(baggage_propagator),
/// ]);
///
/// // Then for a given implementation of `Injector`
/// let mut injector = HashMap::new();
///
/// // And a given span
/// let provider = TracerProvider::builder().build();
/// let example_span = provider.tracer("example-component").start("span-name");
///
/// // with the current context, call inject to add the headers
/// composite_propagator.inject_context(
///     &Context::current_with_span(example_span)
///         .with_baggage_entry("test", "example"),
///     &mut injector,
/// );
///
/// // The injector now has both `baggage` and `traceparent` headers
/// assert!(injector.get("baggage").is_some());
/// assert!(injector.get("traceparent").is_some());
/// ```
#[derive(Debug)]
pub struct TextMapCompositePropagator {
    propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>>,
    fields: Vec<String>,
}

impl TextMapCompositePropagator {
    /// Constructs a new propagator out of instances of [`TextMapPropagator`].
    pub fn new(propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>>) -> Self {
        let mut fields = HashSet::new();
        for propagator in &propagators {
            for field in propagator.fields() {
                fields.insert(field.to_string());
            }
        }

        TextMapCompositePropagator {
            propagators,
            fields: fields.into_iter().collect(),
        }
    }
}

impl TextMapPropagator for TextMapCompositePropagator {
    /// Encodes the values of the `Context` and injects them into the `Injector`.
    fn inject_context(&self, context: &Context, injector: &mut dyn Injector) {
        for propagator in &self.propagators {
            propagator.inject_context(context, injector)
        }
    }

    /// Retrieves encoded `Context` information using the `Extractor`. If no
    /// data was retrieved OR if the retrieved data is invalid, then the
    /// given `Context` is returned.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.propagators
            .iter()
            .fold(cx.clone(), |current_cx, propagator| {
                propagator.extract_with_context(&current_cx, extractor)
            })
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(self.fields.as_slice())
    }
}
