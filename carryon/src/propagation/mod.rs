//! Codecs that move context between processes over text carriers.
//!
//! Distributed applications hand a request from service to service; the
//! propagation API serializes the parts of a [`Context`] that must survive
//! the hop — the baggage carrier and the active span identity — into
//! string key/value pairs (usually HTTP headers) and deserializes them on
//! the other side.
//!
//! * [`BaggagePropagator`] carries the baggage entries in the `baggage`
//!   header.
//! * [`TraceContextPropagator`] carries the span identity in the
//!   `traceparent` header.
//! * [`TextMapCompositePropagator`] chains both (or any set of propagators)
//!   in registration order.
//!
//! Extraction is fail-soft throughout: malformed input yields an unchanged
//! context, never an error.
//!
//! [`Context`]: crate::Context

use std::collections::HashMap;
use std::slice;

mod baggage;
mod composite;
mod trace_context;

pub use baggage::BaggagePropagator;
pub use composite::TextMapCompositePropagator;
pub use trace_context::TraceContextPropagator;

use crate::Context;

/// Injector provides an interface for adding fields to an outgoing carrier.
pub trait Injector {
    /// Add a key and value to the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an incoming carrier.
pub trait Extractor {
    /// Get a value for a key from the carrier.
    fn get(&self, key: &str) -> Option<&str>;

    /// Collect all the keys from the carrier.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    /// Collect all the keys from the HashMap.
    fn keys(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect::<Vec<_>>()
    }
}

/// Methods to inject and extract a value as text into injectors and extractors.
pub trait TextMapPropagator: std::fmt::Debug {
    /// Properly encodes the values of the current [`Context`] and injects
    /// them into the [`Injector`].
    fn inject(&self, injector: &mut dyn Injector) {
        Context::map_current(|cx| self.inject_context(cx, injector))
    }

    /// Properly encodes the values of the [`Context`] and injects them into
    /// the [`Injector`].
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector);

    /// Retrieves encoded data using the provided [`Extractor`]. If no data
    /// for this format was retrieved OR if the retrieved data is invalid,
    /// then the current [`Context`] is returned.
    fn extract(&self, extractor: &dyn Extractor) -> Context {
        Context::map_current(|cx| self.extract_with_context(cx, extractor))
    }

    /// Retrieves encoded data using the provided [`Extractor`]. If no data
    /// for this format was retrieved OR if the retrieved data is invalid,
    /// then the given [`Context`] is returned.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context;

    /// Returns iter of fields used by [`TextMapPropagator`].
    fn fields(&self) -> FieldIter<'_>;
}

/// An iterator over fields of a [`TextMapPropagator`].
#[derive(Debug)]
pub struct FieldIter<'a>(slice::Iter<'a, String>);

impl<'a> FieldIter<'a> {
    /// Create a new `FieldIter` from a slice of propagator fields.
    pub(crate) fn new(fields: &'a [String]) -> Self {
        FieldIter(fields.iter())
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|field| field.as_str())
    }
}
