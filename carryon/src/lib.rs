//! Request-scoped baggage propagation and span annotation.
//!
//! `carryon` carries small key/value "baggage" entries across process and
//! service boundaries and stamps them onto trace spans as they are created.
//! It is built from four pieces that compose but do not require each other:
//!
//! * [`Baggage`] — an ordered, immutable-by-convention carrier of string
//!   entries, stored in a [`Context`].
//! * [`propagation`] — codecs that read and write the `baggage` and
//!   `traceparent` HTTP headers ([`propagation::BaggagePropagator`],
//!   [`propagation::TraceContextPropagator`]).
//! * [`trace`] — a minimal span pipeline: spans, processors, exporters, and
//!   the [`trace::BaggageSpanProcessor`] annotation hook that copies every
//!   carrier entry onto new spans as `baggage.<key>` attributes.
//! * [`Context`] — the execution-scoped container tying the above together,
//!   with explicit attach/detach semantics and a future combinator for
//!   crossing `.await` points.
//!
//! There is no global state: a [`trace::TracerProvider`] is built once at the
//! composition root and handed to whoever needs it.
//!
//! ```
//! use carryon::baggage::BaggageExt;
//! use carryon::trace::{BaggageSpanProcessor, InMemorySpanExporter, TracerProvider};
//! use carryon::Context;
//!
//! let exporter = InMemorySpanExporter::default();
//! let provider = TracerProvider::builder()
//!     .with_span_processor(BaggageSpanProcessor::new())
//!     .with_simple_exporter(exporter.clone())
//!     .build();
//! let tracer = provider.tracer("example");
//!
//! let cx = Context::new().with_baggage_entry("user.id", "user123");
//! let span = tracer.start_with_context("handle-request", &cx);
//! drop(span); // ends the span
//!
//! let spans = exporter.get_finished_spans().unwrap();
//! assert!(spans[0]
//!     .attributes
//!     .iter()
//!     .any(|kv| kv.key.as_str() == "baggage.user.id"));
//! provider.shutdown().unwrap();
//! ```

#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(test, deny(warnings))]

pub mod baggage;
pub use baggage::{Baggage, BaggageExt};

mod common;
pub use common::{Key, KeyValue, StringValue, Value};

mod context;
pub use context::{Context, ContextGuard, FutureExt, WithContext};

pub mod http;
pub mod propagation;
pub mod trace;
