//! The `trace` module includes types for tracking the progression of a single
//! request while it is handled by services that make up an application. A
//! trace is a tree of [`Span`]s, objects that represent the work being done
//! by individual services or components involved in a request as it flows
//! through a system.
//!
//! ## Getting Started
//!
//! ```no_run
//! use carryon::trace::{StdoutSpanExporter, TracerProvider};
//!
//! fn main() {
//!     // Create a new trace pipeline that prints to stdout
//!     let provider = TracerProvider::builder()
//!         .with_simple_exporter(StdoutSpanExporter::new())
//!         .build();
//!     let tracer = provider.tracer("example");
//!
//!     tracer.in_span("doing_work", |cx| {
//!         // Traced app logic here...
//!     });
//!
//!     // Shutdown trace pipeline
//!     provider.shutdown().expect("tracer provider should shut down cleanly");
//! }
//! ```
//!
//! ## Overview
//!
//! A [`Tracer`], obtained from a [`TracerProvider`], creates [`Span`]s. A
//! span has a [`SpanContext`] carrying the identifiers that cross process
//! boundaries, recording state (name, attributes, [`Status`]) while it is
//! live, and is handed to the provider's [`SpanProcessor`]s when it ends.
//! Processors deliver finished spans to a [`SpanExporter`], either inline
//! ([`SimpleSpanProcessor`]) or on a background thread
//! ([`BatchSpanProcessor`]). The [`BaggageSpanProcessor`] annotates every new
//! span with the baggage entries of its parent context.

use serde::Serialize;
use std::borrow::Cow;

mod context;
mod error;
pub mod export;
mod id_generator;
mod provider;
mod span;
mod span_context;
mod span_processor;
mod tracer;

pub use context::{
    get_active_span, mark_span_as_active, SpanRef, TraceContextExt,
};
pub(crate) use context::SynchronizedSpan;
pub use error::{TraceError, TraceResult};
pub use export::{
    ExportResult, HttpJsonExporter, InMemorySpanExporter, SpanExporter, StdoutSpanExporter,
};
pub use id_generator::{IdGenerator, RandomIdGenerator};
pub use provider::{TracerProvider, TracerProviderBuilder};
pub use span::Span;
pub use span_context::{SpanContext, SpanId, TraceFlags, TraceId};
pub use span_processor::{
    BaggageSpanProcessor, BatchConfig, BatchConfigBuilder, BatchSpanProcessor,
    BatchSpanProcessorBuilder, SimpleSpanProcessor, SpanProcessor,
};
pub use tracer::{SpanBuilder, Tracer};

/// The status of a [`Span`].
///
/// These values form a total order: `Ok > Error > Unset`. A status update
/// only applies when the new value is greater than the current one, so a
/// span that reached `Ok` cannot be downgraded by a later error.
#[derive(Clone, Debug, Default, PartialEq, PartialOrd, Serialize)]
#[serde(tag = "code", rename_all = "lowercase")]
pub enum Status {
    /// The default status.
    #[default]
    Unset,

    /// The operation contains an error.
    Error {
        /// The description of the error
        #[serde(rename = "message")]
        description: Cow<'static, str>,
    },

    /// The operation has been validated by an application developer or
    /// operator to have completed successfully.
    Ok,
}

impl Status {
    /// Create a new error status with a given description.
    ///
    /// # Examples
    ///
    /// ```
    /// use carryon::trace::Status;
    ///
    /// // record an error with a message
    /// let status = Status::error("something went wrong");
    /// ```
    pub fn error(description: impl Into<Cow<'static, str>>) -> Self {
        Status::Error {
            description: description.into(),
        }
    }
}
