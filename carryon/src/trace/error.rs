use std::time::Duration;
use thiserror::Error;

/// Describe the result of operations in the tracing pipeline.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the tracing pipeline.
///
/// These stay inside the pipeline: telemetry failures are reported to the
/// caller of `force_flush`/`shutdown` or logged, never surfaced to the
/// request path.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// Export failed with the provided error
    #[error("Exporter encountered the following error(s): {0}")]
    ExportFailed(String),

    /// Export failed to finish after certain period and processor stopped the export.
    #[error("Exporter timed out after {} seconds", .0.as_secs())]
    ExportTimedOut(Duration),

    /// Operation attempted on a provider that was already shut down
    #[error("TracerProvider already shutdown")]
    TracerProviderAlreadyShutdown,

    /// Other errors propagated from the pipeline that weren't covered above.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<String> for TraceError {
    fn from(err_msg: String) -> Self {
        TraceError::Other(Box::new(Custom(err_msg)))
    }
}

impl From<&'static str> for TraceError {
    fn from(err_msg: &'static str) -> Self {
        TraceError::Other(Box::new(Custom(err_msg.into())))
    }
}

/// Wrap error into [`TraceError::Other`]
#[derive(Error, Debug)]
#[error("{0}")]
struct Custom(String);
