use thiserror::Error;

/// Error taxonomy for a single orchestration run.
///
/// Degraded feature extraction is deliberately absent here: losing one of the
/// two analysis signals lowers match quality but never fails the request.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The same request id is already being processed. Recoverable by the
    /// caller waiting for the original submission's result.
    #[error("request '{0}' is already being processed")]
    DuplicateRequest(String),

    /// The text-generation upstream failed or produced a malformed stream.
    #[error("upstream generation failed: {0}")]
    UpstreamGeneration(String),

    /// A shared resource factory failed. The request cannot proceed, but the
    /// failure is never cached; the next request retries construction.
    #[error("failed to construct shared resource '{name}': {message}")]
    ResourceConstruction { name: String, message: String },

    /// The hard per-request deadline elapsed before generation finished.
    #[error("request processing exceeded the {0:?} deadline")]
    DeadlineExceeded(std::time::Duration),
}

impl ChatError {
    /// Stable machine-readable kind carried on terminal `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::DuplicateRequest(_) => "duplicate_request",
            ChatError::UpstreamGeneration(_) => "upstream_generation",
            ChatError::ResourceConstruction { .. } => "resource_construction",
            ChatError::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}
