use thiserror::Error;

use crate::models::{Source, Stage};

pub type Result<T> = std::result::Result<T, PipelineError>;

// `PipelineError::MalformedPayload` names its field `source`, which thiserror
// always treats as the error's `#[source]` and therefore requires to implement
// `std::error::Error`. `Source` is a domain enum (already `Debug + Display`),
// so this no-op impl satisfies that bound without changing the field or the
// error message.
impl std::error::Error for Source {}

/// Errors the pipeline core can return. Every variant is scoped to one
/// posting or one run; nothing here is fatal to the process.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required field could not be extracted from a source payload.
    /// The posting is discarded and never retried automatically.
    #[error("malformed {source} payload: {reason}")]
    MalformedPayload { source: Source, reason: String },

    /// The requested stage edge is not in the allowed set.
    #[error("illegal stage transition: {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },

    /// A transition lost the compare-and-set race twice. The caller should
    /// re-fetch the current stage and decide whether to retry.
    #[error("posting {id} was modified concurrently; re-fetch and retry")]
    ConcurrentModification { id: i64 },

    #[error("posting {id} not found")]
    PostingNotFound { id: i64 },

    /// A run is already streaming for this posting; stop or regenerate instead.
    #[error("a generation run is already streaming for posting {id}")]
    AlreadyStreaming { id: i64 },

    /// The generation capability errored. The partial transcript is retained
    /// on the run; the caller may regenerate.
    #[error("generation run {run_id} failed: {reason}")]
    GenerationFailed { run_id: i64, reason: String },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}
