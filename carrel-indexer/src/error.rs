//! Error taxonomy for the ingestion pipeline.
//!
//! Variants fall into four groups, and the worker treats each group
//! differently:
//! - permanent stage failures fail the document immediately (no retry)
//! - transient stage failures re-enqueue the job with an incremented
//!   attempt, up to the configured maximum
//! - synchronous caller errors are returned from the facade methods and
//!   never touch a document's stored state
//! - internal errors mark invariant violations or infrastructure faults;
//!   they are logged and propagated but never written into a document's
//!   public `error_message`
//!
//! The `#[error]` display forms double as the human-readable strings stored
//! on `FAILED` documents, so they must stay free of debug formatting and
//! internal detail.

use thiserror::Error;

use crate::storage::{DocumentId, IndexStatus};

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No extractor is registered for the document's MIME type. Permanent.
    #[error("unsupported MIME type '{0}'")]
    UnsupportedMimeType(String),

    /// The extractor positively identified the file as unreadable. Permanent.
    #[error("file is corrupt or unreadable: {0}")]
    CorruptFile(String),

    /// The blob store could not serve the request. Transient.
    #[error("blob storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The chunk index could not serve the request. Transient.
    #[error("index backend unavailable: {0}")]
    IndexUnavailable(String),

    /// A pipeline stage exceeded its timeout. Transient.
    #[error("{stage} stage timed out after {seconds}s")]
    StageTimeout { stage: &'static str, seconds: u64 },

    /// Extraction failed without a definitive corrupt-file signal. Transient.
    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),

    /// The document does not exist.
    #[error("document {document_id} not found")]
    NotFound { document_id: DocumentId },

    /// Re-index requested while the document is not in a terminal state.
    #[error("document {document_id} is {current}; re-index requires INDEXED or FAILED")]
    InvalidState {
        document_id: DocumentId,
        current: IndexStatus,
    },

    /// The caller supplied unusable input (empty file, blank name, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invariant violation or infrastructure fault. Logged, never stored as
    /// a document's `error_message`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Failures that warrant a retry with an incremented attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::StorageUnavailable(_)
                | PipelineError::IndexUnavailable(_)
                | PipelineError::StageTimeout { .. }
                | PipelineError::ExtractionFailed(_)
        )
    }

    /// Failures that can never succeed on retry and fail the document
    /// immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedMimeType(_) | PipelineError::CorruptFile(_)
        )
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Internal(format!("database error: {e}"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Internal(format!("io error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_permanent_are_disjoint() {
        let errors = [
            PipelineError::UnsupportedMimeType("application/x-unknown".into()),
            PipelineError::CorruptFile("bad zip".into()),
            PipelineError::StorageUnavailable("io".into()),
            PipelineError::IndexUnavailable("locked".into()),
            PipelineError::StageTimeout {
                stage: "extract",
                seconds: 60,
            },
            PipelineError::ExtractionFailed("panic".into()),
            PipelineError::NotFound { document_id: 1 },
            PipelineError::InvalidInput("empty".into()),
            PipelineError::Internal("corrupt row".into()),
        ];
        for error in &errors {
            assert!(
                !(error.is_transient() && error.is_permanent()),
                "{error} classified as both transient and permanent"
            );
        }
    }

    #[test]
    fn display_forms_are_reader_friendly() {
        let err = PipelineError::UnsupportedMimeType("application/x-unknown".into());
        assert_eq!(err.to_string(), "unsupported MIME type 'application/x-unknown'");

        let err = PipelineError::StageTimeout {
            stage: "extract",
            seconds: 60,
        };
        assert_eq!(err.to_string(), "extract stage timed out after 60s");
    }
}
