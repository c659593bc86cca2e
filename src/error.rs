use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the retrieval pipeline and its collaborators.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("identifier {id} out of range for metadata store of length {len}")]
    IdentifierOutOfRange { id: usize, len: usize },

    #[error("no snapshot found at '{}'", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("completion service unavailable: {0}")]
    CompletionUnavailable(String),

    #[error("snapshot storage error: {0}")]
    Storage(#[from] std::io::Error),
}

pub type RagResult<T> = Result<T, RagError>;

/// Pipeline stage an [`AnswerError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Request,
    Retrieval,
    Completion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Request => "request validation",
            Stage::Retrieval => "context retrieval",
            Stage::Completion => "completion",
        };
        f.write_str(name)
    }
}

/// Coarse failure classes a UI renders differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NoDataIndexed,
    CompletionFailed,
    MalformedQuery,
    Internal,
}

#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct AnswerError {
    pub stage: Stage,
    #[source]
    pub source: RagError,
}

impl AnswerError {
    pub fn new(stage: Stage, source: RagError) -> Self {
        Self { stage, source }
    }

    pub fn kind(&self) -> FailureKind {
        match &self.source {
            RagError::SnapshotNotFound(_) => FailureKind::NoDataIndexed,
            RagError::CompletionUnavailable(_) => FailureKind::CompletionFailed,
            RagError::InvalidArgument(_) => FailureKind::MalformedQuery,
            _ => FailureKind::Internal,
        }
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self.kind() {
            FailureKind::NoDataIndexed => {
                "No FOMC data has been indexed yet. Store some documents first.".to_string()
            }
            FailureKind::CompletionFailed => format!(
                "The completion service failed. Check your API key or try again later. ({})",
                self.source
            ),
            FailureKind::MalformedQuery => format!("Your question could not be processed: {}", self.source),
            FailureKind::Internal => format!("An error occurred: {self}"),
        }
    }
}
