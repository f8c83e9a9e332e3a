//! Error taxonomy for the render subsystem

use std::path::PathBuf;

/// Failures of raw buffer access.
///
/// These are contract violations: hitting one means a buffer lifecycle bug
/// in the caller, not a transient condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("index {index} out of bounds for buffer of length {len}")]
    OutOfBounds { index: usize, len: usize },

    #[error("buffer accessed after release")]
    UseAfterFree,

    #[error("allocation of {len} bytes failed")]
    AllocationFailed { len: usize },

    #[error("buffer already holds {len} bytes")]
    AlreadyAllocated { len: usize },
}

/// Errors surfaced by documents, the engine client and the operation gate
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to initialize document: {detail}")]
    InitializationFailed { detail: String },

    #[error("render engine returned code {code}")]
    EngineError { code: i32 },

    #[error("page range {start}..={end} out of range for document of {size} pages")]
    PageOutOfRange {
        start: usize,
        end: usize,
        size: usize,
    },

    #[error("page range mismatch: expected {expected} pages, engine produced {actual}")]
    PageRangeMismatch { expected: usize, actual: usize },

    #[error("operation already in progress (requested by {caller})")]
    OperationInProgress { caller: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported file type: {}", .0.display())]
    UnsupportedFile(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn init_failed(detail: impl Into<String>) -> Self {
        Self::InitializationFailed {
            detail: detail.into(),
        }
    }

    /// Whether repeating the same call later may succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::OperationInProgress { .. } | Self::EngineError { .. })
    }
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;
