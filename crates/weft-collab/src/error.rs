//! Error types for the collaboration core.

use thiserror::Error;
use weft_doc::DocError;

/// Errors surfaced by the collaboration core.
///
/// Steady-state misses are not errors: anchors that no longer resolve come
/// back as `None`, updates and removals of unknown annotation ids are
/// silent no-ops, and undo/redo report `false` when there is nothing to do.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollabError {
    /// Configuration fault: the extension cannot work without a provider.
    #[error("A realtime provider must be supplied to the collaboration extension")]
    MissingProvider,

    #[error("Offset {offset} is outside the document (size {size})")]
    OffsetOutOfRange { offset: usize, size: usize },

    #[error("Invalid step: {0}")]
    InvalidStep(String),

    /// Positions were translated before the sync binding produced a mapping.
    #[error("No live mapping: the sync binding has not been installed")]
    NoMapping,

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Doc(#[from] DocError),
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Encoding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
