//! Error types for the shared document.

use crate::id::ItemId;
use thiserror::Error;

/// Errors that can occur while mutating or exchanging a shared document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("Unknown item: {0}")]
    UnknownItem(ItemId),

    #[error("Cannot insert into deleted parent {0}")]
    ParentDeleted(ItemId),

    #[error("Item {0} is not an element and cannot hold children")]
    NotAContainer(ItemId),

    #[error("Origin {origin} does not belong to the target parent")]
    ForeignOrigin { origin: ItemId },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Document has been destroyed")]
    Destroyed,
}

impl From<serde_json::Error> for DocError {
    fn from(err: serde_json::Error) -> Self {
        DocError::Encoding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DocError>;
