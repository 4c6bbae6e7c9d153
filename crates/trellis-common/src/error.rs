//! Error types for the trellis term index.

use thiserror::Error;

/// Result type alias using TrellisError.
pub type Result<T> = std::result::Result<T, TrellisError>;

/// Errors that can occur in trellis operations.
#[derive(Debug, Error)]
pub enum TrellisError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Misuse errors
    #[error("Write requested on a read-only tree")]
    ReadOnly,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Format errors
    #[error("Node corrupted: {node_id}, reason: {reason}")]
    Corrupted { node_id: u64, reason: String },

    #[error("Invalid tree metadata: expected {expected} bytes, got {actual}")]
    InvalidMetadata { expected: usize, actual: usize },

    #[error("Block locator corrupted: {0}")]
    LocatorCorrupted(String),

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    #[error("Node store corrupted: {0}")]
    StoreCorrupted(String),

    // Capacity errors
    #[error("Leaf value offset {offset} exceeds the addressable range (max {max})")]
    CapacityExceeded { offset: usize, max: usize },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TrellisError {
    /// Builds a corruption error for the given node.
    pub fn corrupted(node_id: u64, reason: impl Into<String>) -> Self {
        TrellisError::Corrupted {
            node_id,
            reason: reason.into(),
        }
    }
}
