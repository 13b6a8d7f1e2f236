//! Error types for model and inference operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur while building or running a network
#[derive(Debug, Error)]
pub enum ModelError {
    /// Blob or table file not found
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Network description is inconsistent
    #[error("Invalid network: {reason}")]
    InvalidNetwork {
        /// Reason for failure
        reason: String,
    },

    /// A quantization table is missing entries or malformed
    #[error("Invalid Q table: {reason}")]
    QTableInvalid {
        /// Reason for failure
        reason: String,
    },

    /// A blob file does not match the network it claims to serve
    #[error("Blob size mismatch for {what}: expected {expected} words, got {actual}")]
    BlobSizeMismatch {
        /// Which blob
        what: String,
        /// Words the network requires
        expected: usize,
        /// Words the file holds
        actual: usize,
    },

    /// Feature maps cannot be placed in the arena
    #[error("Layout failed: {reason}")]
    LayoutFailed {
        /// Reason for failure
        reason: String,
    },

    /// Input does not match the network entry shape
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Reason for failure
        reason: String,
    },

    /// Driver-level failure while running a layer
    #[error("Accelerator error: {source}")]
    Accel {
        /// Underlying driver error
        #[from]
        source: yolo2_driver::AccelError,
    },
}

impl ModelError {
    /// Create an invalid network error
    pub fn invalid_network(reason: impl Into<String>) -> Self {
        Self::InvalidNetwork {
            reason: reason.into(),
        }
    }

    /// Create a Q table error
    pub fn q_table(reason: impl Into<String>) -> Self {
        Self::QTableInvalid {
            reason: reason.into(),
        }
    }

    /// Create a layout error
    pub fn layout(reason: impl Into<String>) -> Self {
        Self::LayoutFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}
