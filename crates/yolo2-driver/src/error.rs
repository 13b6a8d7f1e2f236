//! Error types for accelerator driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, AccelError>;

/// Errors that can occur while driving the accelerator
#[derive(Debug, Error)]
pub enum AccelError {
    /// Device node not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// Memory mapping a hardware window failed
    #[error("Failed to map {region}: {reason}")]
    MapFailed {
        /// Which window was being mapped
        region: String,
        /// Reason for failure
        reason: String,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Layer parameters exceed what the core was synthesized for
    #[error("Invalid layer parameters: {reason}")]
    InvalidParams {
        /// Which limit was violated
        reason: String,
    },

    /// START was written but the core never acknowledged it
    #[error("Core did not observe START (ap_ctrl = {status:#06x})")]
    StartNotObserved {
        /// ap_ctrl snapshot taken after the start window
        status: u32,
    },

    /// Layer did not complete within the configured timeout
    #[error("Layer timeout after {duration_ms}ms (ap_ctrl = {status:#06x})")]
    Timeout {
        /// How long the driver waited, in milliseconds
        duration_ms: u64,
        /// Last ap_ctrl snapshot before giving up
        status: u32,
    },

    /// DMA buffer allocation failed
    #[error("DMA allocation failed: {reason}")]
    Allocation {
        /// Reason for failure
        reason: String,
    },
}

impl AccelError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a map failed error
    pub fn map_failed(region: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MapFailed {
            region: region.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid parameters error
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    /// Create an allocation error
    pub fn allocation(reason: impl Into<String>) -> Self {
        Self::Allocation {
            reason: reason.into(),
        }
    }
}
