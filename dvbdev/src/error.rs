//! Error types for device management.

use thiserror::Error;

/// Errors surfaced by device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device is not ready (mandatory resources missing or
    /// identification failed).
    #[error("device is not ready")]
    NotReady,

    /// The hardware collaborator rejected an operation.
    #[error("hardware error: {0}")]
    Hardware(#[from] std::io::Error),
}
