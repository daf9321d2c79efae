//! Error types for device operations

use thiserror::Error;

/// Result type alias for device operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a TUN device
#[derive(Debug, Error)]
pub enum Error {
    #[error("device error: {0}")]
    Device(String),

    #[error("frame of {len} bytes exceeds the device limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
