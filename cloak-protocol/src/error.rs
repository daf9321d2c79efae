//! Error types for the cloakwire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or decoding tunnel frames
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("not a TCP segment (protocol {0})")]
    NotTcp(u8),

    #[error("inconsistent header lengths (ihl {ihl}, doff {doff}, frame {frame})")]
    HeaderLength { ihl: usize, doff: usize, frame: usize },

    #[error("output buffer too small: frame needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
