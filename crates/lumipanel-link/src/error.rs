//! Error types for the display link layer.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the display link.
#[derive(Error, Debug)]
pub enum Error {
    /// The link is not in the state the operation requires.
    /// Ordinary commands are only accepted while Running.
    #[error("link not ready for ordinary commands")]
    NotReady,

    /// No response from the display within the allowed time.
    #[error("timed out waiting for display response")]
    Timeout,

    /// A query of the same kind is already outstanding. The wire
    /// protocol has no correlation identifier, so overlapping queries
    /// cannot be told apart and are rejected instead of queued.
    #[error("another query of this kind is already outstanding")]
    Busy,

    /// Fewer bytes reached the wire than expected.
    #[error("transport failure: wrote {written} of {expected} bytes")]
    TransportFailure { expected: usize, written: usize },

    /// The payload source returned the wrong number of bytes.
    #[error("payload fetch returned {actual} bytes, expected {expected}")]
    ShortPayload { expected: usize, actual: usize },

    /// The payload source failed outright.
    #[error("payload source error: {0}")]
    Payload(String),

    /// Serial port communication error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Serial I/O error.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}
