//! Error types for the connection engine.
//!
//! Framing and parsing errors are recovered locally by the read loop,
//! transport errors drive the reconnect state machine, and send errors
//! are handed back to the caller (usually a command handler).

use thiserror::Error;

/// Convenience type alias for Results using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A received line could not be decomposed into a message.
    #[error("malformed line: {0:?}")]
    MalformedLine(String),

    /// A received line exceeded the configured maximum length.
    #[error("line of {actual} bytes exceeds limit of {limit}")]
    FrameTooLong { actual: usize, limit: usize },

    /// A send was attempted while the connection is not `Ready`.
    #[error("not connected")]
    NotConnected,

    /// The outbound queue is at capacity.
    #[error("outbound queue full")]
    QueueFull,

    /// The server refused every nickname we offered.
    #[error("registration rejected: {reason}")]
    RegistrationRejected { reason: String },

    /// Any I/O failure on the underlying stream.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    /// Whether the read loop may drop the offending line and keep going.
    pub fn is_recoverable_frame_error(&self) -> bool {
        matches!(self, Error::MalformedLine(_) | Error::FrameTooLong { .. })
    }
}
