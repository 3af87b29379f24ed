//! Protocol-level errors shared by the encoder and decoder.

use thiserror::Error;

/// Result type for codec operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors produced while framing commands or parsing responses.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Underlying stream failed while reading a response.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream mid-response.
    #[error("unexpected end of stream")]
    Eof,

    /// The response did not match the text-protocol grammar.
    #[error("malformed response: {0}")]
    Malformed(&'static str),

    /// A value frame announced more bytes than the configured maximum.
    #[error("value frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The key is not sendable over the text protocol.
    #[error("invalid key: {0}")]
    BadKey(&'static str),
}
