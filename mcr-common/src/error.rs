//! # Codec Errors
//!
//! Error types produced while validating keys and decoding server frames.
//! None of these carry I/O state; transport failures live in the client.

use thiserror::Error;

/// Result alias for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A response frame could not be decoded.
///
/// Any of these means the byte stream is out of sync with the request that
/// produced it, so the connection that yielded it must not be reused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A header line did not have the expected token layout.
    #[error("malformed response line: {0:?}")]
    MalformedLine(String),

    /// A numeric field (length, flags, cas, counter) did not parse.
    #[error("invalid numeric field: {0:?}")]
    InvalidLength(String),

    /// A line or value block grew past the frame bound without terminating.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// The server answered with a token that is not valid for the request.
    #[error("unrecognized response token: {0:?}")]
    UnknownToken(String),

    /// A value block named a key that was not part of the request.
    #[error("value block for unrequested key {0:?}")]
    UnexpectedKey(String),

    /// A value payload was not followed by CRLF.
    #[error("value payload not terminated by CRLF")]
    MissingTerminator,
}

/// A byte string cannot be used as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("key is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    /// Whitespace and control bytes delimit protocol tokens.
    #[error("key contains reserved byte 0x{0:02x}")]
    ReservedByte(u8),
}
