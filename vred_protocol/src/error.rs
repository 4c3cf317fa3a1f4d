// Decode errors for the wire codec.
//
// A `DecodeError` is always scoped to one message: the relay logs it and
// drops that message, and the connection or datagram peer that sent it is
// left alone.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not valid MessagePack.
    #[error("malformed msgpack: {0}")]
    Malformed(#[from] rmpv::decode::Error),

    /// A complete value was decoded but unexpected bytes follow it.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The top-level value is not an array.
    #[error("message is not an array")]
    NotAnArray,

    /// The top-level array has no elements.
    #[error("message is empty")]
    Empty,

    /// The first element of the array is not a string.
    #[error("message tag is not a string")]
    TagNotString,

    /// The tag is not one this side of the protocol handles.
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),

    /// A stream buffer grew past `MAX_FRAME_SIZE` without holding a whole
    /// message.
    #[error("incomplete frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    /// The tag is known but the fields after it have the wrong shape.
    #[error("invalid {tag:?} message: {reason}")]
    InvalidField { tag: &'static str, reason: String },
}

impl DecodeError {
    pub(crate) fn invalid(tag: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidField {
            tag,
            reason: reason.into(),
        }
    }
}
