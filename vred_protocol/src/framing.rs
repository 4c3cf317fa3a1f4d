// Splitting a byte stream into MessagePack messages.
//
// Two users with different needs:
// - The relay handles each TCP read on its own. `split_frames` cuts one read
//   buffer into the raw byte slices of the messages it holds, so writes that
//   the network coalesced are still routed one by one (and relayed
//   verbatim). Nothing is carried over to the next read.
// - A client reading a TCP stream sees replies and broadcasts coalesced or
//   split at arbitrary boundaries. `FrameBuffer` accumulates bytes across
//   reads and yields whole messages as they become available.
//
// MessagePack values are self-delimiting, so no length prefix is needed;
// `\n` bytes between values are skipped because line-framed
// clients append them (a message can never start with 0x0a, which would be a
// bare integer rather than an array).
//
// `MAX_FRAME_SIZE` (16 MB) bounds how much an incomplete message may buffer
// before the stream is considered garbage.

use std::io::ErrorKind;

use rmpv::Value;

use crate::error::DecodeError;
use crate::message::Message;

/// Largest incomplete frame a `FrameBuffer` will hold.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Decode one value from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only separators or a truncated value,
/// otherwise the value and the number of bytes it used (separators included).
pub fn read_frame(buf: &[u8]) -> Result<Option<(Value, usize)>, DecodeError> {
    let skip = buf.iter().take_while(|b| **b == b'\n').count();
    let mut rest = &buf[skip..];
    if rest.is_empty() {
        return Ok(None);
    }
    match rmpv::decode::read_value(&mut rest) {
        Ok(value) => Ok(Some((value, buf.len() - rest.len()))),
        Err(e) if is_truncated(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_truncated(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Iterator over the raw message slices in one read buffer.
///
/// Each slice is one complete array value plus any `\n` bytes right after
/// it. If the rest of the buffer does not start with a complete array
/// (garbage, a bare scalar, or a message cut off by the read), it is yielded
/// whole as the last slice so that decoding it reports one error.
pub fn split_frames(buf: &[u8]) -> SplitFrames<'_> {
    SplitFrames { rest: buf }
}

pub struct SplitFrames<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for SplitFrames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let skip = self.rest.iter().take_while(|b| **b == b'\n').count();
        self.rest = &self.rest[skip..];
        if self.rest.is_empty() {
            return None;
        }
        let end = match read_frame(self.rest) {
            // Every message is an array; anything else means the rest of the
            // buffer is not message-aligned.
            Ok(Some((Value::Array(_), used))) => {
                let newlines = self.rest[used..].iter().take_while(|b| **b == b'\n').count();
                used + newlines
            }
            _ => self.rest.len(),
        };
        let (frame, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(frame)
    }
}

/// Accumulates stream bytes and hands out complete messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that have not formed a whole message yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete message, if any.
    ///
    /// A message with a bad shape is consumed and reported as an error, so
    /// the caller can keep going. Malformed MessagePack or an oversized
    /// partial frame discards everything buffered, since the stream can no
    /// longer be resynchronized.
    pub fn next_message(&mut self) -> Result<Option<Message>, DecodeError> {
        match read_frame(&self.buf) {
            Ok(Some((value, used))) => {
                self.buf.drain(..used);
                Message::from_value(value).map(Some)
            }
            Ok(None) if self.buf.len() > MAX_FRAME_SIZE => {
                self.buf.clear();
                Err(DecodeError::FrameTooLarge(MAX_FRAME_SIZE))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }
}
