//! Inbound buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so consumed frames are trimmed from the front
//! without shifting the remainder.
//!
//! # Example
//!
//! ```
//! use lnlink::protocol::{build_frame, msg_type, InboundBuffer};
//!
//! let mut buffer = InboundBuffer::new();
//! let bytes = build_frame(msg_type::PONG, None, b"");
//!
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! assert!(buffer.is_empty());
//! ```

use bytes::{Buf, BytesMut};

use super::frame::{try_decode, Decoded, Frame};
use super::wire_format::MAX_MESSAGE_SIZE;
use crate::error::ProtocolError;

/// Default initial capacity (64 KiB, one maximum-size message).
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Bytes read from one session but not yet resolved into frames.
///
/// Never holds more than one frame's worth of undecoded data: the length
/// prefix is validated against `max_frame_size` before its payload is
/// waited for.
#[derive(Debug)]
pub struct InboundBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed length prefix (type + body).
    max_frame_size: usize,
}

impl InboundBuffer {
    /// Create a new buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_MESSAGE_SIZE)
    }

    /// Create a new buffer with a custom frame limit.
    ///
    /// Values above the Lightning message limit are clamped to it.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
            max_frame_size: max_frame_size.min(MAX_MESSAGE_SIZE),
        }
    }

    /// Append data and extract all complete frames.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if a frame is oversized or malformed. The
    /// stream cannot be resynchronized after that, so the buffer is cleared.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Extract a single frame, trimming its bytes.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match try_decode(&self.buffer, self.max_frame_size) {
            Ok(Decoded::Frame { frame, consumed }) => {
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            Ok(Decoded::Incomplete) => Ok(None),
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }

    /// Append data without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Configured frame limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for InboundBuffer {
    fn default() -> Self {
        Self::new()
    }
}
