//! Wire format encoding and decoding.
//!
//! Every Lightning message on the plaintext stream is prefixed by its length:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┬─────────┐
//! │ Length   │ Type     │ Request ID             │ Payload │
//! │ 2 bytes  │ 2 bytes  │ 8 bytes (commando only)│         │
//! │ uint16 BE│ uint16 BE│ uint64 BE              │         │
//! └──────────┴──────────┴────────────────────────┴─────────┘
//! ```
//!
//! `Length` counts the type and everything after it. All multi-byte integers
//! are Big Endian.

use crate::error::ProtocolError;

/// Size of the length prefix.
pub const LENGTH_SIZE: usize = 2;

/// Size of the message type field.
pub const TYPE_SIZE: usize = 2;

/// Length prefix plus message type.
pub const HEADER_SIZE: usize = LENGTH_SIZE + TYPE_SIZE;

/// Size of the commando request id.
pub const REQUEST_ID_SIZE: usize = 8;

/// Largest Lightning message (type + body).
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Largest body a single frame can carry (message minus type).
pub const MAX_BODY_SIZE: usize = MAX_MESSAGE_SIZE - TYPE_SIZE;

/// Largest commando chunk per frame (body minus request id).
pub const MAX_COMMANDO_CHUNK: usize = MAX_BODY_SIZE - REQUEST_ID_SIZE;

/// Lightning message types the client understands.
pub mod msg_type {
    /// BOLT #1 `init`.
    pub const INIT: u16 = 16;
    /// BOLT #1 `ping`.
    pub const PING: u16 = 18;
    /// BOLT #1 `pong`.
    pub const PONG: u16 = 19;

    /// Commando request chunk, more follow.
    pub const COMMANDO_CMD_CONTINUES: u16 = 0x4c4d;
    /// Final (or only) commando request chunk.
    pub const COMMANDO_CMD_TERM: u16 = 0x4c4f;
    /// Commando reply chunk, more follow.
    pub const COMMANDO_REPLY_CONTINUES: u16 = 0x594b;
    /// Final (or only) commando reply chunk.
    pub const COMMANDO_REPLY_TERM: u16 = 0x594d;

    /// Check if a type carries a commando request id.
    #[inline]
    pub fn is_commando(msg_type: u16) -> bool {
        matches!(
            msg_type,
            COMMANDO_CMD_CONTINUES | COMMANDO_CMD_TERM | COMMANDO_REPLY_CONTINUES | COMMANDO_REPLY_TERM
        )
    }

    /// Check if a type is part of a commando reply.
    #[inline]
    pub fn is_reply(msg_type: u16) -> bool {
        matches!(msg_type, COMMANDO_REPLY_CONTINUES | COMMANDO_REPLY_TERM)
    }

    /// Check if a type ends a commando request or reply.
    #[inline]
    pub fn is_terminal(msg_type: u16) -> bool {
        matches!(msg_type, COMMANDO_CMD_TERM | COMMANDO_REPLY_TERM)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Bytes following the length prefix (type + body).
    pub length: u16,
    /// Lightning message type.
    pub msg_type: u16,
}

impl Header {
    /// Create a header for a body of `body_len` bytes.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the message would exceed [`MAX_MESSAGE_SIZE`].
    pub fn for_body(msg_type: u16, body_len: usize) -> Self {
        debug_assert!(body_len <= MAX_BODY_SIZE);
        Self {
            length: (TYPE_SIZE + body_len) as u16,
            msg_type,
        }
    }

    /// Body length implied by the length prefix.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(TYPE_SIZE)
    }

    /// Total bytes this frame occupies on the wire.
    #[inline]
    pub fn frame_len(&self) -> usize {
        LENGTH_SIZE + self.length as usize
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use lnlink::protocol::{msg_type, Header};
    ///
    /// let header = Header::for_body(msg_type::PING, 4);
    /// assert_eq!(header.encode(), [0, 6, 0, 18]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (4 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.length.to_be_bytes());
        buf[2..4].copy_from_slice(&self.msg_type.to_be_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u16::from_be_bytes([buf[0], buf[1]]),
            msg_type: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Validate the header against the configured frame limit.
    ///
    /// `max_frame_size` bounds the length prefix, i.e. type + body.
    pub fn validate(&self, max_frame_size: usize) -> Result<(), ProtocolError> {
        let size = self.length as usize;

        if size > max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: max_frame_size,
            });
        }

        if size < TYPE_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "length {} cannot hold a message type",
                size
            )));
        }

        if msg_type::is_commando(self.msg_type) && self.body_len() < REQUEST_ID_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "commando message 0x{:04x} without request id",
                self.msg_type
            )));
        }

        Ok(())
    }

    /// Check if this is a commando message.
    #[inline]
    pub fn is_commando(&self) -> bool {
        msg_type::is_commando(self.msg_type)
    }
}

/// Peek the length prefix without decoding the rest.
#[inline]
pub fn peek_length(buf: &[u8]) -> Option<u16> {
    if buf.len() < LENGTH_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}
