//! Frame struct, encoder, and incremental decoder.
//!
//! A frame is one length-prefixed Lightning message. Commando frames also
//! carry the request id that ties a reply back to its request.
//!
//! # Example
//!
//! ```
//! use lnlink::protocol::{build_frame, msg_type, try_decode, Decoded, MAX_MESSAGE_SIZE};
//!
//! let bytes = build_frame(msg_type::COMMANDO_REPLY_TERM, Some(42), b"{}");
//! match try_decode(&bytes, MAX_MESSAGE_SIZE).unwrap() {
//!     Decoded::Frame { frame, consumed } => {
//!         assert_eq!(frame.request_id, Some(42));
//!         assert_eq!(consumed, bytes.len());
//!     }
//!     Decoded::Incomplete => unreachable!(),
//! }
//! ```

use bytes::Bytes;

use super::wire_format::{msg_type, peek_length, Header, HEADER_SIZE, REQUEST_ID_SIZE, TYPE_SIZE};
use crate::error::ProtocolError;

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Lightning message type.
    pub msg_type: u16,
    /// Commando request id; `None` for every other message type.
    pub request_id: Option<u64>,
    /// Body after the type (and request id, if any).
    pub payload: Bytes,
}

/// Result of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied.
    Frame { frame: Frame, consumed: usize },
    /// More bytes are needed; nothing was consumed.
    Incomplete,
}

impl Frame {
    /// Create a new frame.
    pub fn new(msg_type: u16, request_id: Option<u64>, payload: Bytes) -> Self {
        Self {
            msg_type,
            request_id,
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check if this is a commando reply chunk.
    #[inline]
    pub fn is_reply(&self) -> bool {
        msg_type::is_reply(self.msg_type)
    }

    /// Check if this chunk ends a commando exchange.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        msg_type::is_terminal(self.msg_type)
    }

    /// Body length as carried on the wire.
    fn body_len(&self) -> usize {
        self.payload.len() + self.request_id.map_or(0, |_| REQUEST_ID_SIZE)
    }

    /// Encode this frame.
    ///
    /// Commando types always carry a request id; a missing one is written
    /// as zero so the output stays decodable.
    pub fn encode(&self) -> Vec<u8> {
        let request_id = match (self.request_id, msg_type::is_commando(self.msg_type)) {
            (Some(id), _) => Some(id),
            (None, true) => Some(0),
            (None, false) => None,
        };
        build_frame(self.msg_type, request_id, &self.payload)
    }

    /// Total bytes on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use lnlink::protocol::{build_frame, msg_type, HEADER_SIZE};
///
/// let bytes = build_frame(msg_type::PONG, None, &[0, 0]);
/// assert_eq!(bytes.len(), HEADER_SIZE + 2);
/// ```
pub fn build_frame(msg_type: u16, request_id: Option<u64>, payload: &[u8]) -> Vec<u8> {
    let body_len = payload.len() + request_id.map_or(0, |_| REQUEST_ID_SIZE);
    let header = Header::for_body(msg_type, body_len);

    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&header.encode());
    if let Some(id) = request_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Try to decode one frame from the front of `buf`.
///
/// Never consumes a partial frame: on `Incomplete` the caller keeps every
/// byte. The length prefix is checked against `max_frame_size` as soon as
/// its two bytes are present, so an oversized declaration fails before any
/// of its payload is buffered.
pub fn try_decode(buf: &[u8], max_frame_size: usize) -> Result<Decoded, ProtocolError> {
    let Some(length) = peek_length(buf) else {
        return Ok(Decoded::Incomplete);
    };

    if length as usize > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: length as usize,
            max: max_frame_size,
        });
    }

    if (length as usize) < TYPE_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "length {} cannot hold a message type",
            length
        )));
    }

    let Some(header) = Header::decode(buf) else {
        return Ok(Decoded::Incomplete);
    };
    header.validate(max_frame_size)?;

    let frame_len = header.frame_len();
    if buf.len() < frame_len {
        return Ok(Decoded::Incomplete);
    }

    let mut body = &buf[HEADER_SIZE..frame_len];
    let request_id = if header.is_commando() {
        let mut id = [0u8; REQUEST_ID_SIZE];
        id.copy_from_slice(&body[..REQUEST_ID_SIZE]);
        body = &body[REQUEST_ID_SIZE..];
        Some(u64::from_be_bytes(id))
    } else {
        None
    };

    Ok(Decoded::Frame {
        frame: Frame::new(header.msg_type, request_id, Bytes::copy_from_slice(body)),
        consumed: frame_len,
    })
}
