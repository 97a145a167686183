//! Protocol module - wire format, framing, and commando bodies.
//!
//! This module implements the plaintext message stream:
//! - 4-byte header (length + type) encoding/decoding
//! - Inbound buffer for accumulating partial reads
//! - Frame struct with the commando request id split out
//! - Commando request/reply bodies plus `init`/`ping`/`pong`

mod commando;
mod frame;
mod frame_buffer;
mod wire_format;

pub use commando::{
    init_body, parse_reply, ping_body, pong_for, CommandoRequest, RequestBody,
    PONG_IGNORE_THRESHOLD,
};
pub use frame::{build_frame, try_decode, Decoded, Frame};
pub use frame_buffer::InboundBuffer;
pub use wire_format::{
    msg_type, peek_length, Header, HEADER_SIZE, LENGTH_SIZE, MAX_BODY_SIZE, MAX_COMMANDO_CHUNK,
    MAX_MESSAGE_SIZE, REQUEST_ID_SIZE, TYPE_SIZE,
};
