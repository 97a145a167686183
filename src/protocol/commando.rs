//! Commando message bodies and the BOLT #1 control messages around them.
//!
//! A commando request is a JSON object split across one or more
//! `commando_cmd_*` frames. The node answers with `commando_reply_*` chunks
//! whose concatenation is a JSON-RPC response.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::build_frame;
use super::wire_format::{msg_type, MAX_COMMANDO_CHUNK};
use crate::error::CallError;

/// Pings asking for this many pong bytes or more must not be answered.
pub const PONG_IGNORE_THRESHOLD: u16 = 65532;

/// JSON body of a commando request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    /// JSON-RPC id echoed by the node.
    pub id: String,
    /// RPC method name.
    pub method: String,
    /// Positional array or named object.
    pub params: Value,
    /// Authorization rune.
    pub rune: String,
}

/// A commando request bound to its wire request id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandoRequest {
    /// Request id carried in every frame of this request.
    pub id: u64,
    /// Decoded JSON body.
    pub body: RequestBody,
}

impl CommandoRequest {
    /// Build a request for `method`.
    pub fn new(id: u64, method: &str, params: Value, rune: &str) -> Self {
        Self {
            id,
            body: RequestBody {
                id: format!("lnlink:{}#{}", method, id),
                method: method.to_string(),
                params,
                rune: rune.to_string(),
            },
        }
    }

    /// Serialize into one or more frames, ready to write.
    ///
    /// Bodies larger than one frame are split into `commando_cmd_continues`
    /// chunks followed by a final `commando_cmd_term`.
    pub fn encode(&self) -> Result<Bytes, CallError> {
        let json = serde_json::to_vec(&self.body).map_err(|e| CallError::Encode(e.to_string()))?;

        let mut out = BytesMut::with_capacity(json.len() + 16);
        let mut chunks = json.chunks(MAX_COMMANDO_CHUNK).peekable();
        while let Some(chunk) = chunks.next() {
            let kind = if chunks.peek().is_some() {
                msg_type::COMMANDO_CMD_CONTINUES
            } else {
                msg_type::COMMANDO_CMD_TERM
            };
            out.extend_from_slice(&build_frame(kind, Some(self.id), chunk));
        }

        Ok(out.freeze())
    }

    /// Parse a reassembled request body.
    pub fn from_json(id: u64, json: &[u8]) -> Result<Self, CallError> {
        let body = serde_json::from_slice(json).map_err(|e| CallError::Decode(e.to_string()))?;
        Ok(Self { id, body })
    }
}

/// JSON-RPC error object returned by the node.
#[derive(Debug, Clone, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Interpret a reassembled reply.
///
/// Returns the `result` member on success, [`CallError::Rpc`] when the node
/// answered with an `error` member, and [`CallError::Decode`] otherwise.
pub fn parse_reply(body: &[u8]) -> Result<Value, CallError> {
    let mut envelope: Value =
        serde_json::from_slice(body).map_err(|e| CallError::Decode(e.to_string()))?;

    if let Some(error) = envelope.get("error") {
        let error: RpcErrorBody = serde_json::from_value(error.clone())
            .map_err(|e| CallError::Decode(format!("bad error object: {}", e)))?;
        return Err(CallError::Rpc {
            code: error.code,
            message: error.message,
        });
    }

    match envelope.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(CallError::Decode("reply has neither result nor error".into())),
    }
}

/// Body of our `init`: empty global and local feature vectors, no TLVs.
pub fn init_body() -> [u8; 4] {
    [0, 0, 0, 0]
}

/// Body of a `ping` asking for `num_pong_bytes` with `padding` ignored bytes.
pub fn ping_body(num_pong_bytes: u16, padding: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + padding as usize);
    body.extend_from_slice(&num_pong_bytes.to_be_bytes());
    body.extend_from_slice(&padding.to_be_bytes());
    body.resize(4 + padding as usize, 0);
    body
}

/// Body of the `pong` answering `ping`, or `None` if no answer is due.
pub fn pong_for(ping: &[u8]) -> Option<Vec<u8>> {
    if ping.len() < 2 {
        return None;
    }
    let num_pong_bytes = u16::from_be_bytes([ping[0], ping[1]]);
    if num_pong_bytes >= PONG_IGNORE_THRESHOLD {
        return None;
    }

    let mut body = Vec::with_capacity(2 + num_pong_bytes as usize);
    body.extend_from_slice(&num_pong_bytes.to_be_bytes());
    body.resize(2 + num_pong_bytes as usize, 0);
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decoded, try_decode, MAX_MESSAGE_SIZE};
    use serde_json::json;

    fn decode_all(mut bytes: &[u8]) -> Vec<crate::protocol::Frame> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            match try_decode(bytes, MAX_MESSAGE_SIZE).unwrap() {
                Decoded::Frame { frame, consumed } => {
                    frames.push(frame);
                    bytes = &bytes[consumed..];
                }
                Decoded::Incomplete => panic!("trailing partial frame"),
            }
        }
        frames
    }

    #[test]
    fn test_request_roundtrip() {
        let request = CommandoRequest::new(5, "getinfo", json!([]), "rune123");
        let bytes = request.encode().unwrap();

        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, msg_type::COMMANDO_CMD_TERM);
        assert_eq!(frames[0].request_id, Some(5));

        let decoded = CommandoRequest::from_json(5, frames[0].payload()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.body.id, "lnlink:getinfo#5");
    }

    #[test]
    fn test_large_request_is_chunked() {
        let big = "x".repeat(MAX_COMMANDO_CHUNK + 100);
        let request = CommandoRequest::new(9, "pay", json!([big]), "r");
        let bytes = request.encode().unwrap();

        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_type, msg_type::COMMANDO_CMD_CONTINUES);
        assert_eq!(frames[1].msg_type, msg_type::COMMANDO_CMD_TERM);
        assert!(frames.iter().all(|f| f.request_id == Some(9)));

        let mut json = Vec::new();
        for frame in &frames {
            json.extend_from_slice(frame.payload());
        }
        assert_eq!(CommandoRequest::from_json(9, &json).unwrap(), request);
    }

    #[test]
    fn test_parse_reply_result() {
        let value = parse_reply(br#"{"jsonrpc":"2.0","id":"x","result":{"alias":"node"}}"#).unwrap();
        assert_eq!(value, json!({"alias": "node"}));
    }

    #[test]
    fn test_parse_reply_error() {
        let err = parse_reply(br#"{"error":{"code":-32601,"message":"Unknown command 'nope'"}}"#)
            .unwrap_err();
        assert_eq!(
            err,
            CallError::Rpc {
                code: -32601,
                message: "Unknown command 'nope'".to_string()
            }
        );
    }

    #[test]
    fn test_parse_reply_garbage() {
        assert!(matches!(parse_reply(b"not json"), Err(CallError::Decode(_))));
        assert!(matches!(parse_reply(b"{\"id\":1}"), Err(CallError::Decode(_))));
    }

    #[test]
    fn test_pong_for_ping() {
        let pong = pong_for(&ping_body(3, 10)).unwrap();
        assert_eq!(pong, vec![0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_pong_suppressed_above_threshold() {
        assert!(pong_for(&ping_body(PONG_IGNORE_THRESHOLD, 0)).is_none());
        assert!(pong_for(&[0]).is_none());
    }
}
