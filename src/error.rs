//! Error types for lnlink.
//!
//! Errors are split by the layer that produces them so callers can tell a
//! failed request apart from a failed session.

use thiserror::Error;

use crate::bech32::Bech32Error;
use crate::invoice::InvoiceError;
use crate::lnurl::LnurlError;
use crate::mux::MuxError;

/// Wire-level violations. Any of these terminates the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Length prefix declares more bytes than the configured maximum.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame could not be interpreted.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Reassembled commando reply grew past the configured maximum.
    #[error("reply for request {id} exceeds maximum {max} bytes")]
    ReplyTooLarge { id: u64, max: usize },
}

/// Outcome of a single request that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Deadline passed before the reply arrived.
    #[error("request timed out")]
    Timeout,

    /// Caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Session closed before the reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// Session is shutting down and accepts no new requests.
    #[error("session is draining")]
    Draining,

    /// Node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Reply was not a JSON-RPC envelope.
    #[error("could not decode reply: {0}")]
    Decode(String),

    /// Request could not be serialized.
    #[error("could not encode request: {0}")]
    Encode(String),
}

/// Failure to establish a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Connection string is not `<node_id>@<host>[:port]`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Host name did not resolve.
    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket-level failure while connecting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer misbehaved during the init exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Peer did not complete the init exchange in time.
    #[error("connect timed out")]
    Timeout,

    /// Peer closed the socket before the session became ready.
    #[error("connection closed during handshake")]
    Closed,
}

/// Terminal status of a client loop that stopped on an error.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Peer sent something we cannot parse.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Readiness wait failed.
    #[error("readiness error: {0}")]
    Mux(#[from] MuxError),

    /// Session never became ready.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Peer closed the socket.
    #[error("peer closed the connection")]
    PeerClosed,
}

/// Main error type for library helpers and the CLI.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not connect.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A request failed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// Session ended abnormally.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Bech32 string did not decode.
    #[error("bech32: {0}")]
    Bech32(#[from] Bech32Error),

    /// Payment string rejected.
    #[error("invoice: {0}")]
    Invoice(#[from] InvoiceError),

    /// LNURL service exchange failed.
    #[error("lnurl: {0}")]
    Lnurl(#[from] LnurlError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O failure outside a session.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input rejected before anything was sent.
    #[error("invalid input: {0}")]
    Invalid(String),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_messages() {
        let err = ProtocolError::FrameTooLarge { size: 70000, max: 65535 };
        assert!(err.to_string().contains("exceeds maximum"));

        let err = ProtocolError::ReplyTooLarge { id: 7, max: 10 };
        assert!(err.to_string().contains("request 7"));
    }

    #[test]
    fn test_rpc_error_message() {
        let err = CallError::Rpc {
            code: -32601,
            message: "Unknown command".to_string(),
        };
        assert_eq!(err.to_string(), "rpc error -32601: Unknown command");
    }

    #[test]
    fn test_error_conversions() {
        let err: Error = CallError::Timeout.into();
        assert!(matches!(err, Error::Call(CallError::Timeout)));

        let err: SessionError = ProtocolError::Malformed("short".into()).into();
        assert!(err.to_string().starts_with("protocol error"));
    }
}
