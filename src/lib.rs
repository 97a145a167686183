//! # lnlink
//!
//! Commando RPC client for Lightning nodes.
//!
//! A [`Session`] keeps one connection to a node open and multiplexes
//! JSON-RPC requests over it. Replies are matched to requests by the
//! commando request id, so several calls may be outstanding at once and
//! may complete in any order.
//!
//! ## Architecture
//!
//! - **Client loop** (one thread per session): readiness wait, framing,
//!   request correlation
//! - **Session** (any thread): submits requests and waits on their outcome
//!
//! ## Example
//!
//! ```no_run
//! use lnlink::ClientBuilder;
//!
//! let session = ClientBuilder::new()
//!     .rune(std::env::var("LNLINK_RUNE")?)
//!     .connect("03f3c108ccd536b8526841f0a5c58212bb9e6584a1eb493080e7c1cc34f82dad71@127.0.0.1")?;
//!
//! let info = session.getinfo()?;
//! println!("{} on {}", info.alias, info.network);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod address;
pub mod bech32;
pub mod correlator;
pub mod error;
pub mod invoice;
pub mod lnurl;
pub mod mux;
pub mod protocol;
pub mod rpc;
pub mod transport;

mod client;

pub use address::NodeAddress;
pub use client::{
    ClientBuilder, ClientConfig, ClientLoop, LoopState, PendingCall, Session,
    DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_REPLY_SIZE,
    DEFAULT_READ_CHUNK_SIZE,
};
pub use error::{CallError, ConnectError, Error, ProtocolError, Result, SessionError};
