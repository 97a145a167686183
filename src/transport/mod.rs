//! Transport module - the session socket as the client loop sees it.
//!
//! The loop only needs non-blocking read/write/close on something with a
//! file descriptor it can poll. Encryption, if any, lives inside the
//! [`Transport`] implementation; the loop never sees it.
//!
//! Provides:
//! - [`TcpTransport`] - non-blocking TCP with an in-progress connect
//! - [`StreamTransport`] - any already-connected non-blocking stream

mod stream;

use std::io;
use std::os::fd::AsFd;

pub use stream::{StreamTransport, TcpTransport};

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were read into the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// Peer closed the stream.
    Closed,
}

/// Outcome of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This many bytes were accepted.
    Written(usize),
    /// Socket buffer is full.
    WouldBlock,
}

/// An established (or establishing) session socket.
pub trait Transport: AsFd + Send + 'static {
    /// Drive connection setup. Returns `Ok(true)` once reads and writes
    /// may be issued.
    ///
    /// Called whenever the descriptor reports writable while connecting.
    fn poll_connect(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// Read available bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Write as much of `buf` as the socket accepts.
    fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome>;

    /// Release the session. Further reads report `Closed`.
    fn close(&mut self);
}
