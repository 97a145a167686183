//! Stream-backed transports.
//!
//! # Example
//!
//! ```no_run
//! use lnlink::transport::TcpTransport;
//!
//! let addr = "127.0.0.1:9735".parse().unwrap();
//! let transport = TcpTransport::connect_timeout(addr, std::time::Duration::from_secs(10))?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use super::{ReadOutcome, Transport, WriteOutcome};
use crate::mux::{DescriptorSet, Interest, MuxError, Multiplexer, Token};

/// Map a raw read result onto [`ReadOutcome`].
fn read_nonblocking<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    loop {
        return match reader.read(buf) {
            Ok(0) if !buf.is_empty() => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(ReadOutcome::Closed),
            Err(e) => Err(e),
        };
    }
}

/// Map a raw write result onto [`WriteOutcome`].
fn write_nonblocking<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<WriteOutcome> {
    loop {
        return match writer.write(buf) {
            Ok(0) if !buf.is_empty() => Err(ErrorKind::WriteZero.into()),
            Ok(n) => Ok(WriteOutcome::Written(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
    }
}

/// Non-blocking TCP socket whose connect may still be in progress.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    connected: bool,
    closed: bool,
}

impl TcpTransport {
    /// Start a non-blocking connect to `addr`.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr)?,
            connected: false,
            closed: false,
        })
    }

    /// Connect to `addr` and wait up to `timeout` for the connect to finish.
    ///
    /// Refused or unreachable addresses fail here, so the caller can move on
    /// to another candidate.
    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let mut transport = Self::connect(addr)?;
        let deadline = Instant::now().checked_add(timeout);
        let (mut mux, _waker) = Multiplexer::new()?;

        loop {
            if transport.poll_connect()? {
                return Ok(transport);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(
                            ErrorKind::TimedOut,
                            format!("connect to {} timed out", addr),
                        ));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let mut set = DescriptorSet::new();
            set.watch(Token(0), transport.as_fd(), Interest::WRITABLE);
            match mux.wait(&set, remaining) {
                Ok(_) | Err(MuxError::Interrupted) => {}
                Err(MuxError::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::other(e.to_string())),
            }
        }
    }

    /// Wrap an already-connected std stream.
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: TcpStream::from_std(stream),
            connected: true,
            closed: false,
        })
    }

    /// Remote address, once connected.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl AsFd for TcpTransport {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl Transport for TcpTransport {
    fn poll_connect(&mut self) -> io::Result<bool> {
        if self.connected {
            return Ok(true);
        }

        // Writable after a non-blocking connect means either done or failed.
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }

        match self.stream.peer_addr() {
            Ok(addr) => {
                tracing::debug!("TCP connected to {}", addr);
                self.connected = true;
                self.stream.set_nodelay(true)?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected || e.kind() == ErrorKind::WouldBlock => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::Closed);
        }
        read_nonblocking(&mut self.stream, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        if self.closed {
            return Err(ErrorKind::NotConnected.into());
        }
        write_nonblocking(&mut self.stream, buf)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Any connected, non-blocking byte stream.
///
/// Used for Unix sockets and for transports that wrap the stream in their
/// own encryption layer.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    closed: bool,
}

impl<S> StreamTransport<S>
where
    S: Read + Write + AsFd + Send + 'static,
{
    /// Wrap a stream that is already in non-blocking mode.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl StreamTransport<UnixStream> {
    /// Wrap a connected Unix socket, switching it to non-blocking mode.
    pub fn unix(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: AsFd> AsFd for StreamTransport<S> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: Read + Write + AsFd + Send + 'static,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::Closed);
        }
        read_nonblocking(&mut self.stream, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        if self.closed {
            return Err(ErrorKind::NotConnected.into());
        }
        write_nonblocking(&mut self.stream, buf)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
