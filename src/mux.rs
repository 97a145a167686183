//! Readiness multiplexer.
//!
//! Wraps `poll(2)` through `rustix`. The caller builds a [`DescriptorSet`]
//! each iteration from the descriptors it currently cares about and passes
//! it to [`Multiplexer::wait`]; nothing about the watch set is kept between
//! calls.
//!
//! The multiplexer also owns the read end of a self-pipe. The matching
//! [`Waker`] lets another thread interrupt a blocked wait, which is how
//! request submission reaches the loop thread.
//!
//! # Example
//!
//! ```no_run
//! use std::os::fd::AsFd;
//! use std::time::Duration;
//! use lnlink::mux::{DescriptorSet, Interest, Multiplexer, Token};
//!
//! let (mut mux, _waker) = Multiplexer::new()?;
//! let (a, _b) = std::os::unix::net::UnixStream::pair()?;
//!
//! let mut set = DescriptorSet::new();
//! set.watch(Token(1), a.as_fd(), Interest::READABLE);
//! let events = mux.wait(&set, Some(Duration::from_millis(10)))?;
//! assert!(events.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::{Errno, FdFlags};
use thiserror::Error;

/// Identifies a descriptor in a [`DescriptorSet`] and in the events it yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Which readiness a descriptor is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    /// Watch for readable only.
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    /// Watch for writable only.
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    /// Watch for both.
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    /// Combine two interests.
    pub fn union(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }

    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.readable {
            flags |= PollFlags::IN;
        }
        if self.writable {
            flags |= PollFlags::OUT;
        }
        flags
    }
}

/// Descriptors to watch during one wait.
///
/// A token appears at most once; watching it again replaces its interest.
#[derive(Debug, Default)]
pub struct DescriptorSet<'fd> {
    entries: Vec<(Token, BorrowedFd<'fd>, Interest)>,
}

impl<'fd> DescriptorSet<'fd> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Watch `fd` under `token`.
    pub fn watch(&mut self, token: Token, fd: BorrowedFd<'fd>, interest: Interest) -> &mut Self {
        match self.entries.iter_mut().find(|(t, _, _)| *t == token) {
            Some(entry) => *entry = (token, fd, interest),
            None => self.entries.push((token, fd, interest)),
        }
        self
    }

    /// Interest currently registered for `token`.
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.entries
            .iter()
            .find(|(t, _, _)| *t == token)
            .map(|(_, _, interest)| *interest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Readiness reported for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    /// Readable, or hung up / errored (a read will report why).
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the descriptor has a pending error.
    pub hangup: bool,
}

/// Result of one wait.
#[derive(Debug, Default)]
pub struct Events {
    ready: Vec<Ready>,
    woken: bool,
}

impl Events {
    /// Descriptors that became actionable.
    pub fn iter(&self) -> impl Iterator<Item = &Ready> {
        self.ready.iter()
    }

    /// Readiness for one token, if it fired.
    pub fn get(&self, token: Token) -> Option<Ready> {
        self.ready.iter().find(|r| r.token == token).copied()
    }

    /// Whether a [`Waker`] fired during this wait.
    pub fn woken(&self) -> bool {
        self.woken
    }

    /// Nothing fired: the wait timed out.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && !self.woken
    }
}

/// Failure of a readiness wait.
#[derive(Debug, Error)]
pub enum MuxError {
    /// A signal interrupted the wait; retry.
    #[error("wait interrupted by signal")]
    Interrupted,

    /// A watched descriptor is not open. The owning session is gone.
    #[error("descriptor for {0:?} is invalid")]
    InvalidDescriptor(Token),

    /// Any other `poll(2)` failure.
    #[error("poll failed: {0}")]
    Io(#[from] io::Error),
}

/// Blocks until at least one watched descriptor is actionable.
#[derive(Debug)]
pub struct Multiplexer {
    wake_rx: OwnedFd,
}

/// Wakes a [`Multiplexer`] blocked in [`Multiplexer::wait`] from any thread.
#[derive(Debug)]
pub struct Waker {
    wake_tx: OwnedFd,
}

impl Multiplexer {
    /// Create a multiplexer and its waker.
    pub fn new() -> io::Result<(Self, Waker)> {
        let (wake_rx, wake_tx) = rustix::pipe::pipe()?;
        for fd in [&wake_rx, &wake_tx] {
            rustix::io::ioctl_fionbio(fd, true)?;
            rustix::io::fcntl_setfd(fd, FdFlags::CLOEXEC)?;
        }
        Ok((Self { wake_rx }, Waker { wake_tx }))
    }

    /// Wait until a descriptor in `set` is ready, the waker fires, or
    /// `timeout` elapses (`None` waits forever).
    ///
    /// An empty [`Events`] means the timeout elapsed.
    pub fn wait(
        &mut self,
        set: &DescriptorSet<'_>,
        timeout: Option<Duration>,
    ) -> Result<Events, MuxError> {
        let mut fds: Vec<PollFd<'_>> = set
            .entries
            .iter()
            .map(|(_, fd, interest)| PollFd::from_borrowed_fd(*fd, interest.poll_flags()))
            .collect();
        fds.push(PollFd::from_borrowed_fd(self.wake_rx.as_fd(), PollFlags::IN));

        match poll(&mut fds, timeout_ms(timeout)) {
            Ok(_) => {}
            Err(Errno::INTR) => return Err(MuxError::Interrupted),
            Err(e) => return Err(MuxError::Io(e.into())),
        }

        let mut events = Events::default();
        let wake_index = set.entries.len();

        for ((token, _, _), pfd) in set.entries.iter().zip(&fds) {
            let revents = pfd.revents();
            if revents.contains(PollFlags::NVAL) {
                return Err(MuxError::InvalidDescriptor(*token));
            }
            if revents.is_empty() {
                continue;
            }
            let hangup = revents.intersects(PollFlags::HUP | PollFlags::ERR);
            events.ready.push(Ready {
                token: *token,
                readable: revents.contains(PollFlags::IN) || hangup,
                writable: revents.contains(PollFlags::OUT),
                hangup,
            });
        }

        events.woken = fds[wake_index].revents().contains(PollFlags::IN);
        drop(fds);

        if events.woken {
            self.drain_wakeups()?;
        }
        Ok(events)
    }

    fn drain_wakeups(&self) -> io::Result<()> {
        let mut scratch = [0u8; 64];
        loop {
            match rustix::io::read(&self.wake_rx, &mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(Errno::AGAIN) => return Ok(()),
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Waker {
    /// Interrupt the paired multiplexer's current or next wait.
    pub fn wake(&self) -> io::Result<()> {
        match rustix::io::write(&self.wake_tx, &[1]) {
            // A full pipe already guarantees a pending wakeup.
            Ok(_) | Err(Errno::AGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Milliseconds for `poll(2)`, rounding up so a short remaining deadline
/// does not become a zero-timeout spin.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn test_timeout_returns_empty() {
        let (mut mux, _waker) = Multiplexer::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();

        let mut set = DescriptorSet::new();
        set.watch(Token(1), a.as_fd(), Interest::READABLE);

        let start = Instant::now();
        let events = mux.wait(&set, Some(Duration::from_millis(20))).unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_readable_reported() {
        let (mut mux, _waker) = Multiplexer::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"ping").unwrap();

        let mut set = DescriptorSet::new();
        set.watch(Token(7), a.as_fd(), Interest::READABLE);

        let events = mux.wait(&set, Some(Duration::from_secs(1))).unwrap();
        let ready = events.get(Token(7)).unwrap();
        assert!(ready.readable);
        assert!(!ready.writable);
        assert!(!events.woken());
    }

    #[test]
    fn test_writable_only_when_asked() {
        let (mut mux, _waker) = Multiplexer::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();

        let mut set = DescriptorSet::new();
        set.watch(Token(1), a.as_fd(), Interest::READABLE);
        let events = mux.wait(&set, Some(Duration::from_millis(5))).unwrap();
        assert!(events.get(Token(1)).is_none());

        set.watch(Token(1), a.as_fd(), Interest::BOTH);
        let events = mux.wait(&set, Some(Duration::from_secs(1))).unwrap();
        assert!(events.get(Token(1)).unwrap().writable);
    }

    #[test]
    fn test_hangup_reads_as_readable() {
        let (mut mux, _waker) = Multiplexer::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);

        let mut set = DescriptorSet::new();
        set.watch(Token(2), a.as_fd(), Interest::READABLE);
        let ready = mux
            .wait(&set, Some(Duration::from_secs(1)))
            .unwrap()
            .get(Token(2))
            .unwrap();
        assert!(ready.readable);
    }

    #[test]
    fn test_waker_interrupts_wait_from_other_thread() {
        let (mut mux, waker) = Multiplexer::new().unwrap();
        let set = DescriptorSet::new();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
            waker
        });

        let events = mux.wait(&set, Some(Duration::from_secs(5))).unwrap();
        assert!(events.woken());
        let waker = handle.join().unwrap();

        // Wakeups are drained; the next wait times out.
        let events = mux.wait(&set, Some(Duration::from_millis(5))).unwrap();
        assert!(events.is_empty());

        // Repeated wakes before a wait collapse into one.
        for _ in 0..100 {
            waker.wake().unwrap();
        }
        assert!(mux.wait(&set, Some(Duration::ZERO)).unwrap().woken());
        assert!(mux.wait(&set, Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_descriptor_reported() {
        let (mut mux, _waker) = Multiplexer::new().unwrap();

        // Far above any descriptor the test process opens.
        let unopened = unsafe { BorrowedFd::borrow_raw(1 << 20) };
        let mut set = DescriptorSet::new();
        set.watch(Token(4), unopened, Interest::READABLE);

        assert!(matches!(
            mux.wait(&set, Some(Duration::from_millis(100))),
            Err(MuxError::InvalidDescriptor(Token(4)))
        ));
    }

    #[test]
    fn test_watch_replaces_same_token() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut set = DescriptorSet::new();
        set.watch(Token(1), a.as_fd(), Interest::READABLE)
            .watch(Token(1), a.as_fd(), Interest::BOTH)
            .watch(Token(2), b.as_fd(), Interest::WRITABLE);

        assert_eq!(set.len(), 2);
        assert_eq!(set.interest(Token(1)), Some(Interest::BOTH));
        assert_eq!(set.interest(Token(3)), None);
    }

    #[test]
    fn test_interest_union() {
        assert_eq!(Interest::READABLE.union(Interest::WRITABLE), Interest::BOTH);
        assert_eq!(Interest::default().union(Interest::READABLE), Interest::READABLE);
    }

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }
}
