//! Accepted connections.
//!
//! The socket is shared between two owners:
//!
//! - the caller's `Connection`, which reads buffered chunks from its
//!   inbound queue and writes straight to the socket;
//! - the loop's `ConnDriver`, which sits in the registry behind the one
//!   poll or read outstanding for the connection and fills the queue.
//!
//! The descriptor closes when both are gone. When the driver is retired
//! (EOF, error, shutdown) its queue sender drops, and the reader sees end
//! of stream once the queued chunks are consumed.
//!
//! A driver whose queue is full is *parked*: it keeps the chunk it could
//! not deliver and has nothing outstanding. The `parked` flag decides who
//! re-arms it. The loop sets it when parking; whichever side swaps it back
//! to `false` first owns the wake-up, so the connection is re-armed once.

use crate::reactor::LoopShared;
use crate::socket::Addr;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use socket2::Socket;

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ConnShared {
    pub id: u64,
    pub socket: Socket,
    pub local: Addr,
    pub remote: Addr,
    /// Caller closed its side.
    pub closed: AtomicBool,
    /// Errno that ended the read side; 0 for a clean EOF.
    pub error: AtomicI32,
    pub parked: AtomicBool,
}

impl ConnShared {
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Outcome of pushing the stashed chunk into the inbound queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flush {
    /// Nothing left stashed.
    Sent,
    /// Queue full; chunk still stashed.
    Full,
    /// Reader dropped.
    Gone,
}

/// Loop-side half of a connection.
pub(crate) struct ConnDriver {
    pub shared: Arc<ConnShared>,
    inbound: Sender<Vec<u8>>,
    stash: Option<Vec<u8>>,
}

impl ConnDriver {
    pub fn new(shared: Arc<ConnShared>, inbound: Sender<Vec<u8>>) -> Self {
        Self { shared, inbound, stash: None }
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd()
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn stash(&mut self, chunk: Vec<u8>) {
        debug_assert!(self.stash.is_none());
        self.stash = Some(chunk);
    }

    pub fn flush(&mut self) -> Flush {
        let Some(chunk) = self.stash.take() else {
            return Flush::Sent;
        };
        match self.inbound.try_send(chunk) {
            Ok(()) => Flush::Sent,
            Err(TrySendError::Full(chunk)) => {
                self.stash = Some(chunk);
                Flush::Full
            }
            Err(TrySendError::Disconnected(_)) => Flush::Gone,
        }
    }

    /// End the read side with `errno` (0 for EOF).
    pub fn fail(&self, errno: i32) {
        self.shared.error.store(errno, Ordering::Release);
    }
}

/// An accepted connection.
///
/// Reads are blocking and served from data the loop has already read;
/// writes go directly to the non-blocking socket, waiting for writability
/// when the send buffer is full.
pub struct Connection {
    shared: Arc<ConnShared>,
    inbound: Receiver<Vec<u8>>,
    loop_shared: Arc<LoopShared>,
    chunk: Vec<u8>,
    pos: usize,
    bytes_read: u64,
    read_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnShared>,
        inbound: Receiver<Vec<u8>>,
        loop_shared: Arc<LoopShared>,
    ) -> Self {
        Self {
            shared,
            inbound,
            loop_shared,
            chunk: Vec::new(),
            pos: 0,
            bytes_read: 0,
            read_timeout: None,
        }
    }

    pub fn local_addr(&self) -> &Addr {
        &self.shared.local
    }

    pub fn remote_addr(&self) -> &Addr {
        &self.shared.remote
    }

    /// Bytes handed to the caller so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// `None` blocks reads indefinitely. A timed-out read fails with
    /// `WouldBlock`.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Shut the connection down. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Completes any poll the loop has outstanding.
        let res = match self.shared.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        };
        // A parked driver has nothing outstanding; ask the loop to retire it.
        self.resume_if_parked();
        res
    }

    fn resume_if_parked(&self) {
        if self.shared.parked.swap(false, Ordering::AcqRel) {
            self.loop_shared.request_resume(self.shared.id);
        }
    }

    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.shared.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let got = match self.read_timeout {
            Some(t) => self.inbound.recv_timeout(t),
            None => self.inbound.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match got {
            Ok(chunk) => {
                self.resume_if_parked();
                Ok(Some(chunk))
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "read timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => match self.shared.error.load(Ordering::Acquire) {
                0 => Ok(None),
                errno => Err(io::Error::from_raw_os_error(errno)),
            },
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos == self.chunk.len() {
            match self.next_chunk()? {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match (&self.shared.socket).write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(self.shared.fd())?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.shared.fd()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("local", &self.shared.local)
            .field("remote", &self.shared.remote)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}

fn wait_writable(fd: RawFd) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        match nix::errno::Errno::result(ret) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
