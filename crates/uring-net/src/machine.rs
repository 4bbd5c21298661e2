//! Connection state machine.
//!
//! Every drained completion is resolved through the registry and handled
//! according to the role of the operation that produced it:
//!
//! ```text
//! Listening ──readiness──▶ accept until EWOULDBLOCK
//!     ▲                      │ per connection: arm poll (Established), hand off
//!     ├──────── re-arm ──────┤ unless stopping
//!     │                      │ out of descriptors or memory
//!     └──────── Backoff ◀────┘ timer, then re-arm
//!
//! Established ──readiness──▶ Reading ──data──▶ queue ──▶ Established
//!                               │ (queue full) ──▶ parked ──resume──▶ Established
//!                               └ EOF / error ──▶ retired
//!
//! Wakeup ──fired──▶ process resume requests, re-arm
//! ```
//!
//! Registering an operation and submitting it happen together in `arm()`.
//! A submission the SQ cannot take right now goes to a backlog that the
//! loop flushes before blocking; its registry entry already stands.
//!
//! Closing the listener cancels its poll (`Cancel`) and releases the
//! listening socket once that poll has completed. Connections already
//! handed off are served until each is retired.

use crate::conn::{ConnDriver, ConnShared, Connection, Flush};
use crate::reactor::LoopShared;
use crate::registry::{OperationEntry, OperationRegistry};
use crate::socket::Addr;
use crate::stats::StatsCounters;

use uring_core::buffer::{BufferHandle, BufferProvider};
use uring_core::entry::{poll, CompletionRecord, CorrId, SubmissionRequest, Timespec};
use uring_core::error::{Result, RingError};
use uring_core::ring::RingHandle;

use crossbeam_channel::{SendTimeoutError, Sender};
use socket2::{SockAddr, Socket};

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32};
use std::sync::Arc;
use std::time::Duration;

const CONN_POLL_MASK: u32 = poll::POLLIN | poll::POLLRDHUP;

/// Source of accepted sockets.
pub(crate) trait Acceptor: AsRawFd {
    fn accept_one(&self) -> io::Result<(Socket, SockAddr)>;
}

impl Acceptor for Socket {
    fn accept_one(&self) -> io::Result<(Socket, SockAddr)> {
        self.accept()
    }
}

pub(crate) enum Role {
    Listening,
    /// Delayed listener re-arm. The kernel copies the timespec when it
    /// takes the request.
    Backoff(Box<Timespec>),
    /// Removal of the listener's poll.
    Cancel,
    /// Loop eventfd.
    Wakeup,
    /// Readiness poll on an accepted connection.
    Established(ConnDriver),
    /// Read in flight into `buf`.
    Reading { driver: ConnDriver, buf: BufferHandle },
}

pub(crate) struct MachineParams {
    pub inbound_chunks: usize,
    pub handoff_retry: Duration,
    pub read_buffer_size: usize,
    pub accept_backoff: Duration,
}

/// How an accept-drain ended.
#[derive(Debug, PartialEq, Eq)]
enum DrainEnd {
    /// Nothing left pending.
    Empty,
    /// Out of descriptors or memory; connections may still be pending.
    Starved,
}

pub(crate) struct StateMachine<B, L = Socket> {
    registry: OperationRegistry<Role>,
    /// Dropped once closing and no poll refers to it.
    listener: Option<Arc<L>>,
    listener_fd: RawFd,
    /// The listener's outstanding poll.
    listener_op: Option<CorrId>,
    closing: bool,
    buffers: B,
    handoff: Option<Sender<Connection>>,
    /// Disconnects when the listening socket is released.
    released: Option<Sender<()>>,
    shared: Arc<LoopShared>,
    /// Connections waiting for their reader, keyed by connection id.
    parked: HashMap<u64, ConnDriver>,
    backlog: VecDeque<SubmissionRequest>,
    fatal: Option<RingError>,
    next_conn: u64,
    /// Accepted and not yet retired.
    live: usize,
    /// Accepts are failing for lack of resources.
    starved: bool,
    params: MachineParams,
    /// Inline reads when the buffer pool is exhausted.
    scratch: Vec<u8>,
}

impl<B: BufferProvider, L: Acceptor> StateMachine<B, L> {
    pub fn new(
        listener: Arc<L>,
        buffers: B,
        handoff: Sender<Connection>,
        released: Sender<()>,
        shared: Arc<LoopShared>,
        params: MachineParams,
    ) -> Self {
        Self {
            registry: OperationRegistry::new(),
            listener_fd: listener.as_raw_fd(),
            listener: Some(listener),
            listener_op: None,
            closing: false,
            buffers,
            handoff: Some(handoff),
            released: Some(released),
            shared,
            parked: HashMap::new(),
            backlog: VecDeque::new(),
            fatal: None,
            next_conn: 0,
            live: 0,
            starved: false,
            scratch: vec![0; params.read_buffer_size],
            params,
        }
    }

    fn stats(&self) -> &StatsCounters {
        &self.shared.stats
    }

    pub fn registry(&self) -> &OperationRegistry<Role> {
        &self.registry
    }

    /// First fatal submission error, if any.
    pub fn take_fatal(&mut self) -> Option<RingError> {
        self.fatal.take()
    }

    /// Connections accepted and still served by the loop.
    pub fn live_connections(&self) -> usize {
        self.live
    }

    /// The listening socket is released and every connection retired.
    pub fn is_drained(&self) -> bool {
        self.listener.is_none() && self.live == 0
    }

    // ── submission ──

    fn arm<R: RingHandle>(
        &mut self,
        ring: &mut R,
        fd: RawFd,
        role: Role,
        make: impl FnOnce(CorrId) -> SubmissionRequest,
    ) -> CorrId {
        let corr_id = ring.id();
        self.registry.register(OperationEntry { fd, role, corr_id });
        self.submit(ring, make(corr_id));
        corr_id
    }

    fn submit<R: RingHandle>(&mut self, ring: &mut R, req: SubmissionRequest) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(req);
            return;
        }
        match ring.submit(&req) {
            Ok(()) => {}
            Err(e) if matches!(e, RingError::RingFull) || e.is_transient() => {
                tracing::debug!(id = %req.corr_id, "submission queue full, deferring");
                self.backlog.push_back(req);
            }
            Err(e) => {
                self.backlog.push_back(req);
                if self.fatal.is_none() {
                    self.fatal = Some(e);
                }
            }
        }
    }

    /// Retry deferred submissions in order.
    pub fn flush_backlog<R: RingHandle>(&mut self, ring: &mut R) -> Result<()> {
        while let Some(req) = self.backlog.front() {
            match ring.submit(req) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(e) if matches!(e, RingError::RingFull) || e.is_transient() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn arm_listener<R: RingHandle>(&mut self, ring: &mut R) {
        if self.listener.is_none() {
            return;
        }
        let fd = self.listener_fd;
        let id = self.arm(ring, fd, Role::Listening, |id| {
            SubmissionRequest::poll_add(fd, poll::POLLIN, id)
        });
        self.listener_op = Some(id);
        tracing::trace!(fd, %id, "listener armed");
    }

    fn arm_backoff<R: RingHandle>(&mut self, ring: &mut R) {
        let ts = Box::new(Timespec::from(self.params.accept_backoff));
        let corr_id = ring.id();
        let req = SubmissionRequest::timeout(&ts, corr_id);
        self.registry.register(OperationEntry {
            fd: self.listener_fd,
            role: Role::Backoff(ts),
            corr_id,
        });
        self.submit(ring, req);
        StatsCounters::bump(&self.stats().accept_backoffs);
    }

    pub fn arm_wakeup<R: RingHandle>(&mut self, ring: &mut R) {
        let fd = self.shared.waker.fd();
        self.arm(ring, fd, Role::Wakeup, |id| SubmissionRequest::poll_add(fd, poll::POLLIN, id));
    }

    fn arm_poll<R: RingHandle>(&mut self, ring: &mut R, driver: ConnDriver) {
        let fd = driver.fd();
        self.arm(ring, fd, Role::Established(driver), |id| {
            SubmissionRequest::poll_add(fd, CONN_POLL_MASK, id)
        });
    }

    // ── dispatch ──

    pub fn dispatch<R: RingHandle>(&mut self, ring: &mut R, rec: CompletionRecord) {
        StatsCounters::bump(&self.stats().completions);
        let Some(entry) = self.registry.remove(rec.corr_id) else {
            StatsCounters::bump(&self.stats().stale);
            tracing::trace!(id = %rec.corr_id, res = rec.result, "stale completion");
            return;
        };
        tracing::trace!(id = %rec.corr_id, fd = entry.fd, res = rec.result, "completion");
        match entry.role {
            Role::Listening => self.on_listen_ready(ring, rec),
            Role::Backoff(_) => self.on_backoff_done(ring),
            Role::Cancel => tracing::trace!(res = rec.result, "listener poll removal done"),
            Role::Wakeup => self.on_wakeup(ring),
            Role::Established(driver) => self.on_conn_ready(ring, driver, rec),
            Role::Reading { driver, buf } => self.on_read_done(ring, driver, buf, rec),
        }
    }

    fn on_listen_ready<R: RingHandle>(&mut self, ring: &mut R, rec: CompletionRecord) {
        self.listener_op = None;
        if self.closing || rec.result == -libc::ECANCELED {
            self.release_listener();
            return;
        }
        if let Some(errno) = rec.errno() {
            tracing::warn!(errno, "listener poll failed");
        }
        let end = self.accept_drain(ring);
        if self.shared.is_stopped() {
            tracing::debug!("stopping, listener not re-armed");
            self.release_listener();
            return;
        }
        match end {
            DrainEnd::Empty => {
                self.arm_listener(ring);
                StatsCounters::bump(&self.stats().listener_rearms);
            }
            DrainEnd::Starved => self.arm_backoff(ring),
        }
    }

    fn on_backoff_done<R: RingHandle>(&mut self, ring: &mut R) {
        if self.closing || self.shared.is_stopped() {
            self.release_listener();
            return;
        }
        self.arm_listener(ring);
        StatsCounters::bump(&self.stats().listener_rearms);
    }

    /// Accept until nothing is pending.
    fn accept_drain<R: RingHandle>(&mut self, ring: &mut R) -> DrainEnd {
        let Some(listener) = self.listener.clone() else {
            return DrainEnd::Empty;
        };
        loop {
            match listener.accept_one() {
                Ok((socket, peer)) => {
                    self.starved = false;
                    self.on_accepted(ring, socket, &peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DrainEnd::Empty,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    StatsCounters::bump(&self.stats().accept_errors);
                    let errno = e.raw_os_error().unwrap_or(0);
                    if accept_error_is_per_connection(errno) {
                        tracing::warn!(error = %e, "accept failed, skipping connection");
                        continue;
                    }
                    let backoff_ms = self.params.accept_backoff.as_millis() as u64;
                    if self.starved {
                        tracing::debug!(error = %e, backoff_ms, "accept still failing");
                    } else {
                        tracing::warn!(error = %e, backoff_ms, "accept failed, backing off");
                    }
                    self.starved = true;
                    return DrainEnd::Starved;
                }
            }
        }
    }

    fn on_accepted<R: RingHandle>(&mut self, ring: &mut R, socket: Socket, peer: &SockAddr) {
        let remote = Addr::decode(peer);
        let local = match socket.set_nonblocking(true).and_then(|()| socket.local_addr()) {
            Ok(a) => Addr::decode(&a),
            Err(e) => {
                StatsCounters::bump(&self.stats().accept_errors);
                tracing::warn!(peer = %remote, error = %e, "dropping accepted connection");
                return;
            }
        };

        let id = self.next_conn;
        self.next_conn += 1;
        let (tx, rx) = crossbeam_channel::bounded(self.params.inbound_chunks);
        let shared = Arc::new(ConnShared {
            id,
            socket,
            local,
            remote,
            closed: AtomicBool::new(false),
            error: AtomicI32::new(0),
            parked: AtomicBool::new(false),
        });
        tracing::debug!(conn = id, fd = shared.fd(), peer = %shared.remote, "accepted");

        self.live += 1;
        self.arm_poll(ring, ConnDriver::new(shared.clone(), tx));
        self.hand_off(Connection::new(shared, rx, self.shared.clone()));
    }

    /// Push onto the handoff queue, waiting while it is full. Gives up
    /// only when the loop is stopping.
    fn hand_off(&mut self, conn: Connection) {
        let Some(handoff) = &self.handoff else {
            tracing::debug!(peer = %conn.remote_addr(), "listener closed, dropping accepted connection");
            return;
        };
        let mut conn = conn;
        loop {
            match handoff.send_timeout(conn, self.params.handoff_retry) {
                Ok(()) => {
                    StatsCounters::bump(&self.stats().accepted);
                    return;
                }
                Err(SendTimeoutError::Timeout(c)) if !self.shared.is_stopped() => {
                    tracing::trace!("handoff queue full, waiting");
                    conn = c;
                }
                Err(SendTimeoutError::Timeout(c)) | Err(SendTimeoutError::Disconnected(c)) => {
                    tracing::debug!(peer = %c.remote_addr(), "listener gone, closing accepted connection");
                    return;
                }
            }
        }
    }

    /// Stop accepting: drop the handoff queue and cancel the listener's
    /// poll. The socket is released when that poll completes.
    pub fn close_listener<R: RingHandle>(&mut self, ring: &mut R) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.handoff = None;
        let outstanding = self
            .listener_op
            .filter(|id| self.registry.resolve(*id).is_some());
        match outstanding {
            Some(target) => {
                self.arm(ring, -1, Role::Cancel, |id| SubmissionRequest::poll_remove(target, id));
                tracing::debug!(fd = self.listener_fd, id = %target, "cancelling listener poll");
            }
            // Backing off, or already released.
            None => self.release_listener(),
        }
    }

    fn release_listener(&mut self) {
        self.listener_op = None;
        self.handoff = None;
        if self.listener.take().is_some() {
            tracing::debug!(fd = self.listener_fd, live = self.live, "listening socket released");
        }
        self.released = None;
    }

    fn on_conn_ready<R: RingHandle>(&mut self, ring: &mut R, driver: ConnDriver, rec: CompletionRecord) {
        if driver.shared.is_closed() {
            self.retire(driver, "closed by caller");
            return;
        }
        if let Some(errno) = rec.errno() {
            driver.fail(errno);
            self.retire(driver, "poll failed");
            return;
        }

        let Some(buf) = self.buffers.acquire() else {
            // Pool exhausted; the socket is ready, read it here.
            let res = match (&driver.shared.socket).read(&mut self.scratch) {
                Ok(n) => n as i32,
                Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            };
            if res > 0 {
                let chunk = self.scratch[..res as usize].to_vec();
                StatsCounters::bump(&self.stats().reads);
                self.deliver(ring, driver, chunk);
            } else {
                self.read_ended(ring, driver, res);
            }
            return;
        };

        let fd = driver.fd();
        let registered = self.buffers.is_registered();
        self.arm(ring, fd, Role::Reading { driver, buf }, |id| {
            if registered {
                SubmissionRequest::read_fixed(fd, &buf, id)
            } else {
                SubmissionRequest::recv(fd, &buf, id)
            }
        });
    }

    fn on_read_done<R: RingHandle>(
        &mut self,
        ring: &mut R,
        driver: ConnDriver,
        buf: BufferHandle,
        rec: CompletionRecord,
    ) {
        if rec.result > 0 {
            let n = (rec.result as usize).min(buf.len);
            let chunk = unsafe { buf.filled(n) }.to_vec();
            self.buffers.release(buf);
            StatsCounters::bump(&self.stats().reads);
            self.deliver(ring, driver, chunk);
        } else {
            self.buffers.release(buf);
            self.read_ended(ring, driver, rec.result);
        }
    }

    /// A read returned `res <= 0`.
    fn read_ended<R: RingHandle>(&mut self, ring: &mut R, driver: ConnDriver, res: i32) {
        match -res {
            0 => self.retire(driver, "eof"),
            libc::EAGAIN | libc::EINTR => self.arm_poll(ring, driver),
            errno => {
                driver.fail(errno);
                self.retire(driver, "read failed");
            }
        }
    }

    fn deliver<R: RingHandle>(&mut self, ring: &mut R, mut driver: ConnDriver, chunk: Vec<u8>) {
        driver.stash(chunk);
        self.park_or_rearm(ring, driver);
    }

    /// Flush the stashed chunk, then either re-arm the poll or park.
    fn park_or_rearm<R: RingHandle>(&mut self, ring: &mut R, mut driver: ConnDriver) {
        use std::sync::atomic::Ordering;

        if driver.shared.is_closed() {
            self.retire(driver, "closed by caller");
            return;
        }
        match driver.flush() {
            Flush::Sent => return self.arm_poll(ring, driver),
            Flush::Gone => return self.retire(driver, "reader dropped"),
            Flush::Full => {}
        }

        driver.shared.parked.store(true, Ordering::Release);
        // The reader may have drained the queue before seeing the flag.
        match driver.flush() {
            Flush::Sent if driver.shared.parked.swap(false, Ordering::AcqRel) => {
                self.arm_poll(ring, driver);
            }
            Flush::Gone => {
                driver.shared.parked.store(false, Ordering::Release);
                self.retire(driver, "reader dropped");
            }
            // Still full, or the reader already claimed the resume.
            _ => {
                StatsCounters::bump(&self.stats().parked);
                tracing::trace!(conn = driver.id(), "parked");
                self.parked.insert(driver.id(), driver);
            }
        }
    }

    fn on_wakeup<R: RingHandle>(&mut self, ring: &mut R) {
        self.shared.waker.drain();
        while let Some(conn) = self.shared.pop_resume() {
            if let Some(driver) = self.parked.remove(&conn) {
                tracing::trace!(conn, "resumed");
                self.park_or_rearm(ring, driver);
            }
        }
        self.arm_wakeup(ring);
    }

    fn retire(&mut self, driver: ConnDriver, why: &'static str) {
        self.live = self.live.saturating_sub(1);
        tracing::debug!(conn = driver.id(), fd = driver.fd(), why, live = self.live, "connection retired");
        drop(driver);
    }

    /// Count completions the kernel dropped on a full CQ.
    pub fn note_cq_overflow(&mut self, lost: u32) {
        StatsCounters::add(&self.stats().cq_overflow, lost as u64);
        tracing::warn!(
            lost,
            outstanding = self.registry.len(),
            "completion queue overflowed, completions lost"
        );
    }

    /// Tear down on loop exit. Buffers of reads still in flight are never
    /// released; the pool then refuses to free its memory.
    pub fn shutdown(&mut self) {
        let mut in_flight = 0usize;
        for entry in self.registry.drain() {
            if let Role::Reading { .. } = entry.role {
                in_flight += 1;
            }
        }
        let parked = self.parked.len();
        self.parked.clear();
        self.release_listener();
        tracing::debug!(
            in_flight,
            pool = self.buffers.pool_size(),
            parked,
            live = self.live,
            backlog = self.backlog.len(),
            "state machine shut down"
        );
        self.live = 0;
        self.backlog.clear();
    }
}

/// Accept errors that concern only the connection being accepted. Linux
/// reports pending network errors on the new socket through `accept`.
fn accept_error_is_per_connection(errno: i32) -> bool {
    matches!(
        errno,
        libc::ECONNABORTED
            | libc::EPROTO
            | libc::EPERM
            | libc::ENETDOWN
            | libc::ENOPROTOOPT
            | libc::EHOSTDOWN
            | libc::ENONET
            | libc::EHOSTUNREACH
            | libc::ENETUNREACH
            | libc::ECONNRESET
    )
}
