//! # Reactor: the listener's completion loop
//!
//! One dedicated OS thread per listener. Each turn:
//!
//! 1. once `Close()` has been asked for, cancel the listener's poll
//! 2. stop when the listener is released and no connection is left
//! 3. flush submissions the SQ could not take earlier
//! 4. `io_uring_enter(min_complete = 1, GETEVENTS)`: submit and block
//! 5. drain the CQ through the state machine, then check CQ overflow
//!
//! The loop is the only writer of the CQ head and the only user of the
//! registry. Other threads reach it through `LoopShared`: a stop flag, a
//! bounded lock-free queue of resume requests, and an eventfd that wakes
//! the blocked `enter`. The ring lives as long as the loop, so connections
//! handed out before `Close()` keep being read.

use crate::error::Error;
use crate::machine::{Acceptor, StateMachine};
use crate::stats::StatsCounters;

use uring_core::buffer::BufferProvider;
use uring_core::completion::CompletionRing;
use uring_core::error::Result;
use uring_core::ring::{enter_flags, RingHandle};
use uring_module::cq_consumer::CqConsumer;
use uring_module::eventfd_waker::EventFdWaker;

use crossbeam_queue::ArrayQueue;
use socket2::Socket;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// State shared between the loop thread and everyone else.
pub(crate) struct LoopShared {
    stop: AtomicBool,
    /// The loop thread is gone; nobody drains `resume` any more.
    exited: AtomicBool,
    pub waker: EventFdWaker,
    /// Connection ids whose reader made room in a full queue.
    resume: ArrayQueue<u64>,
    /// Errno of the error that killed the loop; 0 while healthy.
    fatal: AtomicI32,
    pub stats: StatsCounters,
}

impl LoopShared {
    pub fn new(resume_capacity: usize) -> nix::Result<Self> {
        Ok(Self {
            stop: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            waker: EventFdWaker::create()?,
            resume: ArrayQueue::new(resume_capacity),
            fatal: AtomicI32::new(0),
            stats: StatsCounters::default(),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn fail(&self, errno: i32) {
        self.fatal.store(errno, Ordering::Release);
    }

    pub fn fatal(&self) -> Option<i32> {
        match self.fatal.load(Ordering::Acquire) {
            0 => None,
            e => Some(e),
        }
    }

    /// What `accept()` reports once the handoff queue is gone.
    pub fn closed_error(&self) -> Error {
        match self.fatal() {
            Some(errno) => Error::LoopFailed(errno),
            None => Error::Closed,
        }
    }

    /// Queue a resume for a parked connection and wake the loop.
    pub fn request_resume(&self, conn: u64) {
        let mut pending = conn;
        loop {
            match self.resume.push(pending) {
                Ok(()) => break,
                // Nobody will drain it.
                Err(_) if self.has_exited() => return,
                Err(returned) => {
                    // Full: let the loop catch up.
                    let _ = self.waker.wake();
                    std::thread::yield_now();
                    pending = returned;
                }
            }
        }
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "loop wakeup failed");
        }
    }

    pub fn pop_resume(&self) -> Option<u64> {
        self.resume.pop()
    }
}

pub(crate) struct Reactor<R, B, L = Socket> {
    ring: R,
    consumer: CqConsumer,
    machine: StateMachine<B, L>,
    /// CQ overflow counter as of the last drain.
    overflow_seen: u32,
}

impl<R: RingHandle, B: BufferProvider, L: Acceptor> Reactor<R, B, L> {
    pub fn new(ring: R, machine: StateMachine<B, L>) -> Self {
        let overflow_seen = ring.completions().overflow();
        Self {
            ring,
            consumer: CqConsumer::new(),
            machine,
            overflow_seen,
        }
    }

    /// Register the wakeup and the listener's first readiness poll and hand
    /// them to the kernel. Done before the loop thread exists, so the first
    /// connection cannot arrive unobserved.
    pub fn start(&mut self) -> Result<()> {
        self.machine.arm_wakeup(&mut self.ring);
        self.machine.arm_listener(&mut self.ring);
        if let Some(e) = self.machine.take_fatal() {
            return Err(e);
        }
        self.machine.flush_backlog(&mut self.ring)?;
        self.ring.enter(0, 0)?;
        Ok(())
    }

    /// One submit/wait/drain cycle. Returns the number of completions
    /// handled.
    pub fn turn(&mut self, min_complete: u32) -> Result<u32> {
        self.machine.flush_backlog(&mut self.ring)?;
        match self.ring.enter(min_complete, enter_flags::GETEVENTS) {
            Ok(_) => {}
            // EBUSY: CQ backed up; draining below makes room.
            Err(e) if e.is_transient() => tracing::trace!(error = %e, "enter interrupted"),
            Err(e) => return Err(e),
        }

        let machine = &mut self.machine;
        let n = self
            .consumer
            .drain(&mut self.ring, |ring, rec| machine.dispatch(ring, rec));

        let overflow = self.ring.completions().overflow();
        if overflow != self.overflow_seen {
            self.machine.note_cq_overflow(overflow.wrapping_sub(self.overflow_seen));
            self.overflow_seen = overflow;
        }

        match self.machine.take_fatal() {
            Some(e) => Err(e),
            None => Ok(n),
        }
    }

    /// Close handling plus one turn. `Ok(false)` once there is nothing
    /// left to serve.
    pub fn tick(&mut self, shared: &LoopShared, min_complete: u32) -> Result<bool> {
        if shared.is_stopped() {
            self.machine.close_listener(&mut self.ring);
        }
        if self.machine.is_drained() {
            return Ok(false);
        }
        self.turn(min_complete)?;
        Ok(true)
    }

    pub fn run(mut self, shared: &LoopShared) -> Result<()> {
        tracing::info!(
            registered = self.machine.registry().len(),
            "completion loop started"
        );
        let result = loop {
            match self.tick(shared, 1) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "completion loop failed");
            // Recorded before the handoff sender drops.
            shared.fail(e.errno().unwrap_or(libc::EIO));
        }
        self.machine.shutdown();
        shared.mark_exited();
        let drained = self.consumer.stats();
        tracing::info!(
            batches = drained.batches,
            records = drained.records,
            max_batch = drained.max_batch,
            "completion loop stopped"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::machine::{MachineParams, Role};
    use crate::socket::{listen_socket, Network};

    use crate::conn::Connection;

    use uring_core::entry::{op, poll, CompletionRecord, CorrId};
    use uring_core::error::{Errno, RingError};
    use uring_module::fixed_buffers::FixedBuffers;
    use uring_module::heap_ring::HeapRing;

    use crossbeam_channel::{Receiver, TryRecvError};

    use std::net::{SocketAddr, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    type TestReactor = Reactor<HeapRing, FixedBuffers>;

    struct Fixture {
        reactor: TestReactor,
        shared: Arc<LoopShared>,
        handoff: Receiver<Connection>,
        released: Receiver<()>,
        addr: SocketAddr,
    }

    fn fixture() -> Fixture {
        let (socket, local) =
            listen_socket(Network::Tcp4, "127.0.0.1:0", &[], &ListenerConfig::new()).unwrap();
        let shared = Arc::new(LoopShared::new(4).unwrap());
        let (tx, rx) = crossbeam_channel::bounded(4);
        let (released_tx, released_rx) = crossbeam_channel::bounded(0);
        let machine = StateMachine::new(
            Arc::new(socket),
            FixedBuffers::new(2, 64).unwrap(),
            tx,
            released_tx,
            shared.clone(),
            MachineParams {
                inbound_chunks: 2,
                handoff_retry: Duration::from_millis(5),
                read_buffer_size: 64,
                accept_backoff: Duration::from_millis(10),
            },
        );
        Fixture {
            reactor: Reactor::new(HeapRing::new(), machine),
            shared,
            handoff: rx,
            released: released_rx,
            addr: local.as_inet().unwrap(),
        }
    }

    impl Fixture {
        fn op_for(&self, wanted: impl Fn(&Role) -> bool) -> CorrId {
            self.reactor
                .machine
                .registry()
                .iter()
                .find(|e| wanted(&e.role))
                .map(|e| e.corr_id)
                .unwrap()
        }

        fn listener_op(&self) -> CorrId {
            self.op_for(|r| matches!(r, Role::Listening))
        }
    }

    #[test]
    fn start_registers_listener_before_loop_runs() {
        let mut f = fixture();
        f.reactor.start().unwrap();
        let subs = f.reactor.ring.submitted();
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| s.opcode == op::POLL_ADD));
        assert_eq!(subs[0].fd, f.shared.waker.fd());
        assert_eq!(f.reactor.machine.registry().count_fd(subs[1].fd), 1);
        assert_eq!(f.reactor.ring.pending(), 0, "flushed to the kernel");
        assert_eq!(f.reactor.ring.enters(), 1);
    }

    #[test]
    fn turn_drains_and_dispatches() {
        let mut f = fixture();
        f.reactor.start().unwrap();
        let _client = TcpStream::connect(f.addr).unwrap();
        let listen = f.listener_op();
        f.reactor.ring.complete(CompletionRecord::new(listen, poll::POLLIN as i32, 0));
        assert_eq!(f.reactor.turn(0).unwrap(), 1);
        let conn = f.handoff.try_recv().unwrap();
        assert_eq!(f.reactor.machine.registry().count_fd(conn.as_raw_fd()), 1);
        assert_eq!(f.shared.stats.snapshot().completions, 1);
    }

    #[test]
    fn transient_enter_error_keeps_the_loop_going() {
        let mut f = fixture();
        f.reactor.start().unwrap();
        let _client = TcpStream::connect(f.addr).unwrap();
        let listen = f.listener_op();
        f.reactor.ring.complete(CompletionRecord::new(listen, poll::POLLIN as i32, 0));
        f.reactor.ring.fail_next_enter(RingError::Enter(Errno(libc::EINTR)));
        f.reactor.ring.fail_next_enter(RingError::Enter(Errno(libc::EBUSY)));

        assert!(f.reactor.tick(&f.shared, 0).unwrap());
        assert!(f.handoff.try_recv().is_ok(), "completions drained despite EINTR");
        assert!(f.reactor.tick(&f.shared, 0).unwrap());
        assert_eq!(f.shared.fatal(), None);
    }

    #[test]
    fn fatal_enter_error_fails_blocked_accept() {
        let mut f = fixture();
        f.reactor.start().unwrap();
        f.reactor.ring.fail_next_enter(RingError::Enter(Errno(libc::EBADF)));

        let waiter = {
            let shared = f.shared.clone();
            let handoff = f.handoff.clone();
            thread::spawn(move || handoff.recv().map_err(|_| shared.closed_error()))
        };
        thread::sleep(Duration::from_millis(20));

        let err = f.reactor.run(&f.shared).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBADF));
        assert_eq!(f.shared.fatal(), Some(libc::EBADF));
        assert!(f.shared.has_exited());
        assert!(matches!(waiter.join().unwrap(), Err(Error::LoopFailed(libc::EBADF))));
        assert!(matches!(f.released.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn cq_overflow_is_counted_once() {
        let mut f = fixture();
        f.reactor.start().unwrap();
        f.reactor.ring.completions().drop_completion();
        f.reactor.ring.completions().drop_completion();
        f.reactor.turn(0).unwrap();
        assert_eq!(f.shared.stats.snapshot().cq_overflow, 2);
        f.reactor.turn(0).unwrap();
        assert_eq!(f.shared.stats.snapshot().cq_overflow, 2);
    }

    #[test]
    fn close_keeps_loop_until_connections_retire() {
        let mut f = fixture();
        f.reactor.start().unwrap();
        let _client = TcpStream::connect(f.addr).unwrap();
        let listen = f.listener_op();
        f.reactor.ring.complete(CompletionRecord::new(listen, poll::POLLIN as i32, 0));
        f.reactor.turn(0).unwrap();
        let conn = f.handoff.try_recv().unwrap();
        let conn_fd = conn.as_raw_fd();

        f.shared.stop();
        let listen = f.listener_op();
        assert!(f.reactor.tick(&f.shared, 0).unwrap());
        let cancel = *f.reactor.ring.submitted().last().unwrap();
        assert_eq!(cancel.opcode, op::POLL_REMOVE);
        f.reactor.ring.complete(CompletionRecord::new(listen, -libc::ECANCELED, 0));
        f.reactor.ring.complete(CompletionRecord::new(cancel.corr_id, 0, 0));
        assert!(f.reactor.tick(&f.shared, 0).unwrap());
        assert!(matches!(f.released.try_recv(), Err(TryRecvError::Disconnected)));

        // The connection still holds the loop open.
        assert!(f.reactor.tick(&f.shared, 0).unwrap());
        let poll_id = f.op_for(|r| matches!(r, Role::Established(d) if d.fd() == conn_fd));
        drop(conn);
        f.reactor.ring.complete(CompletionRecord::new(poll_id, poll::POLLHUP as i32, 0));
        assert!(f.reactor.tick(&f.shared, 0).unwrap());
        assert!(!f.reactor.tick(&f.shared, 0).unwrap());
        assert!(f.reactor.run(&f.shared).is_ok());
        assert!(f.shared.has_exited());
    }

    #[test]
    fn resume_requests_wake_the_loop() {
        let shared = LoopShared::new(2).unwrap();
        shared.request_resume(7);
        shared.request_resume(8);
        assert_eq!(shared.waker.drain(), 2);
        assert_eq!(shared.pop_resume(), Some(7));
        assert_eq!(shared.pop_resume(), Some(8));
        assert_eq!(shared.pop_resume(), None);
    }

    #[test]
    fn full_resume_queue_gives_up_once_loop_exited() {
        let shared = LoopShared::new(1).unwrap();
        shared.request_resume(1);
        shared.mark_exited();
        shared.request_resume(2);
        assert_eq!(shared.pop_resume(), Some(1));
        assert_eq!(shared.pop_resume(), None);
    }

    #[test]
    fn closed_error_reflects_loop_failure() {
        let shared = LoopShared::new(1).unwrap();
        assert!(matches!(shared.closed_error(), Error::Closed));
        shared.fail(libc::EBADF);
        assert_eq!(shared.fatal(), Some(libc::EBADF));
        assert!(matches!(shared.closed_error(), Error::LoopFailed(libc::EBADF)));
    }
}
