//! `Listener`: the caller-facing side.
//!
//! ```rust,ignore
//! use uring_net::Listener;
//!
//! let listener = Listener::listen("tcp", "127.0.0.1:8080", &[])?;
//! loop {
//!     let conn = listener.accept()?;
//!     std::thread::spawn(move || handle(conn));
//! }
//! ```
//!
//! `listen` builds everything and registers the listening socket's first
//! poll before the loop thread starts. `accept` blocks on the bounded
//! handoff queue the loop fills.
//!
//! `close` ends accepting only. Connections already handed out keep being
//! read; the loop thread exits, and the ring goes away, once the last of
//! them is closed.

use crate::config::ListenerConfig;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::machine::{MachineParams, StateMachine};
use crate::reactor::{LoopShared, Reactor};
use crate::socket::{self, Addr, ListenOption, Network};
use crate::stats::LoopStats;

use uring_module::fixed_buffers::FixedBuffers;
use uring_module::raw_ring::{RawRing, RingConfig};

use crossbeam_channel::Receiver;
use socket2::Socket;

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

pub struct Listener {
    network: Network,
    local: Addr,
    handoff: Receiver<Connection>,
    /// Disconnects once the loop no longer polls the listening socket.
    released: Receiver<()>,
    shared: Arc<LoopShared>,
    /// Dropped by `close`.
    socket: Mutex<Option<Arc<Socket>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Socket file to remove on close (unix networks).
    unix_path: Option<PathBuf>,
}

impl Listener {
    /// Listen with configuration from the environment.
    pub fn listen(network: &str, address: &str, options: &[ListenOption]) -> Result<Self> {
        Self::listen_with_config(network, address, options, ListenerConfig::from_env())
    }

    pub fn listen_with_config(
        network: &str,
        address: &str,
        options: &[ListenOption],
        config: ListenerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let network: Network = network.parse()?;
        let (socket, local) = socket::listen_socket(network, address, options, &config)?;

        let mut ring = RawRing::new(&RingConfig {
            sq_entries: config.sq_entries,
            cq_entries: config.cq_entries,
        })?;
        if !ring.keeps_overflow() {
            tracing::warn!("kernel may drop completions when the CQ is full");
        }

        let mut buffers = FixedBuffers::new(config.read_buffers, config.read_buffer_size)
            .ok_or(Error::InvalidConfig("read buffer pool"))?;
        if config.register_buffers {
            match ring.register_buffers(&buffers.iovecs()) {
                Ok(()) => buffers.mark_registered(),
                Err(e) => tracing::warn!(error = %e, "buffer registration failed, using recv"),
            }
        }

        let shared = Arc::new(
            LoopShared::new(config.resume_queue)
                .map_err(|e| Error::socket("eventfd")(e.into()))?,
        );
        let socket = Arc::new(socket);
        let (tx, rx) = crossbeam_channel::bounded(config.handoff_capacity);
        let (released_tx, released_rx) = crossbeam_channel::bounded(0);
        let machine = StateMachine::new(
            socket.clone(),
            buffers,
            tx,
            released_tx,
            shared.clone(),
            MachineParams {
                inbound_chunks: config.inbound_chunks,
                handoff_retry: config.handoff_retry,
                read_buffer_size: config.read_buffer_size,
                accept_backoff: config.accept_backoff,
            },
        );

        let mut reactor = Reactor::new(ring, machine);
        reactor.start()?;

        let fd = socket.as_raw_fd();
        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("uring-listen-{fd}"))
            .spawn(move || {
                let _ = reactor.run(&loop_shared);
            })
            .map_err(Error::Spawn)?;

        tracing::info!(%network, addr = %local, fd, "listening");
        let unix_path = match &local {
            Addr::Unix(Some(path)) => Some(path.clone()),
            _ => None,
        };
        Ok(Self {
            network,
            local,
            handoff: rx,
            released: released_rx,
            shared,
            socket: Mutex::new(Some(socket)),
            thread: Mutex::new(Some(thread)),
            unix_path,
        })
    }

    /// Next accepted connection, in accept order. Blocks until one is
    /// available, the listener is closed, or the loop has failed.
    pub fn accept(&self) -> Result<Connection> {
        if self.shared.is_stopped() {
            return Err(Error::Closed);
        }
        self.handoff.recv().map_err(|_| self.dead())
    }

    /// Like `accept`, without blocking.
    pub fn try_accept(&self) -> Result<Option<Connection>> {
        use crossbeam_channel::TryRecvError;

        if self.shared.is_stopped() {
            return Err(Error::Closed);
        }
        match self.handoff.try_recv() {
            Ok(conn) => Ok(Some(conn)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.dead()),
        }
    }

    fn dead(&self) -> Error {
        self.shared.closed_error()
    }

    /// Stop accepting and close the listening socket once the loop has let
    /// go of it. Accepted connections stay readable until they are closed.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shared.stop();
        if let Err(e) = self.shared.waker.wake() {
            tracing::warn!(error = %e, "loop wakeup failed");
        }
        // Nothing is ever sent; returns when the loop drops its end.
        let _ = self.released.recv();

        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(socket) = socket else {
            return Ok(());
        };
        drop(socket);
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }

        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(Err(_)) = thread.take().map(JoinHandle::join) {
                tracing::error!("completion loop panicked");
            }
        }
        tracing::info!(network = %self.network, addr = %self.local, "listener closed");
        Ok(())
    }

    /// Whether the loop thread still runs. It outlives `close` while
    /// accepted connections remain open.
    pub fn is_serving(&self) -> bool {
        !self.shared.has_exited()
    }

    pub fn local_addr(&self) -> &Addr {
        &self.local
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.stats.snapshot()
    }

    /// Connections as they are accepted; ends when the listener closes.
    pub fn incoming(&self) -> impl Iterator<Item = Result<Connection>> + '_ {
        std::iter::from_fn(move || match self.accept() {
            Err(Error::Closed) => None,
            other => Some(other),
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("network", &self.network)
            .field("local", &self.local)
            .finish()
    }
}
