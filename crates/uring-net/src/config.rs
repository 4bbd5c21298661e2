//! Listener configuration.
//!
//! Library defaults with environment overrides, plus builder methods:
//!
//! ```rust,ignore
//! use uring_net::config::ListenerConfig;
//!
//! let config = ListenerConfig::from_env()
//!     .handoff_capacity(64)
//!     .read_buffers(128);
//! ```

use crate::error::{Error, Result};

use uring_core::env::{env_get, env_get_bool, env_get_opt};

use std::path::PathBuf;
use std::time::Duration;

pub mod defaults {
    pub const SQ_ENTRIES: u32 = 256;
    pub const HANDOFF_CAPACITY: usize = 1024;
    pub const INBOUND_CHUNKS: usize = 128;
    pub const READ_BUFFER_SIZE: usize = 4096;
    pub const READ_BUFFERS: usize = 64;
    pub const REGISTER_BUFFERS: bool = true;
    pub const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;
    pub const FASTOPEN_QLEN: i32 = 256;
    pub const RESUME_QUEUE: usize = 1024;
    pub const HANDOFF_RETRY_MS: u64 = 50;
    pub const ACCEPT_BACKOFF_MS: u64 = 10;
    pub const FASTOPEN_SYSCTL: &str = "/proc/sys/net/ipv4/tcp_fastopen";
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// io_uring SQ size (power of 2).
    pub sq_entries: u32,
    /// io_uring CQ size; kernel default (2x SQ) when unset.
    pub cq_entries: Option<u32>,
    /// Accepted connections waiting for `accept()`.
    pub handoff_capacity: usize,
    /// Read chunks buffered per connection before it is parked.
    pub inbound_chunks: usize,
    pub read_buffer_size: usize,
    /// Buffers in the read pool.
    pub read_buffers: usize,
    /// Register the pool with the ring (`READ_FIXED`).
    pub register_buffers: bool,
    pub listen_backlog: i32,
    /// `TCP_FASTOPEN` queue length when fast open is requested.
    pub fastopen_qlen: i32,
    /// Capacity of the loop's resume request queue.
    pub resume_queue: usize,
    /// How long a blocked handoff waits before rechecking for shutdown.
    pub handoff_retry: Duration,
    /// Delay before re-arming the listener after accept ran out of
    /// descriptors or memory.
    pub accept_backoff: Duration,
    /// Sysctl consulted before enabling fast open.
    pub fastopen_sysctl: PathBuf,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerConfig {
    /// Library defaults, no environment.
    pub fn new() -> Self {
        Self {
            sq_entries: defaults::SQ_ENTRIES,
            cq_entries: None,
            handoff_capacity: defaults::HANDOFF_CAPACITY,
            inbound_chunks: defaults::INBOUND_CHUNKS,
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            read_buffers: defaults::READ_BUFFERS,
            register_buffers: defaults::REGISTER_BUFFERS,
            listen_backlog: defaults::LISTEN_BACKLOG,
            fastopen_qlen: defaults::FASTOPEN_QLEN,
            resume_queue: defaults::RESUME_QUEUE,
            handoff_retry: Duration::from_millis(defaults::HANDOFF_RETRY_MS),
            accept_backoff: Duration::from_millis(defaults::ACCEPT_BACKOFF_MS),
            fastopen_sysctl: PathBuf::from(defaults::FASTOPEN_SYSCTL),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `URING_SQ_ENTRIES`, `URING_CQ_ENTRIES`
    /// - `URING_HANDOFF_CAPACITY`
    /// - `URING_INBOUND_CHUNKS`
    /// - `URING_READ_BUFFER_SIZE`, `URING_READ_BUFFERS`
    /// - `URING_REGISTER_BUFFERS` (0/1)
    /// - `URING_LISTEN_BACKLOG`
    /// - `URING_FASTOPEN_QLEN`
    /// - `URING_RESUME_QUEUE`
    /// - `URING_ACCEPT_BACKOFF_MS`
    pub fn from_env() -> Self {
        Self {
            sq_entries: env_get("URING_SQ_ENTRIES", defaults::SQ_ENTRIES),
            cq_entries: env_get_opt("URING_CQ_ENTRIES"),
            handoff_capacity: env_get("URING_HANDOFF_CAPACITY", defaults::HANDOFF_CAPACITY),
            inbound_chunks: env_get("URING_INBOUND_CHUNKS", defaults::INBOUND_CHUNKS),
            read_buffer_size: env_get("URING_READ_BUFFER_SIZE", defaults::READ_BUFFER_SIZE),
            read_buffers: env_get("URING_READ_BUFFERS", defaults::READ_BUFFERS),
            register_buffers: env_get_bool("URING_REGISTER_BUFFERS", defaults::REGISTER_BUFFERS),
            listen_backlog: env_get("URING_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            fastopen_qlen: env_get("URING_FASTOPEN_QLEN", defaults::FASTOPEN_QLEN),
            resume_queue: env_get("URING_RESUME_QUEUE", defaults::RESUME_QUEUE),
            accept_backoff: Duration::from_millis(env_get(
                "URING_ACCEPT_BACKOFF_MS",
                defaults::ACCEPT_BACKOFF_MS,
            )),
            ..Self::new()
        }
    }

    // Builder methods

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn cq_entries(mut self, n: u32) -> Self {
        self.cq_entries = Some(n);
        self
    }

    pub fn handoff_capacity(mut self, n: usize) -> Self {
        self.handoff_capacity = n;
        self
    }

    pub fn inbound_chunks(mut self, n: usize) -> Self {
        self.inbound_chunks = n;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn read_buffers(mut self, n: usize) -> Self {
        self.read_buffers = n;
        self
    }

    pub fn register_buffers(mut self, enable: bool) -> Self {
        self.register_buffers = enable;
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    pub fn fastopen_qlen(mut self, n: i32) -> Self {
        self.fastopen_qlen = n;
        self
    }

    pub fn resume_queue(mut self, n: usize) -> Self {
        self.resume_queue = n;
        self
    }

    pub fn handoff_retry(mut self, d: Duration) -> Self {
        self.handoff_retry = d;
        self
    }

    pub fn accept_backoff(mut self, d: Duration) -> Self {
        self.accept_backoff = d;
        self
    }

    pub fn fastopen_sysctl(mut self, path: impl Into<PathBuf>) -> Self {
        self.fastopen_sysctl = path.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(Error::InvalidConfig("sq_entries must be a power of two"));
        }
        if self.handoff_capacity == 0 {
            return Err(Error::InvalidConfig("handoff_capacity must be > 0"));
        }
        if self.inbound_chunks == 0 {
            return Err(Error::InvalidConfig("inbound_chunks must be > 0"));
        }
        if self.read_buffer_size == 0 || self.read_buffer_size > u32::MAX as usize {
            return Err(Error::InvalidConfig("read_buffer_size out of range"));
        }
        if self.read_buffers == 0 || self.read_buffers >= u16::MAX as usize {
            return Err(Error::InvalidConfig("read_buffers must be in 1..65535"));
        }
        if self.resume_queue == 0 {
            return Err(Error::InvalidConfig("resume_queue must be > 0"));
        }
        if self.handoff_retry.is_zero() {
            return Err(Error::InvalidConfig("handoff_retry must be > 0"));
        }
        Ok(())
    }
}
