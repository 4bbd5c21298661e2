//! Listener errors.

use uring_core::error::RingError;

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    /// Datagram networks never reach accept.
    #[error("network {0:?} does not accept connections")]
    UnsupportedNetwork(String),

    #[error("resolve {addr:?}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no {network} address for {addr:?}")]
    NoAddress { network: &'static str, addr: String },

    /// A socket call during setup failed.
    #[error("{op}: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("tcp fast open unavailable: {0}")]
    FastOpenUnavailable(String),

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("spawn loop thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("listener closed")]
    Closed,

    /// The completion loop died on an unrecoverable `io_uring_enter` error.
    #[error("completion loop failed: {}", io::Error::from_raw_os_error(*.0))]
    LoopFailed(i32),
}

impl Error {
    pub(crate) fn socket(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Socket { op, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
