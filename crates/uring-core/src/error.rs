//! Ring error types.

use std::fmt;

/// Positive errno, displayed the way `std::io::Error` renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Ring is full, cannot submit.
    #[error("submission ring full")]
    RingFull,
    /// `io_uring_setup` failed.
    #[error("io_uring setup: {0}")]
    Setup(Errno),
    /// `io_uring_enter` failed.
    #[error("io_uring enter: {0}")]
    Enter(Errno),
    /// `io_uring_register` failed.
    #[error("io_uring register: {0}")]
    Register(Errno),
    /// Mapping one of the ring regions failed.
    #[error("mmap of {region}: {errno}")]
    Mmap { region: &'static str, errno: Errno },
    /// Ring size outside what the kernel accepts.
    #[error("invalid ring size {0} (power of two, 1..=32768)")]
    InvalidSize(u32),
}

impl RingError {
    /// The errno behind this error, if it came from the kernel.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Setup(e) | Self::Enter(e) | Self::Register(e) => Some(e.0),
            Self::Mmap { errno, .. } => Some(errno.0),
            Self::RingFull | Self::InvalidSize(_) => None,
        }
    }

    /// An `io_uring_enter` failure worth retrying after draining:
    /// interrupted by a signal, or completions backed up in overflow.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Enter(Errno(e)) if matches!(*e, libc::EINTR | libc::EAGAIN | libc::EBUSY))
    }

    /// The kernel does not offer io_uring here (not built in, or
    /// disabled by sysctl / seccomp).
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Setup(Errno(e)) if matches!(*e, libc::ENOSYS | libc::EPERM | libc::EACCES))
    }
}

pub type Result<T> = std::result::Result<T, RingError>;
