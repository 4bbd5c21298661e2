//! `EventFdWaker`: wakes a reactor blocked in `io_uring_enter`.
//!
//! The reactor keeps a `POLL_ADD(POLLIN)` outstanding on the eventfd; any
//! thread calling `wake()` completes that poll. Multiple wakes before the
//! reactor drains coalesce into one (eventfd counter semantics).

use nix::errno::Errno;

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct EventFdWaker {
    fd: OwnedFd,
}

impl EventFdWaker {
    /// Create a new non-blocking, close-on-exec eventfd.
    pub fn create() -> nix::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        let fd = Errno::result(fd)?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Bump the counter. Safe from any thread.
    pub fn wake(&self) -> nix::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            Ok(_) => Ok(()),
            // Counter saturated: a wakeup is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reset the counter. Returns the number of wakes since the last drain.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_coalesce() {
        let w = EventFdWaker::create().unwrap();
        assert_eq!(w.drain(), 0);
        w.wake().unwrap();
        w.wake().unwrap();
        w.wake().unwrap();
        assert_eq!(w.drain(), 3);
        assert_eq!(w.drain(), 0);
    }

    #[test]
    fn wake_from_other_thread() {
        let w = std::sync::Arc::new(EventFdWaker::create().unwrap());
        let w2 = w.clone();
        std::thread::spawn(move || w2.wake().unwrap()).join().unwrap();
        assert_eq!(w.drain(), 1);
    }
}
