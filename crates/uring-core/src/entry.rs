//! Submission and completion entry types.
//!
//! `CompletionRecord` mirrors the kernel's `struct io_uring_cqe` byte for
//! byte, so a completion slot can be read straight out of the mapped ring.
//! `SubmissionRequest` is the subset of `struct io_uring_sqe` this system
//! issues; ring implementations translate it into a full SQE.

use crate::buffer::BufferHandle;

/// Correlation ID, stored in the SQE's `user_data` and echoed back in the CQE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CorrId(pub u64);

impl CorrId {
    /// Never handed out by a ring; safe to use as a sentinel.
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for CorrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// io_uring opcodes used by this system (`IORING_OP_*`).
pub mod op {
    pub const NOP: u8 = 0;
    pub const READ_FIXED: u8 = 4;
    pub const POLL_ADD: u8 = 6;
    pub const POLL_REMOVE: u8 = 7;
    pub const TIMEOUT: u8 = 11;
    pub const RECV: u8 = 27;
}

/// Poll event bits (`POLL*` from `<poll.h>`), as carried in `poll32_events`.
pub mod poll {
    pub const POLLIN: u32 = 0x0001;
    pub const POLLHUP: u32 = 0x0010;
    pub const POLLRDHUP: u32 = 0x2000;
}

/// One request written into the submission ring.
///
/// Ownership of whatever `addr` points at passes to the kernel when the
/// request is committed and comes back with the matching completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub opcode: u8,
    /// Target descriptor.
    pub fd: i32,
    /// Opcode-specific flags: poll mask for `POLL_ADD`, msg flags for `RECV`.
    pub op_flags: u32,
    /// Buffer address for reads; zero otherwise.
    pub addr: u64,
    /// Buffer length for reads; zero otherwise.
    pub len: u32,
    /// Registered buffer index for `READ_FIXED`.
    pub buf_index: u16,
    pub corr_id: CorrId,
}

impl SubmissionRequest {
    /// Ask to be told when `fd` has any of `mask` pending. One-shot.
    pub fn poll_add(fd: i32, mask: u32, corr_id: CorrId) -> Self {
        Self {
            opcode: op::POLL_ADD,
            fd,
            op_flags: mask,
            addr: 0,
            len: 0,
            buf_index: 0,
            corr_id,
        }
    }

    /// Cancel the outstanding `POLL_ADD` submitted under `target`. The
    /// cancelled poll completes with `-ECANCELED`.
    pub fn poll_remove(target: CorrId, corr_id: CorrId) -> Self {
        Self {
            opcode: op::POLL_REMOVE,
            fd: -1,
            op_flags: 0,
            addr: target.0,
            len: 0,
            buf_index: 0,
            corr_id,
        }
    }

    /// Complete with `-ETIME` once `ts` has elapsed. `ts` must stay put
    /// until the completion arrives.
    pub fn timeout(ts: &Timespec, corr_id: CorrId) -> Self {
        Self {
            opcode: op::TIMEOUT,
            fd: -1,
            op_flags: 0,
            addr: ts as *const Timespec as u64,
            len: 1,
            buf_index: 0,
            corr_id,
        }
    }

    /// Read into a registered buffer.
    pub fn read_fixed(fd: i32, buf: &BufferHandle, corr_id: CorrId) -> Self {
        Self {
            opcode: op::READ_FIXED,
            fd,
            op_flags: 0,
            addr: buf.ptr as u64,
            len: buf.len as u32,
            buf_index: buf.buf_index,
            corr_id,
        }
    }

    /// Receive into a plain (unregistered) buffer.
    pub fn recv(fd: i32, buf: &BufferHandle, corr_id: CorrId) -> Self {
        Self {
            opcode: op::RECV,
            fd,
            op_flags: 0,
            addr: buf.ptr as u64,
            len: buf.len as u32,
            buf_index: 0,
            corr_id,
        }
    }

    pub fn nop(corr_id: CorrId) -> Self {
        Self {
            opcode: op::NOP,
            fd: -1,
            op_flags: 0,
            addr: 0,
            len: 0,
            buf_index: 0,
            corr_id,
        }
    }
}

/// `struct __kernel_timespec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl From<std::time::Duration> for Timespec {
    fn from(d: std::time::Duration) -> Self {
        Self {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i64,
        }
    }
}

/// One completion harvested from the completion ring.
///
/// Layout-identical to `struct io_uring_cqe` (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CompletionRecord {
    pub corr_id: CorrId,
    /// Operation result, or negative errno.
    pub result: i32,
    pub flags: u32,
}

/// Completion flags.
pub mod comp_flags {
    /// Set by the consumer once a slot has been dispatched. The kernel
    /// never sets this bit and overwrites it when the slot is reused.
    pub const CONSUMED: u32 = 1 << 31;
}

impl CompletionRecord {
    pub const fn new(corr_id: CorrId, result: i32, flags: u32) -> Self {
        Self { corr_id, result, flags }
    }

    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.flags & comp_flags::CONSUMED != 0
    }

    /// Negative results as a positive errno.
    #[inline]
    pub fn errno(&self) -> Option<i32> {
        (self.result < 0).then(|| -self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_record_matches_cqe_layout() {
        assert_eq!(std::mem::size_of::<CompletionRecord>(), 16);
        assert_eq!(std::mem::align_of::<CompletionRecord>(), 8);
    }

    #[test]
    fn errno_only_for_negative_results() {
        assert_eq!(CompletionRecord::new(CorrId(1), -11, 0).errno(), Some(11));
        assert_eq!(CompletionRecord::new(CorrId(1), 0, 0).errno(), None);
        assert_eq!(CompletionRecord::new(CorrId(1), 42, 0).errno(), None);
    }

    #[test]
    fn poll_add_carries_mask_and_id() {
        let req = SubmissionRequest::poll_add(7, poll::POLLIN, CorrId(3));
        assert_eq!(req.opcode, op::POLL_ADD);
        assert_eq!(req.fd, 7);
        assert_eq!(req.op_flags, poll::POLLIN);
        assert_eq!(req.corr_id, CorrId(3));
    }

    #[test]
    fn poll_remove_targets_user_data() {
        let req = SubmissionRequest::poll_remove(CorrId(41), CorrId(42));
        assert_eq!(req.opcode, op::POLL_REMOVE);
        assert_eq!(req.addr, 41);
        assert_eq!(req.corr_id, CorrId(42));
    }

    #[test]
    fn timeout_points_at_timespec() {
        let ts = Timespec::from(std::time::Duration::from_millis(1500));
        assert_eq!((ts.tv_sec, ts.tv_nsec), (1, 500_000_000));
        let req = SubmissionRequest::timeout(&ts, CorrId(9));
        assert_eq!(req.opcode, op::TIMEOUT);
        assert_eq!(req.addr, &ts as *const Timespec as u64);
        assert_eq!(req.len, 1);
    }

    #[test]
    fn none_sentinel() {
        assert!(CorrId::NONE.is_none());
        assert!(!CorrId(0).is_none());
    }
}
