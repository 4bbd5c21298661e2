//! `HeapRing`: in-process `RingHandle` whose kernel is the caller.
//!
//! Submissions are recorded in a `Vec`; completions are published into a
//! heap-allocated CQ by `complete()`, with the same head/tail protocol the
//! kernel uses. Used by unit tests and benches to drive the consumer and
//! the state machine without io_uring.

use uring_core::completion::CompletionRing;
use uring_core::entry::{op, CompletionRecord, CorrId, SubmissionRequest};
use uring_core::error::{Result, RingError};
use uring_core::ring::RingHandle;

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

/// Heap-backed completion ring.
pub struct HeapCq {
    head: AtomicU32,
    tail: AtomicU32,
    overflow: AtomicU32,
    mask: u32,
    slots: Box<[UnsafeCell<CompletionRecord>]>,
}

impl HeapCq {
    pub fn new(entries: u32) -> Result<Self> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(RingError::InvalidSize(entries));
        }
        let slots = (0..entries)
            .map(|_| UnsafeCell::new(CompletionRecord::new(CorrId::NONE, 0, 0)))
            .collect();
        Ok(Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            overflow: AtomicU32::new(0),
            mask: entries - 1,
            slots,
        })
    }

    /// Move both indices to `index`, e.g. just below `u32::MAX` to
    /// exercise wraparound. Only valid while the ring is empty.
    pub fn start_at(&self, index: u32) {
        debug_assert_eq!(self.len(), 0);
        self.head.store(index, Ordering::Relaxed);
        self.tail.store(index, Ordering::Relaxed);
    }

    /// Publish one completion. `false` if the ring is full.
    pub fn complete(&self, rec: CompletionRecord) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.ring_entries() {
            return false;
        }
        unsafe {
            std::ptr::write_volatile(self.slot(tail), rec);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Lose a completion the way a kernel without `IORING_FEAT_NODROP`
    /// does on a full CQ: nothing is published, the overflow counter grows.
    pub fn drop_completion(&self) {
        self.overflow.fetch_add(1, Ordering::Release);
    }

    /// Completions published and not yet consumed.
    pub fn len(&self) -> u32 {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Safety: single producer (test code) and single consumer, synchronized
// through the head/tail atomics.
unsafe impl Sync for HeapCq {}
unsafe impl Send for HeapCq {}

impl CompletionRing for HeapCq {
    fn head(&self) -> &AtomicU32 {
        &self.head
    }

    fn tail(&self) -> &AtomicU32 {
        &self.tail
    }

    fn ring_mask(&self) -> u32 {
        self.mask
    }

    fn ring_entries(&self) -> u32 {
        self.mask + 1
    }

    fn slot(&self, index: u32) -> *mut CompletionRecord {
        self.slots[(index & self.mask) as usize].get()
    }

    fn overflow(&self) -> u32 {
        self.overflow.load(Ordering::Acquire)
    }
}

/// Scripted ring handle.
pub struct HeapRing {
    cq: HeapCq,
    submitted: Vec<SubmissionRequest>,
    flushed: usize,
    next_id: u64,
    enters: u64,
    /// Returned by upcoming `enter()` calls, oldest first.
    enter_errors: VecDeque<RingError>,
}

impl HeapRing {
    /// A ring with a 256-entry CQ.
    pub fn new() -> Self {
        Self::with_capacity(256).unwrap_or_else(|_| unreachable!())
    }

    pub fn with_capacity(cq_entries: u32) -> Result<Self> {
        Ok(Self {
            cq: HeapCq::new(cq_entries)?,
            submitted: Vec::new(),
            flushed: 0,
            next_id: 0,
            enters: 0,
            enter_errors: VecDeque::new(),
        })
    }

    /// Publish a completion as the kernel would.
    pub fn complete(&self, rec: CompletionRecord) -> bool {
        self.cq.complete(rec)
    }

    /// Every request submitted so far, oldest first.
    pub fn submitted(&self) -> &[SubmissionRequest] {
        &self.submitted
    }

    /// Drain the submission log.
    pub fn take_submitted(&mut self) -> Vec<SubmissionRequest> {
        self.flushed = 0;
        std::mem::take(&mut self.submitted)
    }

    /// Make the next `enter()` fail with `err` without submitting
    /// anything. Queued errors are returned one per call.
    pub fn fail_next_enter(&mut self, err: RingError) {
        self.enter_errors.push_back(err);
    }

    /// Number of `enter()` calls.
    pub fn enters(&self) -> u64 {
        self.enters
    }

    /// Complete a read request: copy `data` into its buffer and publish a
    /// completion carrying `data.len()`.
    ///
    /// # Safety
    /// `req.addr` must point at a live buffer of at least `req.len` bytes
    /// that nothing else is touching.
    pub unsafe fn deliver_read(&self, req: &SubmissionRequest, data: &[u8]) -> bool {
        debug_assert!(matches!(req.opcode, op::READ_FIXED | op::RECV));
        let n = data.len().min(req.len as usize);
        std::ptr::copy_nonoverlapping(data.as_ptr(), req.addr as *mut u8, n);
        self.complete(CompletionRecord::new(req.corr_id, n as i32, 0))
    }
}

impl Default for HeapRing {
    fn default() -> Self {
        Self::new()
    }
}

impl RingHandle for HeapRing {
    type Completions = HeapCq;

    fn id(&mut self) -> CorrId {
        let id = CorrId(self.next_id);
        self.next_id += 1;
        id
    }

    fn submit(&mut self, req: &SubmissionRequest) -> Result<()> {
        self.submitted.push(*req);
        Ok(())
    }

    fn enter(&mut self, _min_complete: u32, _flags: u32) -> Result<u32> {
        self.enters += 1;
        if let Some(err) = self.enter_errors.pop_front() {
            return Err(err);
        }
        let n = self.submitted.len() - self.flushed;
        self.flushed = self.submitted.len();
        Ok(n as u32)
    }

    fn pending(&self) -> u32 {
        (self.submitted.len() - self.flushed) as u32
    }

    fn completions(&self) -> &HeapCq {
        &self.cq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uring_core::error::Errno;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(HeapCq::new(0).is_err());
        assert!(HeapCq::new(6).is_err());
        assert!(HeapCq::new(8).is_ok());
    }

    #[test]
    fn complete_until_full() {
        let cq = HeapCq::new(4).unwrap();
        for i in 0..4 {
            assert!(cq.complete(CompletionRecord::new(CorrId(i), 0, 0)));
        }
        assert!(!cq.complete(CompletionRecord::new(CorrId(9), 0, 0)));
        assert_eq!(cq.len(), 4);
    }

    #[test]
    fn submissions_recorded_and_flushed() {
        let mut ring = HeapRing::new();
        let id = ring.id();
        ring.submit(&SubmissionRequest::nop(id)).unwrap();
        assert_eq!(ring.pending(), 1);
        assert_eq!(ring.enter(0, 0).unwrap(), 1);
        assert_eq!(ring.pending(), 0);
        assert_eq!(ring.submitted().len(), 1);
        assert_eq!(ring.take_submitted()[0].corr_id, id);
        assert!(ring.submitted().is_empty());
    }

    #[test]
    fn injected_enter_errors_come_first() {
        let mut ring = HeapRing::new();
        let id = ring.id();
        ring.submit(&SubmissionRequest::nop(id)).unwrap();
        ring.fail_next_enter(RingError::Enter(Errno(libc::EINTR)));
        assert!(matches!(ring.enter(0, 0), Err(RingError::Enter(Errno(libc::EINTR)))));
        assert_eq!(ring.pending(), 1, "failed enter submits nothing");
        assert_eq!(ring.enter(0, 0).unwrap(), 1);
        assert_eq!(ring.enters(), 2);
    }

    #[test]
    fn dropped_completions_count_as_overflow() {
        let cq = HeapCq::new(2).unwrap();
        assert_eq!(cq.overflow(), 0);
        cq.drop_completion();
        assert_eq!(cq.overflow(), 1);
        assert!(cq.is_empty());
    }

    #[test]
    fn deliver_read_copies_payload() {
        let ring = HeapRing::new();
        let mut buf = vec![0u8; 8];
        let handle = uring_core::buffer::BufferHandle {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            buf_index: u16::MAX,
        };
        let req = SubmissionRequest::recv(3, &handle, CorrId(5));
        assert!(unsafe { ring.deliver_read(&req, b"hey") });
        assert_eq!(&buf[..3], b"hey");
        let cq = ring.completions();
        let rec = unsafe { *cq.slot(cq.head().load(Ordering::Acquire)) };
        assert_eq!(rec, CompletionRecord::new(CorrId(5), 3, 0));
    }
}
