//! `RawRing`: default `RingHandle` implementation over a kernel io_uring.
//!
//! Sets the ring up with `io_uring_setup(2)`, maps the SQ ring, CQ ring and
//! SQE array, and drives it with `io_uring_enter(2)`. No SQPOLL, no fixed
//! files. Registered buffers are optional (`register_buffers`).
//!
//! The CQ head/tail words are exposed as `AtomicU32` views straight into
//! the shared mapping so that `CqConsumer` can drain them.

use uring_core::completion::CompletionRing;
use uring_core::entry::{CompletionRecord, CorrId, SubmissionRequest};
use uring_core::error::{Errno, Result, RingError};
use uring_core::ring::RingHandle;

use crate::sys::{self, IoUringParams, IoUringSqe};

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

/// Configuration for RawRing.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Number of SQ entries. Must be power of 2.
    pub sq_entries: u32,
    /// Number of CQ entries. Defaults to 2 * sq_entries (kernel default).
    pub cq_entries: Option<u32>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            cq_entries: None,
        }
    }
}

/// One `mmap`ed region of the ring, unmapped on drop.
struct Mmap {
    ptr: *mut u8,
    len: usize,
}

impl Mmap {
    fn new(fd: RawFd, len: usize, offset: libc::off_t, region: &'static str) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = Errno(nix::errno::Errno::last() as i32);
            return Err(RingError::Mmap { region, errno });
        }
        Ok(Self { ptr: ptr as *mut u8, len })
    }

    /// Pointer `offset` bytes into the region.
    ///
    /// # Safety
    /// `offset` must come from the kernel's ring offsets for this region.
    unsafe fn at<T>(&self, offset: u32) -> *mut T {
        debug_assert!((offset as usize) < self.len);
        self.ptr.add(offset as usize) as *mut T
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Submission side: the kernel reads from `head`, we write `tail`.
struct RawSq {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    array: *mut u32,
    sqes: *mut IoUringSqe,
    /// Our copy of the tail; published on every commit.
    local_tail: u32,
}

impl RawSq {
    fn kernel_head(&self) -> u32 {
        unsafe { (*self.head).load(Ordering::Acquire) }
    }

    fn is_full(&self) -> bool {
        self.local_tail.wrapping_sub(self.kernel_head()) >= self.ring_entries
    }
}

/// Completion side of a `RawRing`. The kernel writes `tail` and the CQE
/// slots; the consumer writes `head`.
pub struct RawCq {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    overflow: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    cqes: *mut CompletionRecord,
}

impl CompletionRing for RawCq {
    #[inline]
    fn head(&self) -> &AtomicU32 {
        unsafe { &*self.head }
    }

    #[inline]
    fn tail(&self) -> &AtomicU32 {
        unsafe { &*self.tail }
    }

    #[inline]
    fn ring_mask(&self) -> u32 {
        self.ring_mask
    }

    #[inline]
    fn ring_entries(&self) -> u32 {
        self.ring_entries
    }

    #[inline]
    fn slot(&self, index: u32) -> *mut CompletionRecord {
        unsafe { self.cqes.add((index & self.ring_mask) as usize) }
    }

    /// The kernel's `cq.overflow` counter. Without `IORING_FEAT_NODROP`
    /// it counts completions lost for good.
    fn overflow(&self) -> u32 {
        unsafe { (*self.overflow).load(Ordering::Acquire) }
    }
}

/// A request slot claimed in the SQ. Nothing is visible to the kernel
/// until `commit()`; dropping the slot without committing abandons it.
pub struct SubmitSlot<'a> {
    ring: &'a mut RawRing,
    index: u32,
}

impl SubmitSlot<'_> {
    /// The SQE to fill in. Starts zeroed.
    pub fn sqe(&mut self) -> &mut IoUringSqe {
        unsafe { &mut *self.ring.sq.sqes.add(self.index as usize) }
    }

    /// Publish the entry: link it into the SQ array and release-store the
    /// new tail.
    pub fn commit(self) {
        let sq = &mut self.ring.sq;
        unsafe {
            *sq.array.add(self.index as usize) = self.index;
        }
        sq.local_tail = sq.local_tail.wrapping_add(1);
        unsafe {
            (*sq.tail).store(sq.local_tail, Ordering::Release);
        }
    }
}

/// Default io_uring ring.
///
/// Owned and driven by one thread (see `RingHandle`). The mappings are
/// released before the ring fd is closed.
pub struct RawRing {
    sq: RawSq,
    cq: RawCq,
    next_id: u64,
    features: u32,
    maps: Vec<Mmap>,
    fd: OwnedFd,
}

// Safety: the mapped regions are plain process memory shared with the
// kernel. A RawRing is moved to, then driven by, a single thread.
unsafe impl Send for RawRing {}

impl RawRing {
    pub fn new(config: &RingConfig) -> Result<Self> {
        let entries = config.sq_entries;
        if entries == 0 || !entries.is_power_of_two() || entries > sys::IORING_MAX_ENTRIES {
            return Err(RingError::InvalidSize(entries));
        }

        let mut params = IoUringParams::default();
        params.flags = sys::IORING_SETUP_CLAMP;
        if let Some(cq) = config.cq_entries {
            params.flags |= sys::IORING_SETUP_CQSIZE;
            params.cq_entries = cq;
        }

        let raw = unsafe { sys::io_uring_setup(entries, &mut params) }
            .map_err(|e| RingError::Setup(Errno(e as i32)))?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let sq_len = params.sq_off.array as usize
            + params.sq_entries as usize * std::mem::size_of::<u32>();
        let cq_len = params.cq_off.cqes as usize
            + params.cq_entries as usize * std::mem::size_of::<CompletionRecord>();
        let sqes_len = params.sq_entries as usize * std::mem::size_of::<IoUringSqe>();

        let mut maps = Vec::with_capacity(3);
        if params.features & sys::IORING_FEAT_SINGLE_MMAP != 0 {
            maps.push(Mmap::new(raw, sq_len.max(cq_len), sys::IORING_OFF_SQ_RING, "sq/cq ring")?);
        } else {
            maps.push(Mmap::new(raw, sq_len, sys::IORING_OFF_SQ_RING, "sq ring")?);
            maps.push(Mmap::new(raw, cq_len, sys::IORING_OFF_CQ_RING, "cq ring")?);
        }
        maps.push(Mmap::new(raw, sqes_len, sys::IORING_OFF_SQES, "sqes")?);

        let sq_map = &maps[0];
        let cq_map = &maps[maps.len() - 2];
        let sqe_map = &maps[maps.len() - 1];

        let (sq, cq) = unsafe {
            let so = &params.sq_off;
            let co = &params.cq_off;
            let sq_tail = sq_map.at::<AtomicU32>(so.tail);
            let sq = RawSq {
                head: sq_map.at(so.head),
                tail: sq_tail,
                ring_mask: *sq_map.at::<u32>(so.ring_mask),
                ring_entries: *sq_map.at::<u32>(so.ring_entries),
                array: sq_map.at(so.array),
                sqes: sqe_map.ptr as *mut IoUringSqe,
                local_tail: (*sq_tail).load(Ordering::Acquire),
            };
            let cq = RawCq {
                head: cq_map.at(co.head),
                tail: cq_map.at(co.tail),
                overflow: cq_map.at(co.overflow),
                ring_mask: *cq_map.at::<u32>(co.ring_mask),
                ring_entries: *cq_map.at::<u32>(co.ring_entries),
                cqes: cq_map.at(co.cqes),
            };
            (sq, cq)
        };

        tracing::debug!(
            fd = raw,
            sq_entries = sq.ring_entries,
            cq_entries = cq.ring_entries,
            nodrop = params.features & sys::IORING_FEAT_NODROP != 0,
            "io_uring ready"
        );

        Ok(Self {
            sq,
            cq,
            next_id: 0,
            features: params.features,
            maps,
            fd,
        })
    }

    /// Claim the next SQ slot. `None` when the SQ is full.
    pub fn submit_entry(&mut self) -> Option<SubmitSlot<'_>> {
        if self.sq.is_full() {
            return None;
        }
        let index = self.sq.local_tail & self.sq.ring_mask;
        unsafe {
            *self.sq.sqes.add(index as usize) = IoUringSqe::default();
        }
        Some(SubmitSlot { ring: self, index })
    }

    /// Register a set of buffers for `READ_FIXED`.
    pub fn register_buffers(&mut self, iovecs: &[libc::iovec]) -> Result<()> {
        unsafe {
            sys::io_uring_register(
                self.fd.as_raw_fd(),
                sys::IORING_REGISTER_BUFFERS,
                iovecs.as_ptr() as *const libc::c_void,
                iovecs.len() as u32,
            )
        }
        .map_err(|e| RingError::Register(Errno(e as i32)))
    }

    /// Whether the kernel holds back completions on a full CQ instead of
    /// dropping them (`IORING_FEAT_NODROP`).
    pub fn keeps_overflow(&self) -> bool {
        self.features & sys::IORING_FEAT_NODROP != 0
    }

    /// Get the io_uring fd.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn write_sqe(slot: &mut SubmitSlot<'_>, req: &SubmissionRequest) {
        let sqe = slot.sqe();
        sqe.opcode = req.opcode;
        sqe.fd = req.fd;
        sqe.op_flags = req.op_flags;
        sqe.addr = req.addr;
        sqe.len = req.len;
        sqe.buf_index = req.buf_index;
        sqe.user_data = req.corr_id.0;
    }
}

impl RingHandle for RawRing {
    type Completions = RawCq;

    fn id(&mut self) -> CorrId {
        let id = CorrId(self.next_id);
        self.next_id += 1;
        if self.next_id == CorrId::NONE.0 {
            self.next_id = 0;
        }
        id
    }

    fn submit(&mut self, req: &SubmissionRequest) -> Result<()> {
        if self.sq.is_full() {
            // Hand what is queued to the kernel to free slots.
            self.enter(0, 0)?;
        }
        let mut slot = self.submit_entry().ok_or(RingError::RingFull)?;
        Self::write_sqe(&mut slot, req);
        slot.commit();
        Ok(())
    }

    fn enter(&mut self, min_complete: u32, flags: u32) -> Result<u32> {
        let to_submit = self.pending();
        unsafe { sys::io_uring_enter(self.fd.as_raw_fd(), to_submit, min_complete, flags) }
            .map_err(|e| RingError::Enter(Errno(e as i32)))
    }

    fn pending(&self) -> u32 {
        self.sq.local_tail.wrapping_sub(self.sq.kernel_head())
    }

    fn completions(&self) -> &RawCq {
        &self.cq
    }
}
