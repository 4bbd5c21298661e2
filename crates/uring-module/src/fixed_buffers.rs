//! `FixedBuffers`: default `BufferProvider` implementation.
//!
//! A fixed pool of equal-sized read buffers carved from one page-aligned
//! allocation. The whole pool can be registered with a ring
//! (`IORING_REGISTER_BUFFERS`, see `RawRing::register_buffers`), after
//! which reads go through `READ_FIXED` with the buffer's index.
//!
//! The pool is owned by the reactor thread; acquire/release take `&mut`.

use uring_core::buffer::{BufferHandle, BufferProvider};

use std::alloc::{self, Layout};

const ALIGN: usize = 4096;

pub struct FixedBuffers {
    base: *mut u8,
    layout: Layout,
    buf_size: usize,
    count: usize,
    free: Vec<u16>,
    registered: bool,
}

// Safety: the allocation is owned by this value; it is only ever touched by
// the thread that owns the pool and by the kernel for in-flight reads.
unsafe impl Send for FixedBuffers {}

impl FixedBuffers {
    /// `count` buffers of `buf_size` bytes. `None` if the sizes are zero,
    /// overflow, or exceed the registered-buffer index range.
    pub fn new(count: usize, buf_size: usize) -> Option<Self> {
        if count == 0 || buf_size == 0 || count >= u16::MAX as usize {
            return None;
        }
        let total = count.checked_mul(buf_size)?;
        let layout = Layout::from_size_align(total, ALIGN).ok()?;
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return None;
        }
        // Lowest index handed out first.
        let free = (0..count as u16).rev().collect();
        Some(Self {
            base,
            layout,
            buf_size,
            count,
            free,
            registered: false,
        })
    }

    /// One `iovec` per buffer, in index order, for registration.
    pub fn iovecs(&self) -> Vec<libc::iovec> {
        (0..self.count)
            .map(|i| libc::iovec {
                iov_base: unsafe { self.base.add(i * self.buf_size) } as *mut libc::c_void,
                iov_len: self.buf_size,
            })
            .collect()
    }

    /// Record that the kernel accepted `iovecs()` as its buffer table.
    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    fn index_of(&self, handle: &BufferHandle) -> Option<u16> {
        let off = (handle.ptr as usize).checked_sub(self.base as usize)?;
        let idx = off / self.buf_size;
        (off % self.buf_size == 0 && idx < self.count).then_some(idx as u16)
    }
}

impl BufferProvider for FixedBuffers {
    fn acquire(&mut self) -> Option<BufferHandle> {
        let idx = self.free.pop()?;
        Some(BufferHandle {
            ptr: unsafe { self.base.add(idx as usize * self.buf_size) },
            len: self.buf_size,
            buf_index: if self.registered { idx } else { u16::MAX },
        })
    }

    fn release(&mut self, handle: BufferHandle) {
        match self.index_of(&handle) {
            Some(idx) => {
                debug_assert!(!self.free.contains(&idx), "double release of buffer {idx}");
                self.free.push(idx);
            }
            None => tracing::warn!(ptr = ?handle.ptr, "release of foreign buffer ignored"),
        }
    }

    fn is_registered(&self) -> bool {
        self.registered
    }

    fn pool_size(&self) -> usize {
        self.count
    }

    fn in_use(&self) -> usize {
        self.count - self.free.len()
    }
}

impl Drop for FixedBuffers {
    fn drop(&mut self) {
        let busy = self.in_use();
        if busy > 0 {
            // The kernel may still write into these.
            tracing::warn!(busy, "leaking read buffer pool with reads in flight");
            return;
        }
        unsafe { alloc::dealloc(self.base, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(FixedBuffers::new(0, 4096).is_none());
        assert!(FixedBuffers::new(4, 0).is_none());
        assert!(FixedBuffers::new(70_000, 16).is_none());
    }

    #[test]
    fn acquire_until_exhausted_then_release() {
        let mut pool = FixedBuffers::new(3, 64).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 3);
        assert_ne!(a.ptr, b.ptr);
        assert_eq!(unsafe { c.ptr.offset_from(a.ptr) }, 128);

        pool.release(b);
        assert_eq!(pool.in_use(), 2);
        let again = pool.acquire().unwrap();
        assert_eq!(again.ptr, b.ptr);
        pool.release(a);
        pool.release(c);
        pool.release(again);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn registered_handles_carry_index() {
        let mut pool = FixedBuffers::new(2, 32).unwrap();
        let h = pool.acquire().unwrap();
        assert_eq!(h.buf_index, u16::MAX);
        pool.release(h);

        pool.mark_registered();
        assert!(pool.is_registered());
        let h0 = pool.acquire().unwrap();
        let h1 = pool.acquire().unwrap();
        assert_eq!((h0.buf_index, h1.buf_index), (0, 1));
        pool.release(h0);
        pool.release(h1);
    }

    #[test]
    fn iovecs_cover_pool() {
        let pool = FixedBuffers::new(4, 128).unwrap();
        let iov = pool.iovecs();
        assert_eq!(iov.len(), 4);
        assert!(iov.iter().all(|v| v.iov_len == 128));
        assert_eq!(iov[1].iov_base as usize - iov[0].iov_base as usize, 128);
        assert_eq!(iov[0].iov_base as usize % ALIGN, 0);
    }

    #[test]
    fn foreign_release_is_ignored() {
        let mut pool = FixedBuffers::new(2, 32).unwrap();
        let mut other = [0u8; 32];
        pool.release(BufferHandle { ptr: other.as_mut_ptr(), len: 32, buf_index: 0 });
        assert_eq!(pool.in_use(), 0);
        let h = pool.acquire().unwrap();
        assert_eq!(h.buf_index, u16::MAX);
        pool.release(h);
    }
}
