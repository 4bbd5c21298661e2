//! Buffer management abstraction.
//!
//! A `BufferProvider` manages the read buffers handed to the kernel.
//!
//! # Implementors
//!
//! - `FixedBuffers` (default): a fixed pool carved from one allocation.
//!   When registered with the ring (`IORING_REGISTER_BUFFERS`) reads use
//!   `IORING_OP_READ_FIXED`; otherwise plain `IORING_OP_RECV`.

/// Handle to a buffer managed by a `BufferProvider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    /// Pointer to the buffer data (userspace address).
    pub ptr: *mut u8,
    /// Length of the buffer in bytes.
    pub len: usize,
    /// Index into the registered buffer table. `u16::MAX` when the
    /// provider is not registered with a ring.
    pub buf_index: u16,
}

// Safety: buffer handles are just pointers + metadata
unsafe impl Send for BufferHandle {}
unsafe impl Sync for BufferHandle {}

impl BufferHandle {
    /// View the first `n` bytes.
    ///
    /// # Safety
    /// The buffer must not be in flight with the kernel, and `n <= len`.
    pub unsafe fn filled(&self, n: usize) -> &[u8] {
        debug_assert!(n <= self.len);
        std::slice::from_raw_parts(self.ptr, n)
    }
}

/// Manages read buffer lifecycle.
///
/// **Contract:**
/// - `acquire()` returns a buffer suitable for one read.
/// - `release()` returns it to the pool once the completion arrived.
/// - Buffers stay valid for the duration of the I/O operation.
pub trait BufferProvider {
    /// Take a free buffer. `None` when the pool is exhausted.
    fn acquire(&mut self) -> Option<BufferHandle>;

    /// Return a previously acquired buffer to the pool.
    fn release(&mut self, handle: BufferHandle);

    /// Whether buffers are registered with the ring (use `READ_FIXED`).
    fn is_registered(&self) -> bool {
        false
    }

    /// Total number of buffers in the pool.
    fn pool_size(&self) -> usize;

    /// Number of buffers currently in use.
    fn in_use(&self) -> usize;
}
