//! Ring handle abstraction (the submission side plus the kernel-enter call).
//!
//! A `RingHandle` is what the reactor loop drives: it hands out correlation
//! ids, accepts `SubmissionRequest`s, kicks the kernel, and exposes its
//! completion ring for the consumer to drain.
//!
//! # Implementors
//!
//! - `RawRing` (default): a real io_uring instance. `enter()` is
//!   `io_uring_enter(pending, min_complete, flags)` and may block.
//!
//! - `HeapRing`: records submissions in memory; completions are injected
//!   by test code. `enter()` never blocks.
//!
//! **Contract:** a handle is driven by exactly one thread. Methods take
//! `&mut self`; sharing across threads needs external serialization.

use crate::completion::CompletionRing;
use crate::entry::{CorrId, SubmissionRequest};
use crate::error::Result;

/// Flags for `RingHandle::enter` (`IORING_ENTER_*`).
pub mod enter_flags {
    pub const GETEVENTS: u32 = 1 << 0;
}

pub trait RingHandle {
    type Completions: CompletionRing;

    /// A fresh correlation id. Never `CorrId::NONE`, never repeated.
    fn id(&mut self) -> CorrId;

    /// Write one request into the submission ring and commit it.
    ///
    /// Committed requests become visible to the kernel on the next
    /// `enter()`. Returns `Err(RingFull)` if no slot can be freed.
    fn submit(&mut self, req: &SubmissionRequest) -> Result<()>;

    /// Submit everything committed so far and, with `GETEVENTS`, wait for
    /// at least `min_complete` completions.
    ///
    /// Returns the number of requests consumed by the kernel.
    fn enter(&mut self, min_complete: u32, flags: u32) -> Result<u32>;

    /// Requests committed but not yet handed to the kernel.
    fn pending(&self) -> u32;

    /// The completion side of this ring.
    fn completions(&self) -> &Self::Completions;
}
