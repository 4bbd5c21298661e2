//! Completion ring abstraction.
//!
//! A `CompletionRing` is the consumer's view of a single-producer,
//! single-consumer circular buffer of `CompletionRecord`s: a fixed
//! power-of-two array of slots plus two free-running `u32` indices.
//!
//! ```text
//!        head (consumer writes)          tail (producer writes)
//!          │                               │
//!   ┌──┬──┬▼─┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──▼┬──┬──┬──┐
//!   │  │  │ r│ r│ r│ r│ r│ r│ r│ r│ r│ r│   │  │  │  │
//!   └──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴───┴──┴──┴──┘
//!          └──────── tail - head ready ──────┘
//! ```
//!
//! Slot for index `i` is `i & ring_mask()`. Ready entries are
//! `tail.wrapping_sub(head)`. The producer (the kernel, or a test harness
//! standing in for it) is the sole writer of `tail` and of slot contents;
//! the consumer is the sole writer of `head`.
//!
//! # Implementors
//!
//! - `RawRing`'s completion queue: `head`/`tail` point into the
//!   kernel-mapped CQ ring.
//! - `HeapRing`: an in-process ring whose producer is test code.

use crate::entry::CompletionRecord;

use std::sync::atomic::AtomicU32;

pub trait CompletionRing {
    /// Consumer index. Only the consumer stores to it.
    fn head(&self) -> &AtomicU32;

    /// Producer index. Only the producer stores to it.
    fn tail(&self) -> &AtomicU32;

    /// `ring_entries() - 1`.
    fn ring_mask(&self) -> u32;

    /// Number of slots (power of two).
    fn ring_entries(&self) -> u32;

    /// Raw pointer to the slot backing free-running index `index`.
    ///
    /// The pointer is valid for the lifetime of the ring. Reading or
    /// writing through it is only sound for indices in `[head, tail)`.
    fn slot(&self, index: u32) -> *mut CompletionRecord;

    /// Completions the producer dropped because the ring was full. Rings
    /// that never drop report 0.
    fn overflow(&self) -> u32 {
        0
    }
}
