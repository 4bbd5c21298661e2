//! `CqConsumer`: drains a `CompletionRing` in order, exactly once.
//!
//! One drain:
//!
//! 1. acquire-load `head` and `tail`; `ready = tail - head` (wrapping)
//! 2. for each index in `[head, head + ready)`: copy the slot out, mark it
//!    consumed, hand it to the dispatcher
//! 3. release-store `head + ready` once for the whole batch
//!
//! The head is never moved past a slot that has not been dispatched, so the
//! kernel cannot reuse a slot while its record is still being looked at.
//! Entries the producer publishes while the batch runs are picked up by
//! the next drain.

use uring_core::completion::CompletionRing;
use uring_core::entry::{comp_flags, CompletionRecord};
use uring_core::ring::RingHandle;

use std::sync::atomic::Ordering;

/// Counters for one consumer, across all drains.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    /// Non-empty drains.
    pub batches: u64,
    /// Records dispatched.
    pub records: u64,
    /// Largest single batch seen.
    pub max_batch: u32,
}

#[derive(Debug, Default)]
pub struct CqConsumer {
    stats: DrainStats,
}

impl CqConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DrainStats {
        self.stats
    }

    /// Drain every ready completion of `ring`, calling `dispatch` for each
    /// in ring order. `dispatch` gets the ring back so it can submit
    /// follow-up requests; those never land in the completion ring being
    /// drained, so the batch bounds are unaffected.
    ///
    /// Returns the number of records dispatched.
    pub fn drain<R, F>(&mut self, ring: &mut R, mut dispatch: F) -> u32
    where
        R: RingHandle,
        F: FnMut(&mut R, CompletionRecord),
    {
        let (head, ready) = {
            let cq = ring.completions();
            let head = cq.head().load(Ordering::Acquire);
            let tail = cq.tail().load(Ordering::Acquire);
            (head, tail.wrapping_sub(head))
        };
        if ready == 0 {
            return 0;
        }
        debug_assert!(ready <= ring.completions().ring_entries());

        for i in 0..ready {
            let rec = unsafe { take_slot(ring.completions(), head.wrapping_add(i)) };
            dispatch(ring, rec);
        }

        ring.completions()
            .head()
            .store(head.wrapping_add(ready), Ordering::Release);

        self.stats.batches += 1;
        self.stats.records += ready as u64;
        self.stats.max_batch = self.stats.max_batch.max(ready);
        ready
    }
}

/// Copy the record at `index` out and flag the slot consumed.
///
/// # Safety
/// `index` must lie in the ready range `[head, tail)` of `cq`.
#[inline]
unsafe fn take_slot<C: CompletionRing>(cq: &C, index: u32) -> CompletionRecord {
    let slot = cq.slot(index);
    let rec = std::ptr::read_volatile(slot);
    (*slot).flags |= comp_flags::CONSUMED;
    rec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap_ring::HeapRing;
    use uring_core::entry::{CorrId, SubmissionRequest};

    fn publish(ring: &HeapRing, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            assert!(ring.complete(CompletionRecord::new(CorrId(id), id as i32, 0)));
        }
    }

    #[test]
    fn empty_ring_is_a_no_op() {
        let mut ring = HeapRing::new();
        let mut consumer = CqConsumer::new();
        let n = consumer.drain(&mut ring, |_, _| panic!("nothing to dispatch"));
        assert_eq!(n, 0);
        assert_eq!(consumer.stats().batches, 0);
    }

    #[test]
    fn dispatches_each_once_in_order_and_advances_head_by_n() {
        let mut ring = HeapRing::with_capacity(16).unwrap();
        let mut consumer = CqConsumer::new();
        publish(&ring, 0..10);

        let before = ring.completions().head().load(Ordering::Relaxed);
        let mut seen = Vec::new();
        let n = consumer.drain(&mut ring, |_, rec| seen.push(rec.corr_id.0));

        assert_eq!(n, 10);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        let after = ring.completions().head().load(Ordering::Relaxed);
        assert_eq!(after.wrapping_sub(before), 10);

        // Second drain sees nothing new.
        assert_eq!(consumer.drain(&mut ring, |_, _| panic!("redispatch")), 0);
    }

    #[test]
    fn head_stays_until_batch_finishes() {
        let mut ring = HeapRing::with_capacity(8).unwrap();
        let mut consumer = CqConsumer::new();
        publish(&ring, 0..3);

        consumer.drain(&mut ring, |r, _| {
            assert_eq!(r.completions().head().load(Ordering::Acquire), 0);
        });
        assert_eq!(ring.completions().head().load(Ordering::Acquire), 3);
    }

    #[test]
    fn slots_are_marked_consumed() {
        let mut ring = HeapRing::with_capacity(4).unwrap();
        let mut consumer = CqConsumer::new();
        publish(&ring, 0..2);
        consumer.drain(&mut ring, |_, rec| {
            assert!(!rec.is_consumed(), "dispatcher sees the kernel's flags");
        });
        let cq = ring.completions();
        for i in 0..2 {
            assert!(unsafe { (*cq.slot(i)).is_consumed() });
        }
    }

    #[test]
    fn wraparound_at_u32_max() {
        let mut ring = HeapRing::with_capacity(8).unwrap();
        ring.completions().start_at(u32::MAX - 3);
        let mut consumer = CqConsumer::new();

        let mut seen = Vec::new();
        let mut next = 0u64;
        // Several rounds, each crossing slot boundaries and the u32 wrap.
        for round in 0..5 {
            let batch = 3 + round % 4;
            publish(&ring, next..next + batch);
            next += batch;
            consumer.drain(&mut ring, |_, rec| seen.push(rec.corr_id.0));
        }

        assert_eq!(seen, (0..next).collect::<Vec<_>>());
        let head = ring.completions().head().load(Ordering::Relaxed);
        assert_eq!(head, (u32::MAX - 3).wrapping_add(next as u32));
        assert_eq!(consumer.stats().records, next);
    }

    #[test]
    fn full_ring_drains_completely() {
        let mut ring = HeapRing::with_capacity(4).unwrap();
        let mut consumer = CqConsumer::new();
        for lap in 0..3u64 {
            publish(&ring, lap * 4..lap * 4 + 4);
            let mut seen = Vec::new();
            assert_eq!(consumer.drain(&mut ring, |_, rec| seen.push(rec.corr_id.0)), 4);
            assert_eq!(seen, (lap * 4..lap * 4 + 4).collect::<Vec<_>>());
        }
        assert_eq!(consumer.stats().max_batch, 4);
    }

    #[test]
    fn dispatch_can_submit() {
        let mut ring = HeapRing::new();
        let mut consumer = CqConsumer::new();
        publish(&ring, 0..3);
        consumer.drain(&mut ring, |r, rec| {
            let id = r.id();
            r.submit(&SubmissionRequest::poll_add(rec.corr_id.0 as i32, 1, id)).unwrap();
        });
        assert_eq!(ring.submitted().len(), 3);
        assert!(ring.completions().is_empty());
    }

    #[test]
    fn late_entries_wait_for_next_drain() {
        let mut ring = HeapRing::with_capacity(8).unwrap();
        let mut consumer = CqConsumer::new();
        publish(&ring, [1]);
        let mut seen = Vec::new();
        consumer.drain(&mut ring, |r, rec| {
            seen.push(rec.corr_id.0);
            // Producer publishes mid-batch.
            r.complete(CompletionRecord::new(CorrId(2), 0, 0));
        });
        assert_eq!(seen, [1]);
        consumer.drain(&mut ring, |_, rec| seen.push(rec.corr_id.0));
        assert_eq!(seen, [1, 2]);
    }
}
