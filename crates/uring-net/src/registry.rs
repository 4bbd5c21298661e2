//! Operation registry: correlation id → the operation that is waiting on it.
//!
//! Owned and mutated only by the loop thread, so it is a plain `HashMap`.
//! Every entry stands for exactly one request the kernel still owes a
//! completion for. Re-arming an operation removes its entry and registers
//! a new one under a fresh id in the same step as the submission.

use uring_core::entry::CorrId;

use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// One outstanding operation. `R` is the role the loop assigns it.
#[derive(Debug)]
pub struct OperationEntry<R> {
    pub fd: RawFd,
    pub role: R,
    pub corr_id: CorrId,
}

#[derive(Debug)]
pub struct OperationRegistry<R> {
    ops: HashMap<CorrId, OperationEntry<R>>,
}

impl<R> Default for OperationRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> OperationRegistry<R> {
    pub fn new() -> Self {
        Self { ops: HashMap::new() }
    }

    /// Insert `entry` under its own id. Returns an entry that was already
    /// registered under that id, which would mean an id was reused.
    pub fn register(&mut self, entry: OperationEntry<R>) -> Option<OperationEntry<R>> {
        let prev = self.ops.insert(entry.corr_id, entry);
        debug_assert!(prev.is_none(), "correlation id registered twice");
        prev
    }

    /// Look an operation up without retiring it. Completions go through
    /// `remove` instead, since a completed operation is never outstanding.
    pub fn resolve(&self, id: CorrId) -> Option<&OperationEntry<R>> {
        self.ops.get(&id)
    }

    pub fn remove(&mut self, id: CorrId) -> Option<OperationEntry<R>> {
        self.ops.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Outstanding operations on `fd`.
    pub fn count_fd(&self, fd: RawFd) -> usize {
        self.ops.values().filter(|e| e.fd == fd).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationEntry<R>> {
        self.ops.values()
    }

    /// Take every entry, leaving the registry empty.
    pub fn drain(&mut self) -> impl Iterator<Item = OperationEntry<R>> + '_ {
        self.ops.drain().map(|(_, e)| e)
    }
}
