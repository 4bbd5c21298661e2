//! # uring-module: ring implementations
//!
//! Concrete implementations for the `uring-core` traits.
//!
//! | Trait / role     | Impl           | Notes                                   |
//! |------------------|----------------|-----------------------------------------|
//! | RingHandle       | RawRing        | kernel io_uring via raw syscalls        |
//! | RingHandle       | HeapRing       | in-process, test code plays the kernel  |
//! | CompletionRing   | RawCq / HeapCq | CQ head/tail as `AtomicU32`             |
//! | CQ drain         | CqConsumer     | in-order, exactly-once, one head store  |
//! | BufferProvider   | FixedBuffers   | registrable fixed pool                  |
//! | loop wakeup      | EventFdWaker   | eventfd polled by the reactor           |

pub mod sys;
pub mod raw_ring;
pub mod heap_ring;
pub mod cq_consumer;
pub mod fixed_buffers;
pub mod eventfd_waker;
