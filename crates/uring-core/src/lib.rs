//! # uring-core: shared vocabulary for the io_uring listener
//!
//! This crate defines the types every other crate in the workspace speaks:
//! what goes into the submission ring, what comes back out of the
//! completion ring, and the trait boundaries around the ring itself.
//!
//! Nothing here touches the kernel. Concrete rings live in `uring-module`;
//! the listener and its state machine live in `uring-net`.
//!
//! ## Layers
//!
//! ```text
//! uring-net      Listener / Connection / reactor loop / state machine
//!     │
//! uring-module   RawRing (kernel)   HeapRing (scripted)   CqConsumer
//!     │
//! uring-core     CorrId  SubmissionRequest  CompletionRecord
//!                RingHandle  CompletionRing  BufferProvider
//! ```

pub mod entry;
pub mod completion;
pub mod ring;
pub mod buffer;
pub mod error;
pub mod env;
