//! # uring-net: socket listener on an io_uring completion loop
//!
//! One background thread per listener owns an io_uring instance. It keeps
//! a readiness poll armed on the listening socket, accepts every pending
//! connection when the poll fires, arms a poll on each new connection and
//! hands it to `Listener::accept()` callers through a bounded queue.
//! Accepted connections are read by the same loop; callers get blocking
//! `Read`/`Write` handles.
//!
//! ```rust,ignore
//! let listener = uring_net::listen("tcp", "127.0.0.1:0", &[])?;
//! let addr = listener.local_addr();
//! let mut conn = listener.accept()?;
//! ```
//!
//! | Module     | Role                                                  |
//! |------------|-------------------------------------------------------|
//! | `registry` | correlation id → outstanding operation                |
//! | `machine`  | per-role completion handling, accept-drain, re-arm    |
//! | `reactor`  | the loop: submit, enter, drain                        |
//! | `listener` | `listen` / `accept` / `close`                         |
//! | `conn`     | accepted connection, inbound queue, parking           |
//! | `socket`   | socket setup and address decoding                     |

pub mod config;
pub mod error;
pub mod registry;
pub mod socket;
pub mod stats;

mod conn;
mod listener;
mod machine;
mod reactor;

pub use config::ListenerConfig;
pub use conn::Connection;
pub use error::{Error, Result};
pub use listener::Listener;
pub use socket::{Addr, ListenOption, Network};
pub use stats::LoopStats;

/// Open a listener on `network` (`tcp`, `tcp4`, `tcp6`, `unix`) at
/// `address`, configured from the environment.
pub fn listen(network: &str, address: &str, options: &[ListenOption]) -> Result<Listener> {
    Listener::listen(network, address, options)
}
