//! Echo server on `uring_net`.
//!
//! The listener's io_uring loop accepts and reads; each accepted
//! connection gets a plain thread that copies what it reads back out.
//!
//! Usage:
//!     cargo build --release -p uring-echo
//!     RUST_LOG=uring_net=debug ./target/release/uring-echo [network] [address]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//! The first SIGINT/SIGTERM stops accepting and lets open sessions finish.
//! A second one exits right away.

use uring_net::{Connection, Error, Listener};

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Termination signals received so far.
static SIGNALS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SIGNALS.fetch_add(1, Ordering::Relaxed);
}

fn signalled(times: usize) -> bool {
    SIGNALS.load(Ordering::Relaxed) >= times
}

fn echo(mut conn: Connection) -> io::Result<u64> {
    let mut buf = [0u8; 4096];
    loop {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            return Ok(conn.bytes_read());
        }
        conn.write_all(&buf[..n])?;
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let network = args.get(1).map(String::as_str).unwrap_or("tcp");
    let address = args.get(2).map(String::as_str).unwrap_or("0.0.0.0:9999");

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    let listener = match uring_net::listen(network, address, &[]) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            tracing::error!(error = %e, "listen failed");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %listener.local_addr(), "uring-echo ready");

    // Closing the listener is what unblocks accept().
    let watcher = {
        let listener = listener.clone();
        thread::spawn(move || {
            while !signalled(1) {
                thread::sleep(Duration::from_millis(100));
            }
            let _ = listener.close();
        })
    };

    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    loop {
        match listener.accept() {
            Ok(conn) => {
                let peer = conn.remote_addr().clone();
                sessions.retain(|s| !s.is_finished());
                sessions.push(thread::spawn(move || match echo(conn) {
                    Ok(bytes) => tracing::debug!(%peer, bytes, "connection done"),
                    Err(e) => tracing::warn!(%peer, error = %e, "connection failed"),
                }));
            }
            Err(Error::Closed) => break,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                SIGNALS.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
    let _ = watcher.join();

    sessions.retain(|s| !s.is_finished());
    if !sessions.is_empty() {
        tracing::info!(open = sessions.len(), "waiting for sessions; signal again to quit");
    }
    while !signalled(2) && sessions.iter().any(|s| !s.is_finished()) {
        thread::sleep(Duration::from_millis(100));
    }

    let stats = listener.stats();
    tracing::info!(
        accepted = stats.accepted,
        reads = stats.reads,
        completions = stats.completions,
        parked = stats.parked,
        accept_backoffs = stats.accept_backoffs,
        cq_overflow = stats.cq_overflow,
        "uring-echo: shutdown"
    );
}
