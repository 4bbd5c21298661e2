//! End-to-end tests against the kernel ring. Skipped where io_uring is not
//! available (old kernel, seccomp, `io_uring_disabled`).

use uring_net::{Addr, Error, ListenOption, Listener, ListenerConfig};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn config() -> ListenerConfig {
    ListenerConfig::new().sq_entries(64).read_buffers(8)
}

fn listen_or_skip(network: &str, address: &str, config: ListenerConfig) -> Option<Listener> {
    init_tracing();
    match Listener::listen_with_config(network, address, &[], config) {
        Ok(l) => Some(l),
        Err(Error::Ring(e)) if e.is_unsupported() => {
            eprintln!("skipping: io_uring unavailable ({e})");
            None
        }
        Err(e) => panic!("listen {network} {address}: {e}"),
    }
}

fn tcp_addr(l: &Listener) -> std::net::SocketAddr {
    l.local_addr().as_inet().expect("tcp listener")
}

#[test]
fn two_clients_before_accept_then_a_third() {
    let Some(listener) = listen_or_skip("tcp", "127.0.0.1:0", config()) else { return };
    let addr = tcp_addr(&listener);

    let a = TcpStream::connect(addr).unwrap();
    let b = TcpStream::connect(addr).unwrap();

    let first = listener.accept().unwrap();
    let second = listener.accept().unwrap();
    assert_ne!(first.remote_addr(), second.remote_addr());
    let mut got = vec![first.remote_addr().clone(), second.remote_addr().clone()];
    got.sort_by_key(|a| a.to_string());
    let mut want = vec![Addr::Inet(a.local_addr().unwrap()), Addr::Inet(b.local_addr().unwrap())];
    want.sort_by_key(|a| a.to_string());
    assert_eq!(got, want);
    assert_eq!(first.local_addr(), &Addr::Inet(addr));

    let c = TcpStream::connect(addr).unwrap();
    let third = listener.accept().unwrap();
    assert_eq!(third.remote_addr(), &Addr::Inet(c.local_addr().unwrap()));
    assert!(listener.stats().listener_rearms >= 1);
}

#[test]
fn accept_order_is_fifo() {
    let Some(listener) = listen_or_skip("tcp4", "127.0.0.1:0", config()) else { return };
    let addr = tcp_addr(&listener);

    let clients: Vec<_> = (0..4)
        .map(|_| {
            let c = TcpStream::connect(addr).unwrap();
            // Let the loop accept each before the next connects.
            thread::sleep(Duration::from_millis(20));
            c
        })
        .collect();
    for client in &clients {
        let conn = listener.accept().unwrap();
        assert_eq!(conn.remote_addr(), &Addr::Inet(client.local_addr().unwrap()));
    }
}

#[test]
fn accept_blocks_until_a_client_arrives() {
    let Some(listener) = listen_or_skip("tcp", "127.0.0.1:0", config()) else { return };
    let addr = tcp_addr(&listener);

    let connector = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        TcpStream::connect(addr).unwrap()
    });
    let conn = listener.accept().unwrap();
    let client = connector.join().unwrap();
    assert_eq!(conn.remote_addr(), &Addr::Inet(client.local_addr().unwrap()));
}

#[test]
fn echo_round_trip_and_eof() {
    let Some(listener) = listen_or_skip("tcp", "127.0.0.1:0", config()) else { return };
    let addr = tcp_addr(&listener);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut conn = listener.accept().unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5)));

    client.write_all(b"ping over uring").unwrap();
    let mut buf = [0u8; 64];
    let mut got = Vec::new();
    while got.len() < 15 {
        let n = conn.read(&mut buf).unwrap();
        assert!(n > 0);
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"ping over uring");
    assert_eq!(conn.bytes_read(), 15);

    conn.write_all(&got).unwrap();
    let mut back = [0u8; 15];
    client.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"ping over uring");

    client.shutdown(std::net::Shutdown::Write).unwrap();
    assert_eq!(conn.read(&mut buf).unwrap(), 0);
}

#[test]
fn many_chunks_survive_a_small_inbound_queue() {
    let cfg = config().inbound_chunks(1).read_buffer_size(16);
    let Some(listener) = listen_or_skip("tcp", "127.0.0.1:0", cfg) else { return };
    let addr = tcp_addr(&listener);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&payload).unwrap();
        client
    });

    let mut conn = listener.accept().unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(10)));
    let mut got = Vec::with_capacity(expected.len());
    let mut buf = [0u8; 1024];
    while got.len() < expected.len() {
        let n = conn.read(&mut buf).unwrap();
        assert!(n > 0, "early eof at {}", got.len());
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, expected);
    drop(writer.join().unwrap());
    assert!(listener.stats().reads > 1);
}

#[test]
fn close_unblocks_accept_and_refuses_new_clients() {
    let Some(listener) = listen_or_skip("tcp", "127.0.0.1:0", config()) else { return };
    let listener = Arc::new(listener);
    let addr = tcp_addr(&listener);

    let waiter = {
        let l = listener.clone();
        thread::spawn(move || l.accept())
    };
    thread::sleep(Duration::from_millis(50));
    listener.close().unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Closed)));
    assert!(matches!(listener.accept(), Err(Error::Closed)));
    listener.close().unwrap();

    // The ring releases its file references asynchronously after teardown.
    let refused = (0..100).any(|_| {
        if TcpStream::connect(addr).is_err() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
        false
    });
    assert!(refused, "listening socket still open after close");
}

#[test]
fn connections_keep_reading_after_listener_close() {
    let Some(listener) = listen_or_skip("tcp", "127.0.0.1:0", config()) else { return };
    let mut client = TcpStream::connect(tcp_addr(&listener)).unwrap();
    let mut conn = listener.accept().unwrap();
    listener.close().unwrap();
    assert!(matches!(listener.accept(), Err(Error::Closed)));
    assert!(listener.is_serving(), "loop still owns a live connection");

    client.write_all(b"after-close").unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 11];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"after-close");

    client.shutdown(std::net::Shutdown::Write).unwrap();
    assert_eq!(conn.read(&mut [0u8; 8]).unwrap(), 0);

    drop(conn);
    let exited = (0..100).any(|_| {
        if !listener.is_serving() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
        false
    });
    assert!(exited, "loop outlived its last connection");
}

#[test]
fn unix_listener() {
    let path = std::env::temp_dir().join(format!("uring-net-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let Some(listener) = listen_or_skip("unix", path.to_str().unwrap(), config()) else { return };
    assert_eq!(listener.local_addr(), &Addr::Unix(Some(path.clone())));

    let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
    let mut conn = listener.accept().unwrap();
    assert_eq!(conn.remote_addr(), &Addr::Unix(None));
    assert_eq!(conn.remote_addr().to_string(), "@");

    client.write_all(b"local").unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"local");

    listener.close().unwrap();
    assert!(!path.exists());
}

#[test]
fn datagram_and_unknown_networks_are_rejected() {
    assert!(matches!(
        Listener::listen_with_config("udp", "127.0.0.1:0", &[], config()),
        Err(Error::UnsupportedNetwork(_))
    ));
    assert!(matches!(
        Listener::listen_with_config("sctp", "127.0.0.1:0", &[], config()),
        Err(Error::UnknownNetwork(_))
    ));
}

#[test]
fn fast_open_without_host_support_fails_setup() {
    let sysctl = std::env::temp_dir().join(format!("uring-net-tfo-{}", std::process::id()));
    std::fs::write(&sysctl, "1\n").unwrap();
    let cfg = config().fastopen_sysctl(&sysctl);
    let err = Listener::listen_with_config("tcp", "127.0.0.1:0", &[ListenOption::FastOpen], cfg);
    assert!(matches!(err, Err(Error::FastOpenUnavailable(_))));
    let _ = std::fs::remove_file(sysctl);
}

#[test]
fn reuse_port_allows_two_listeners() {
    init_tracing();
    let first = match Listener::listen_with_config("tcp", "127.0.0.1:0", &[ListenOption::ReusePort], config()) {
        Ok(l) => l,
        Err(Error::Ring(e)) if e.is_unsupported() => return,
        Err(e) => panic!("{e}"),
    };
    let addr = tcp_addr(&first).to_string();
    let second =
        Listener::listen_with_config("tcp", &addr, &[ListenOption::ReusePort], config()).unwrap();
    assert_eq!(tcp_addr(&second), tcp_addr(&first));
}
