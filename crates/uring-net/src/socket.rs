//! Listening socket setup and address decoding.
//!
//! Everything here is one-shot: resolve, create, configure, bind, listen.
//! Sockets come from `socket2` (close-on-exec) and are closed on every
//! error path by dropping them.

use crate::config::ListenerConfig;
use crate::error::{Error, Result};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// `tcp_fastopen` sysctl bit enabling server-side fast open.
const TFO_SERVER_ENABLE: i32 = 0x2;

/// Stream networks a listener can be opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6, whichever resolves first.
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Unix => "unix",
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
            Self::Unix => false,
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "unix" => Ok(Self::Unix),
            "udp" | "udp4" | "udp6" | "unixgram" => Err(Error::UnsupportedNetwork(s.to_owned())),
            _ => Err(Error::UnknownNetwork(s.to_owned())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOption {
    /// `SO_REUSEPORT`.
    ReusePort,
    /// `TCP_FASTOPEN`; requires server fast open enabled host-wide.
    FastOpen,
}

/// A listener or connection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    Inet(SocketAddr),
    /// Unix-domain endpoint; `None` for an unnamed socket.
    Unix(Option<PathBuf>),
}

impl Addr {
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            Self::Unix(_) => None,
        }
    }

    /// Decode a raw socket address.
    pub fn decode(addr: &SockAddr) -> Self {
        if let Some(v4) = addr.as_socket_ipv4() {
            return Self::Inet(SocketAddr::V4(v4));
        }
        if let Some(v6) = addr.as_socket_ipv6() {
            return Self::Inet(SocketAddr::V6(v6));
        }
        Self::Unix(addr.as_pathname().map(Path::to_path_buf))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(a) => a.fmt(f),
            Self::Unix(Some(p)) => p.display().fmt(f),
            Self::Unix(None) => f.write_str("@"),
        }
    }
}

/// Check that the host allows server-side TCP fast open.
pub fn fast_open_allowed(sysctl: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(sysctl)
        .map_err(|e| Error::FastOpenUnavailable(format!("{}: {e}", sysctl.display())))?;
    let value: i32 = raw.trim().parse().map_err(|_| {
        Error::FastOpenUnavailable(format!("{}: unexpected value {:?}", sysctl.display(), raw.trim()))
    })?;
    if value & TFO_SERVER_ENABLE == 0 {
        return Err(Error::FastOpenUnavailable(format!(
            "{} is {value}, server bit 0x2 not set",
            sysctl.display()
        )));
    }
    Ok(())
}

/// Resolve `address` for `network`. A bare `:port` means all interfaces.
fn resolve(network: Network, address: &str) -> Result<SockAddr> {
    if network == Network::Unix {
        return SockAddr::unix(address).map_err(Error::socket("unix address"));
    }
    let host_port = match address.strip_prefix(':') {
        Some(port) if network == Network::Tcp6 => format!("[::]:{port}"),
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_owned(),
    };
    let addr = host_port
        .to_socket_addrs()
        .map_err(|source| Error::Resolve { addr: address.to_owned(), source })?
        .find(|a| network.accepts(a))
        .ok_or_else(|| Error::NoAddress {
            network: network.as_str(),
            addr: address.to_owned(),
        })?;
    Ok(addr.into())
}

fn set_fast_open(socket: &Socket, qlen: i32) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            std::os::unix::io::AsRawFd::as_raw_fd(socket),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &qlen as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    nix::errno::Errno::result(ret)
        .map(drop)
        .map_err(|e| Error::socket("setsockopt TCP_FASTOPEN")(e.into()))
}

/// Create a bound, listening, non-blocking socket.
pub(crate) fn listen_socket(
    network: Network,
    address: &str,
    options: &[ListenOption],
    config: &ListenerConfig,
) -> Result<(Socket, Addr)> {
    let fast_open = options.contains(&ListenOption::FastOpen);
    if fast_open {
        if network == Network::Unix {
            return Err(Error::FastOpenUnavailable("not a tcp network".into()));
        }
        // Before any descriptor exists.
        fast_open_allowed(&config.fastopen_sysctl)?;
    }

    let addr = resolve(network, address)?;
    let (domain, protocol) = match network {
        Network::Unix => (Domain::UNIX, None),
        _ => (addr.domain(), Some(Protocol::TCP)),
    };
    let socket = Socket::new(domain, Type::STREAM, protocol).map_err(Error::socket("socket"))?;

    if network != Network::Unix {
        socket
            .set_reuse_address(true)
            .map_err(Error::socket("setsockopt SO_REUSEADDR"))?;
        if domain == Domain::IPV6 && network == Network::Tcp6 {
            socket
                .set_only_v6(true)
                .map_err(Error::socket("setsockopt IPV6_V6ONLY"))?;
        }
    }
    if options.contains(&ListenOption::ReusePort) {
        socket
            .set_reuse_port(true)
            .map_err(Error::socket("setsockopt SO_REUSEPORT"))?;
    }
    if fast_open {
        set_fast_open(&socket, config.fastopen_qlen)?;
    }

    socket.bind(&addr).map_err(Error::socket("bind"))?;
    socket
        .listen(config.listen_backlog)
        .map_err(Error::socket("listen"))?;
    socket
        .set_nonblocking(true)
        .map_err(Error::socket("set nonblocking"))?;

    let local = socket
        .local_addr()
        .map(|a| Addr::decode(&a))
        .map_err(Error::socket("getsockname"))?;
    Ok((socket, local))
}
