//! Listener bindings.
//!
//! # Responsibilities
//! - Bind TCP addresses (default port from scheme) and Unix socket paths
//! - Describe every listener for logging and shutdown
//! - Hand bound sockets to the runtime when the server starts
//! - Release Unix socket files on close
//!
//! # Design Decisions
//! - Sockets are bound synchronously while configuration steps run, so a
//!   bad address fails the build instead of the first `start`
//! - Conversion to Tokio listeners is deferred to `start`, which always runs
//!   inside a runtime

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::ConfigError;

const BACKLOG: i32 = 1024;

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

/// What a listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerBinding {
    Tcp { addr: SocketAddr },
    Tls { addr: SocketAddr },
    Unix { path: PathBuf },
    /// Descriptor passed in by a service manager.
    Inherited { fd: RawFd, local: String },
}

impl ListenerBinding {
    /// Local TCP address, if any.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenerBinding::Tcp { addr } | ListenerBinding::Tls { addr } => Some(*addr),
            _ => None,
        }
    }

    /// Same binding, reported as serving TLS when it is a TCP listener.
    pub(crate) fn with_tls(self) -> Self {
        match self {
            ListenerBinding::Tcp { addr } => ListenerBinding::Tls { addr },
            other => other,
        }
    }

    /// Release resources that outlive the descriptor.
    ///
    /// Unix socket files we created are removed; a missing file is reported.
    pub(crate) fn release(&self) -> io::Result<()> {
        match self {
            ListenerBinding::Unix { path } => std::fs::remove_file(path),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ListenerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerBinding::Tcp { addr } => write!(f, "tcp://{}", addr),
            ListenerBinding::Tls { addr } => write!(f, "tls://{}", addr),
            ListenerBinding::Unix { path } => write!(f, "unix://{}", path.display()),
            ListenerBinding::Inherited { fd, local } => write!(f, "fd://{} ({})", fd, local),
        }
    }
}

enum Socketish {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

/// A bound socket that has not been handed to the runtime yet.
pub struct BoundListener {
    socket: Socketish,
    binding: ListenerBinding,
}

impl BoundListener {
    pub(crate) fn tcp(listener: std::net::TcpListener, binding: ListenerBinding) -> Self {
        Self {
            socket: Socketish::Tcp(listener),
            binding,
        }
    }

    pub(crate) fn unix(listener: std::os::unix::net::UnixListener, binding: ListenerBinding) -> Self {
        Self {
            socket: Socketish::Unix(listener),
            binding,
        }
    }

    pub fn binding(&self) -> &ListenerBinding {
        &self.binding
    }

    pub(crate) fn binding_mut(&mut self) -> &mut ListenerBinding {
        &mut self.binding
    }

    #[cfg(test)]
    pub(crate) fn is_tcp(&self) -> bool {
        matches!(self.socket, Socketish::Tcp(_))
    }

    /// Register the socket with the current Tokio runtime.
    pub(crate) fn into_listener(self) -> io::Result<Listener> {
        let inner = match self.socket {
            Socketish::Tcp(l) => {
                l.set_nonblocking(true)?;
                Inner::Tcp(TcpListener::from_std(l)?)
            }
            Socketish::Unix(l) => {
                l.set_nonblocking(true)?;
                Inner::Unix(UnixListener::from_std(l)?)
            }
        };
        Ok(Listener {
            inner,
            binding: self.binding,
        })
    }
}

impl fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundListener")
            .field("binding", &self.binding)
            .finish()
    }
}

enum Inner {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A listener registered with the runtime, owned by one accept loop.
pub struct Listener {
    inner: Inner,
    binding: ListenerBinding,
}

/// An accepted connection.
pub enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Accepted> {
        match &self.inner {
            Inner::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                // Small responses should not wait on Nagle.
                let _ = stream.set_nodelay(true);
                Ok(Accepted::Tcp(stream, peer))
            }
            Inner::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Accepted::Unix(stream))
            }
        }
    }

    pub fn binding(&self) -> &ListenerBinding {
        &self.binding
    }
}

/// Normalise a TCP address: empty means all interfaces on the scheme's
/// default port, a missing port gets the default port.
pub fn normalize_tcp_addr(addr: &str, tls: bool) -> String {
    let default_port = if tls { HTTPS_PORT } else { HTTP_PORT };
    let addr = addr.trim();

    if addr.is_empty() {
        return format!("0.0.0.0:{}", default_port);
    }
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{}", port);
    }
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    // Bare IPv6 literal, with or without brackets.
    if addr.parse::<std::net::Ipv6Addr>().is_ok() {
        return format!("[{}]:{}", addr, default_port);
    }
    if addr.starts_with('[') && addr.ends_with(']') {
        return format!("{}:{}", addr, default_port);
    }
    match addr.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{}:{}", addr, default_port),
    }
}

/// Bind a TCP listener with `SO_REUSEADDR`.
pub fn bind_tcp(addr: &str, tls: bool) -> Result<BoundListener, ConfigError> {
    let target = normalize_tcp_addr(addr, tls);
    let bind_err = |source: io::Error| ConfigError::Bind {
        target: target.clone(),
        source,
    };

    let resolved = target
        .to_socket_addrs()
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| bind_err(io::Error::new(io::ErrorKind::NotFound, "address did not resolve")))?;

    let domain = if resolved.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&resolved.into()).map_err(bind_err)?;
    socket.listen(BACKLOG).map_err(bind_err)?;

    let listener: std::net::TcpListener = socket.into();
    let addr = listener.local_addr().map_err(bind_err)?;

    tracing::info!(address = %addr, "Listener bound");

    Ok(BoundListener::tcp(listener, ListenerBinding::Tcp { addr }))
}

/// Bind a Unix domain socket at `path`.
pub fn bind_unix(path: &Path) -> Result<BoundListener, ConfigError> {
    let listener = std::os::unix::net::UnixListener::bind(path).map_err(|source| ConfigError::Bind {
        target: path.display().to_string(),
        source,
    })?;

    tracing::info!(path = %path.display(), "Listener bound");

    Ok(BoundListener::unix(
        listener,
        ListenerBinding::Unix {
            path: path.to_path_buf(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_address_uses_scheme_port() {
        assert_eq!(normalize_tcp_addr("", false), "0.0.0.0:80");
        assert_eq!(normalize_tcp_addr("", true), "0.0.0.0:443");
    }

    #[test]
    fn missing_port_is_filled_in() {
        assert_eq!(normalize_tcp_addr("localhost", false), "localhost:80");
        assert_eq!(normalize_tcp_addr("127.0.0.1", true), "127.0.0.1:443");
        assert_eq!(normalize_tcp_addr("::1", false), "[::1]:80");
        assert_eq!(normalize_tcp_addr("[::1]", true), "[::1]:443");
    }

    #[test]
    fn explicit_ports_are_kept() {
        assert_eq!(normalize_tcp_addr(":8080", true), "0.0.0.0:8080");
        assert_eq!(normalize_tcp_addr("127.0.0.1:0", false), "127.0.0.1:0");
        assert_eq!(normalize_tcp_addr("localhost:9000", false), "localhost:9000");
        assert_eq!(normalize_tcp_addr("[::1]:9000", false), "[::1]:9000");
    }

    #[test]
    fn bind_tcp_reports_the_bound_port() {
        let bound = bind_tcp("127.0.0.1:0", false).unwrap();
        let addr = bound.binding().socket_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(bound.is_tcp());
    }

    #[test]
    fn bind_tcp_rejects_garbage() {
        let err = bind_tcp("not an address:99999", false).unwrap_err();
        assert!(matches!(err, ConfigError::Bind { .. }));
    }

    #[test]
    fn unix_release_removes_the_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");

        let bound = bind_unix(&path).unwrap();
        assert!(path.exists());

        let binding = bound.binding().clone();
        drop(bound);
        binding.release().unwrap();
        assert!(!path.exists());
        assert!(binding.release().is_err());
    }
}
