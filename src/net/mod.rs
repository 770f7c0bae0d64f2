//! Socket plumbing: stream and listener abstractions over TCP and
//! UNIX-domain sockets, plus the TLS wrapping behind the `tls` feature.

#[cfg(feature = "tls")]
pub(crate) mod tls;

use socket2::{Domain, Socket, Type};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use crate::config::{ConnectConfig, ListenConfig};
use crate::conn::ConnectCallback;
use crate::error::{Error, Result};

/// Address/port pair as seen by `local_info` / `remote_info`.
/// UNIX-domain sockets report the path with port 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub address: String,
    pub port: u16,
}

impl From<SocketAddr> for SocketInfo {
    fn from(addr: SocketAddr) -> Self {
        SocketInfo {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

fn unix_info(addr: &std::os::unix::net::SocketAddr) -> SocketInfo {
    let address = addr
        .as_pathname()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    SocketInfo { address, port: 0 }
}

/// Resolve `host:port`, honoring the IPv6 kill-switch.
pub(crate) fn resolve(host: &str, port: u16, ipv6_enabled: bool) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .find(|a| ipv6_enabled || a.is_ipv4())
        .ok_or_else(|| Error::Configuration(format!("no usable address for {}:{}", host, port)))
}

/// One connected (or connecting) socket of any supported kind.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tls::TlsStream>),
}

impl Stream {
    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.raw_fd(),
        }
    }

    /// Whether the socket is usable by the application. Drives the TLS
    /// handshake forward when one is pending; plain outbound TCP reports
    /// connected once the peer address resolves.
    pub(crate) fn poll_connected(&mut self) -> bool {
        match self {
            Stream::Tcp(s) => s.peer_addr().is_ok(),
            Stream::Unix(_) => true,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.poll_connected(),
        }
    }

    /// Mode switch when a staged socket leaves staging: plain sockets go
    /// non-blocking; TLS payload I/O runs in blocking mode.
    pub(crate) fn finish_staging(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(true),
            Stream::Unix(s) => s.set_nonblocking(true),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.set_blocking(),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
        }
    }

    pub(crate) fn local_info(&self) -> Option<SocketInfo> {
        match self {
            Stream::Tcp(s) => s.local_addr().ok().map(SocketInfo::from),
            Stream::Unix(s) => s.local_addr().ok().map(|a| unix_info(&a)),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.local_info(),
        }
    }

    pub(crate) fn peer_info(&self) -> Option<SocketInfo> {
        match self {
            Stream::Tcp(s) => s.peer_addr().ok().map(SocketInfo::from),
            Stream::Unix(s) => s.peer_addr().ok().map(|a| unix_info(&a)),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.peer_info(),
        }
    }
}

enum ListenSocket {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// A bound listening socket plus its accept callback.
pub(crate) struct Listener {
    sock: ListenSocket,
    pub accept_cb: ConnectCallback,
    no_delay: bool,
    #[cfg(feature = "tls")]
    tls: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl Listener {
    pub(crate) fn bind(
        config: &ListenConfig,
        accept_cb: ConnectCallback,
        ipv6_enabled: bool,
        tls_enabled: bool,
    ) -> Result<Self> {
        if config.tls && !tls_enabled {
            return Err(Error::Configuration("TLS support is disabled".to_string()));
        }
        if config.tls && config.file.is_some() {
            return Err(Error::Configuration(
                "TLS is only supported on TCP listeners".to_string(),
            ));
        }

        #[cfg(feature = "tls")]
        let tls = if config.tls {
            let (cert, key) = match (&config.tls_cert, &config.tls_key) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    return Err(Error::Configuration(
                        "TLS listeners need tls_cert and tls_key".to_string(),
                    ))
                }
            };
            Some(tls::load_server_config(cert, key)?)
        } else {
            None
        };
        #[cfg(not(feature = "tls"))]
        if config.tls {
            return Err(Error::Configuration(
                "built without the tls feature".to_string(),
            ));
        }

        let sock = match &config.file {
            Some(path) => {
                // Rebinding over a stale socket file from a previous run.
                if path.exists() {
                    let _ = fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(Error::Io)?;
                listener.set_nonblocking(true).map_err(Error::Io)?;
                ListenSocket::Unix {
                    listener,
                    path: path.clone(),
                }
            }
            None => {
                let addr = resolve(&config.address, config.port, ipv6_enabled)?;
                let socket =
                    Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(Error::Io)?;
                socket.set_reuse_address(true).map_err(Error::Io)?;
                socket.bind(&addr.into()).map_err(Error::Io)?;
                socket
                    .listen(config.queue_size.unwrap_or(libc::SOMAXCONN))
                    .map_err(Error::Io)?;
                socket.set_nonblocking(true).map_err(Error::Io)?;
                ListenSocket::Tcp(socket.into())
            }
        };

        Ok(Listener {
            sock,
            accept_cb,
            no_delay: config.no_delay,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        match &self.sock {
            ListenSocket::Tcp(l) => l.as_raw_fd(),
            ListenSocket::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }

    pub(crate) fn local_info(&self) -> SocketInfo {
        match &self.sock {
            ListenSocket::Tcp(l) => l
                .local_addr()
                .map(SocketInfo::from)
                .unwrap_or(SocketInfo {
                    address: String::new(),
                    port: 0,
                }),
            ListenSocket::Unix { path, .. } => SocketInfo {
                address: path.display().to_string(),
                port: 0,
            },
        }
    }

    /// Accept one pending connection. `WouldBlock` surfaces when the
    /// backlog is empty (spurious wakeups happen under load balancing).
    pub(crate) fn accept(&self) -> io::Result<Stream> {
        match &self.sock {
            ListenSocket::Tcp(l) => {
                let (stream, _addr) = l.accept()?;
                if self.no_delay {
                    let _ = stream.set_nodelay(true);
                }
                #[cfg(feature = "tls")]
                if let Some(tls_config) = &self.tls {
                    return Ok(Stream::Tls(Box::new(tls::TlsStream::accept(
                        stream,
                        tls_config.clone(),
                    )?)));
                }
                Ok(Stream::Tcp(stream))
            }
            ListenSocket::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept()?;
                Ok(Stream::Unix(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenSocket::Unix { path, .. } = &self.sock {
            let _ = fs::remove_file(path);
        }
    }
}

/// Build the outbound socket for `connect`. Plain TCP connects are
/// non-blocking (`EINPROGRESS` is the expected outcome); TLS connects
/// run blocking by design, so the handshake completes on the first
/// connect-housekeeping check.
pub(crate) fn connect_stream(
    config: &ConnectConfig,
    ipv6_enabled: bool,
    tls_enabled: bool,
) -> Result<Stream> {
    let addr = resolve(&config.host, config.effective_port(), ipv6_enabled)?;

    if config.tls {
        if !tls_enabled {
            return Err(Error::Configuration("TLS support is disabled".to_string()));
        }
        #[cfg(feature = "tls")]
        {
            let tcp = TcpStream::connect(addr).map_err(Error::Io)?;
            return Ok(Stream::Tls(Box::new(tls::TlsStream::connect(
                tcp,
                &config.host,
                config.tls_ca_file.as_deref(),
                config.tls_no_verify,
            )?)));
        }
        #[cfg(not(feature = "tls"))]
        return Err(Error::Configuration(
            "built without the tls feature".to_string(),
        ));
    }

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(Error::Io)?;
    socket.set_nonblocking(true).map_err(Error::Io)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(Error::Io(e)),
    }
    Ok(Stream::Tcp(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenConfig;
    use std::rc::Rc;

    fn noop_cb() -> ConnectCallback {
        Rc::new(|_, _| {})
    }

    #[test]
    fn tcp_listener_reports_bound_port() {
        let config = ListenConfig::builder().address("127.0.0.1").port(0).build();
        let listener = Listener::bind(&config, noop_cb(), true, true).unwrap();
        let info = listener.local_info();
        assert_eq!(info.address, "127.0.0.1");
        assert_ne!(info.port, 0);
    }

    #[test]
    fn unix_listener_cleans_up_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.sock");
        let config = ListenConfig::builder().file(&path).build();
        {
            let listener = Listener::bind(&config, noop_cb(), true, true).unwrap();
            assert!(path.exists());
            assert_eq!(listener.local_info().port, 0);
        }
        assert!(!path.exists());
    }

    #[test]
    fn unix_listener_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let config = ListenConfig::builder().file(&path).build();
        drop(Listener::bind(&config, noop_cb(), true, true).unwrap());
        // The previous run's file is gone, but simulate a crash leaving one.
        std::fs::write(&path, b"").unwrap();
        let listener = Listener::bind(&config, noop_cb(), true, true).unwrap();
        drop(listener);
    }

    #[test]
    fn outbound_tcp_socket_is_nonblocking() {
        let target = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();
        let config = ConnectConfig::to("127.0.0.1").port(port).build();
        let mut stream = connect_stream(&config, true, true).unwrap();
        // Loopback connects settle quickly; poll until established.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while !stream.poll_connected() && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert!(stream.poll_connected());
    }

    #[test]
    fn resolve_can_exclude_ipv6() {
        let addr = resolve("localhost", 80, false).unwrap();
        assert!(addr.is_ipv4());
    }

    #[test]
    fn tls_listener_requires_cert_and_key() {
        let mut config = ListenConfig::builder().address("127.0.0.1").port(0).build();
        config.tls = true;
        assert!(matches!(
            Listener::bind(&config, noop_cb(), true, true),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Listener::bind(&config, noop_cb(), true, false),
            Err(Error::Configuration(_))
        ));
    }
}
