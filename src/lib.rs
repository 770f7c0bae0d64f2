//! A single-threaded, callback-driven I/O loop for TCP and UNIX-domain
//! clients and servers.
//!
//! One [`EventLoop`] multiplexes many non-blocking sockets over the best
//! readiness mechanism the OS offers (kqueue, epoll, or portable
//! `poll(2)`), drives per-connection callbacks for accept / read / write
//! / error / hangup events, buffers outbound data with caller-controlled
//! back-pressure, and enforces accept, connect, and idle timeouts plus an
//! inbound concurrency cap.
//!
//! The loop is cooperative: callbacks run on the loop thread and must not
//! block. Protocol framing and input buffering are the caller's job — the
//! loop hands read chunks straight to the read callback and pulls
//! outbound chunks from the write callback.
//!
//! ```no_run
//! use mill_loop::{EventLoop, ListenConfig, LoopConfig};
//!
//! fn main() -> mill_loop::Result<()> {
//!     let mut lp = EventLoop::new(LoopConfig::default());
//!     lp.listen(
//!         ListenConfig::builder().address("127.0.0.1").port(3000).build(),
//!         |lp, id| {
//!             lp.on_read(id, |_, id, data| {
//!                 println!("{} sent {} bytes", id, data.len());
//!             });
//!         },
//!     )?;
//!     lp.start()
//! }
//! ```

pub mod config;
pub mod error;

mod conn;
mod event;
mod net;
mod object_pool;
mod poll;
mod reactor;
mod registry;

pub use config::{ConnectConfig, ListenConfig, LoopConfig};
pub use conn::{
    ConnectCallback, ConnectionId, ErrorCallback, HangupCallback, ReadCallback, WriteCallback,
};
pub use error::{Error, Result};
pub use net::SocketInfo;
pub use poll::{ENV_FORCE_EPOLL, ENV_FORCE_KQUEUE, ENV_FORCE_POLL};

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use conn::{Armed, Connection};
use event::Event;
use object_pool::BufferPool;
use poll::Poller;
use registry::Registry;

/// The engine. Owns every socket, the readiness backend, and the
/// connection registry; all callbacks receive `&mut EventLoop` and may
/// re-enter any public method, including dropping the connection they
/// were invoked for.
///
/// Deliberately `!Send`: the concurrency model is single-threaded
/// cooperative scheduling. Construct one per process as a policy (see
/// [`with_default`]) or explicitly thread a handle through your code.
/// The readiness backend is created lazily on first use because kernel
/// queues do not survive `fork(2)`; forking after [`EventLoop::start`]
/// is unsupported.
pub struct EventLoop {
    config: LoopConfig,
    registry: Registry,
    listeners: HashMap<RawFd, net::Listener>,
    /// Accepted sockets waiting to report connected (TLS handshakes).
    staged: Vec<(ConnectionId, Instant)>,
    poller: Option<Box<dyn Poller>>,
    events: Vec<Event>,
    scratch: BufferPool,
    chunk_size: usize,
    listening: bool,
    running: bool,
    ipv6_enabled: bool,
    tls_enabled: bool,
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new(LoopConfig::default())
    }
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Self {
        let chunk_size = config::chunk_size_from_env();
        EventLoop {
            config,
            registry: Registry::new(),
            listeners: HashMap::new(),
            staged: Vec::new(),
            poller: None,
            events: Vec::new(),
            scratch: BufferPool::new(8, chunk_size),
            chunk_size,
            listening: false,
            running: false,
            ipv6_enabled: !config::env_flag(config::ENV_NO_IPV6),
            tls_enabled: cfg!(feature = "tls") && !config::env_flag(config::ENV_NO_TLS),
        }
    }

    /// Register a listener. TCP unless `file` selects a UNIX-domain
    /// socket; TLS when configured. Listeners are armed with the backend
    /// only while admission holds (client cap and lock predicate).
    /// Returns the bound address, useful with port 0.
    ///
    /// `accept_cb` fires once per accepted connection, before the socket
    /// has necessarily completed its handshake; install the connection's
    /// callbacks there.
    pub fn listen<F>(&mut self, config: ListenConfig, accept_cb: F) -> Result<SocketInfo>
    where
        F: Fn(&mut EventLoop, ConnectionId) + 'static,
    {
        let listener = net::Listener::bind(
            &config,
            Rc::new(accept_cb),
            self.ipv6_enabled,
            self.tls_enabled,
        )?;
        let info = listener.local_info();
        let fd = listener.raw_fd();
        self.listeners.insert(fd, listener);
        // Joining an already-listening set arms the newcomer right away.
        if self.listening {
            self.arm_read(fd).map_err(Error::Io)?;
        }
        tracing::debug!(address = %info.address, port = info.port, "listener bound");
        Ok(info)
    }

    /// Start an outbound connection. The port defaults to 80, or 443
    /// with TLS. Returns immediately with the connection id; `connect_cb`
    /// fires once the connection is established.
    pub fn connect<F>(&mut self, config: ConnectConfig, connect_cb: F) -> Result<ConnectionId>
    where
        F: Fn(&mut EventLoop, ConnectionId) + 'static,
    {
        let stream = net::connect_stream(&config, self.ipv6_enabled, self.tls_enabled)?;
        let fd = stream.raw_fd();
        let conn = Connection::outbound(stream, Rc::new(connect_cb), self.config.idle_timeout);
        let id = self.registry.insert(conn);
        if let Err(e) = self.arm_read_write(fd) {
            self.registry.remove(id);
            return Err(Error::Io(e));
        }
        tracing::debug!(%id, host = %config.host, port = config.effective_port(), "connecting");
        Ok(id)
    }

    /// Close and remove a connection. Terminal, idempotent, and safe to
    /// call from any callback; no further callbacks fire for the id.
    pub fn close(&mut self, id: ConnectionId) {
        let _ = self.close_inner(id);
    }

    /// Close once the outbound buffer has drained. With an empty buffer
    /// this is an ordinary close on the next iteration.
    pub fn finish(&mut self, id: ConnectionId) {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.finish_pending = true;
        }
    }

    /// Arm write interest: the write callback will be polled to refill
    /// the outbound buffer and the buffer drained as the socket accepts
    /// bytes.
    pub fn writing(&mut self, id: ConnectionId) {
        let fd = match self.registry.get_mut(id) {
            Some(conn) => {
                conn.read_only_pending = false;
                conn.writing = Armed::ReadWrite;
                conn.touch();
                conn.stream.raw_fd()
            }
            None => return,
        };
        if let Err(e) = self.arm_read_write(fd) {
            self.conn_error(id, Error::Transport(Some(e)));
        }
    }

    /// Disarm write interest. Deferred while the buffer is non-empty:
    /// the downgrade happens right after the drain, and read interest is
    /// never disturbed.
    pub fn not_writing(&mut self, id: ConnectionId) {
        let fd = match self.registry.get_mut(id) {
            Some(conn) => {
                if !conn.buffer.is_empty() {
                    conn.read_only_pending = true;
                    conn.touch();
                    return;
                }
                conn.read_only_pending = false;
                conn.writing = Armed::Read;
                conn.touch();
                conn.stream.raw_fd()
            }
            None => return,
        };
        if let Err(e) = self.arm_read_only(fd) {
            self.conn_error(id, Error::Transport(Some(e)));
        }
    }

    /// Per-connection idle timeout; `None` for an unknown id.
    pub fn connection_timeout(&self, id: ConnectionId) -> Option<Duration> {
        self.registry.get(id).map(|conn| conn.idle_timeout)
    }

    pub fn set_connection_timeout(&mut self, id: ConnectionId, timeout: Duration) {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.idle_timeout = timeout;
        }
    }

    pub fn on_read<F>(&mut self, id: ConnectionId, f: F)
    where
        F: Fn(&mut EventLoop, ConnectionId, &[u8]) + 'static,
    {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.callbacks.read = Some(Rc::new(f));
        }
    }

    pub fn on_write<F>(&mut self, id: ConnectionId, f: F)
    where
        F: Fn(&mut EventLoop, ConnectionId) -> Option<Vec<u8>> + 'static,
    {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.callbacks.write = Some(Rc::new(f));
        }
    }

    pub fn on_error<F>(&mut self, id: ConnectionId, f: F)
    where
        F: Fn(&mut EventLoop, ConnectionId, &Error) + 'static,
    {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.callbacks.error = Some(Rc::new(f));
        }
    }

    pub fn on_hangup<F>(&mut self, id: ConnectionId, f: F)
    where
        F: Fn(&mut EventLoop, ConnectionId) + 'static,
    {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.callbacks.hangup = Some(Rc::new(f));
        }
    }

    pub fn local_info(&self, id: ConnectionId) -> Option<SocketInfo> {
        self.registry.get(id).and_then(|conn| conn.stream.local_info())
    }

    pub fn remote_info(&self, id: ConnectionId) -> Option<SocketInfo> {
        self.registry.get(id).and_then(|conn| conn.stream.peer_info())
    }

    /// Bytes queued in the outbound buffer, 0 for an unknown id.
    pub fn pending(&self, id: ConnectionId) -> usize {
        self.registry.get(id).map_or(0, |conn| conn.buffer.len())
    }

    /// Accepted inbound connections currently alive.
    pub fn client_count(&self) -> usize {
        self.registry.clients
    }

    /// Established outbound connections currently alive.
    pub fn server_count(&self) -> usize {
        self.registry.servers
    }

    /// Outbound connections still in progress.
    pub fn connecting_count(&self) -> usize {
        self.registry.connecting
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Run until [`EventLoop::stop`] is called, a hangup signal arrives,
    /// or nothing is left to drive (no listeners, no connections,
    /// nothing connecting).
    pub fn start(&mut self) -> Result<()> {
        reactor::install_signal_handlers();
        self.running = true;
        tracing::debug!("loop started");
        while self.running {
            self.spin()?;
        }
        tracing::debug!("loop stopped");
        Ok(())
    }

    /// Request a stop; the loop exits after the current iteration.
    /// In-flight connections are left untouched — drop what you want
    /// dropped before or after stopping.
    pub fn stop(&mut self) {
        self.running = false;
    }
}

thread_local! {
    static DEFAULT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// Run `f` against this thread's lazily-created default loop, for hosts
/// whose policy is one loop per process. Do not call re-entrantly from
/// inside `f` (or from a callback running under it) — explicit handles
/// compose, the default instance does not.
pub fn with_default<R>(f: impl FnOnce(&mut EventLoop) -> R) -> R {
    DEFAULT_LOOP.with(|slot| {
        let mut slot = slot.borrow_mut();
        let lp = slot.get_or_insert_with(EventLoop::default);
        f(lp)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_are_no_ops() {
        let mut lp = EventLoop::default();
        let ghost = ConnectionId::new(999);

        lp.close(ghost);
        lp.finish(ghost);
        lp.writing(ghost);
        lp.not_writing(ghost);
        lp.on_read(ghost, |_, _, _| {});
        lp.set_connection_timeout(ghost, Duration::from_secs(1));

        assert_eq!(lp.connection_timeout(ghost), None);
        assert_eq!(lp.pending(ghost), 0);
        assert!(lp.local_info(ghost).is_none());
        assert!(lp.remote_info(ghost).is_none());
    }

    #[test]
    fn fresh_loop_is_empty_and_stopped() {
        let lp = EventLoop::default();
        assert_eq!(lp.client_count(), 0);
        assert_eq!(lp.server_count(), 0);
        assert_eq!(lp.connecting_count(), 0);
        assert!(!lp.is_running());
    }

    #[test]
    fn default_instance_persists_across_calls() {
        with_default(|lp| {
            lp.listen(
                ListenConfig::builder().address("127.0.0.1").port(0).build(),
                |_, _| {},
            )
            .unwrap();
        });
        with_default(|lp| {
            assert_eq!(lp.listeners.len(), 1);
        });
    }

    #[test]
    fn stop_clears_running() {
        let mut lp = EventLoop::default();
        lp.running = true;
        lp.stop();
        assert!(!lp.is_running());
    }
}
