//! Per-connection records.

use bytes::BytesMut;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::net::Stream;
use crate::EventLoop;

/// Opaque, stable identifier for a connection. Ids are assigned
/// monotonically and never reused, so a stale id held across a drop can
/// never alias a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which bucket a connection counts toward. Outbound connections start
/// as `Connecting` and become `Server` (the peer is a server from this
/// side's view); accepted connections are `Client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Connecting,
    Server,
    Client,
}

/// Write-interest tri-state for an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Armed {
    Unarmed,
    Read,
    ReadWrite,
}

/// Fired once an outbound connection is established or, for listeners,
/// once per accepted connection.
pub type ConnectCallback = Rc<dyn Fn(&mut EventLoop, ConnectionId)>;
/// Fired with each chunk the loop reads; input buffering is the
/// receiver's responsibility.
pub type ReadCallback = Rc<dyn Fn(&mut EventLoop, ConnectionId, &[u8])>;
/// Refill hook for the write path. Return `None` (or an empty chunk) to
/// end the refill round without error.
pub type WriteCallback = Rc<dyn Fn(&mut EventLoop, ConnectionId) -> Option<Vec<u8>>>;
/// Fired after a connection was dropped because of an error; the id is
/// already closed when this runs.
pub type ErrorCallback = Rc<dyn Fn(&mut EventLoop, ConnectionId, &Error)>;
/// Fired after a peer hangup or idle-timeout drop; the id is already
/// closed when this runs.
pub type HangupCallback = Rc<dyn Fn(&mut EventLoop, ConnectionId)>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub connect: Option<ConnectCallback>,
    pub read: Option<ReadCallback>,
    pub write: Option<WriteCallback>,
    pub error: Option<ErrorCallback>,
    pub hangup: Option<HangupCallback>,
}

pub(crate) struct Connection {
    pub stream: Stream,
    /// Outbound bytes not yet accepted by the OS.
    pub buffer: BytesMut,
    pub role: Role,
    pub callbacks: Callbacks,
    pub writing: Armed,
    /// Caller asked to stop writing while the buffer was non-empty;
    /// downgrade after the drain.
    pub read_only_pending: bool,
    /// Close once the buffer is empty.
    pub finish_pending: bool,
    /// Monotonic instant of the last successful read, write, or arm
    /// change. Lazily initialised on the first prepare pass.
    pub last_activity: Option<Instant>,
    pub idle_timeout: Duration,
    /// Set while the connection is outbound-connecting.
    pub connect_start: Option<Instant>,
}

impl Connection {
    pub(crate) fn inbound(stream: Stream, idle_timeout: Duration) -> Self {
        Connection {
            stream,
            buffer: BytesMut::new(),
            role: Role::Client,
            callbacks: Callbacks::default(),
            writing: Armed::Unarmed,
            read_only_pending: false,
            finish_pending: false,
            last_activity: None,
            idle_timeout,
            connect_start: None,
        }
    }

    pub(crate) fn outbound(
        stream: Stream,
        connect_cb: ConnectCallback,
        idle_timeout: Duration,
    ) -> Self {
        Connection {
            stream,
            buffer: BytesMut::new(),
            role: Role::Connecting,
            callbacks: Callbacks {
                connect: Some(connect_cb),
                ..Callbacks::default()
            },
            writing: Armed::Unarmed,
            read_only_pending: false,
            finish_pending: false,
            last_activity: None,
            idle_timeout,
            connect_start: Some(Instant::now()),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Idle duration as of `now`, initialising the activity clock on
    /// first use so freshly registered connections start their idle
    /// window at the first prepare pass that sees them.
    pub(crate) fn idle_for(&mut self, now: Instant) -> Duration {
        let last = *self.last_activity.get_or_insert(now);
        now.saturating_duration_since(last)
    }
}
