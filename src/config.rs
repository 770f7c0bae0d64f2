//! Loop, listener, and outbound-connection configuration.
//!
//! All three structs follow the same shape: a `Default` carrying the
//! documented defaults and a builder for ergonomic construction.

use std::env;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

/// Reads past this size are chunked; the write refill stage also uses it
/// as its soft ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Disable IPv6 address resolution.
pub const ENV_NO_IPV6: &str = "MILL_LOOP_NO_IPV6";
/// Refuse TLS listeners and connections at runtime even when the `tls`
/// feature is compiled in.
pub const ENV_NO_TLS: &str = "MILL_LOOP_NO_TLS";
/// Override [`DEFAULT_CHUNK_SIZE`].
pub const ENV_CHUNK_SIZE: &str = "MILL_LOOP_CHUNK_SIZE";

pub(crate) fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => !value.is_empty() && value != "0",
        Err(_) => false,
    }
}

pub(crate) fn chunk_size_from_env() -> usize {
    env::var(ENV_CHUNK_SIZE)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE)
}

/// Admission predicate: receives whether the connection registry is
/// empty and decides whether this worker may hold the accept right for
/// the coming iteration. Must be cheap and non-blocking.
pub type LockCallback = Rc<dyn Fn(bool) -> bool>;
/// Invoked right after an accept, before the listeners are disarmed, so
/// a peer worker can take the accept right next.
pub type UnlockCallback = Rc<dyn Fn()>;

/// Loop-wide tunables.
#[derive(Clone)]
pub struct LoopConfig {
    /// How long a staged inbound socket may take to report connected.
    pub accept_timeout: Duration,
    /// How long an outbound socket may take to reach established.
    pub connect_timeout: Duration,
    /// Default per-connection idle timeout.
    pub idle_timeout: Duration,
    /// Upper bound on one backend wait; housekeeping runs at this cadence
    /// even when no events arrive.
    pub poll_wait: Duration,
    /// Cap on concurrent inbound connections.
    pub max_clients: usize,
    /// Admission predicate consulted before arming listeners.
    pub lock_cb: LockCallback,
    /// Release hook invoked after each accept.
    pub unlock_cb: UnlockCallback,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15),
            poll_wait: Duration::from_millis(250),
            max_clients: 1000,
            lock_cb: Rc::new(|_| true),
            unlock_cb: Rc::new(|| {}),
        }
    }
}

impl LoopConfig {
    pub fn builder() -> LoopConfigBuilder {
        LoopConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct LoopConfigBuilder {
    accept_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    poll_wait: Option<Duration>,
    max_clients: Option<usize>,
    lock_cb: Option<LockCallback>,
    unlock_cb: Option<UnlockCallback>,
}

impl LoopConfigBuilder {
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = Some(wait);
        self
    }

    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = Some(max);
        self
    }

    pub fn lock_cb<F: Fn(bool) -> bool + 'static>(mut self, f: F) -> Self {
        self.lock_cb = Some(Rc::new(f));
        self
    }

    pub fn unlock_cb<F: Fn() + 'static>(mut self, f: F) -> Self {
        self.unlock_cb = Some(Rc::new(f));
        self
    }

    pub fn build(self) -> LoopConfig {
        let default = LoopConfig::default();
        LoopConfig {
            accept_timeout: self.accept_timeout.unwrap_or(default.accept_timeout),
            connect_timeout: self.connect_timeout.unwrap_or(default.connect_timeout),
            idle_timeout: self.idle_timeout.unwrap_or(default.idle_timeout),
            poll_wait: self.poll_wait.unwrap_or(default.poll_wait),
            max_clients: self.max_clients.unwrap_or(default.max_clients),
            lock_cb: self.lock_cb.unwrap_or(default.lock_cb),
            unlock_cb: self.unlock_cb.unwrap_or(default.unlock_cb),
        }
    }
}

/// Where and how to listen.
#[derive(Clone)]
pub struct ListenConfig {
    /// TCP port; ignored for UNIX-domain listeners.
    pub port: u16,
    /// Bind address for TCP listeners.
    pub address: String,
    /// Listen backlog; `None` uses the OS maximum.
    pub queue_size: Option<i32>,
    /// Bind a UNIX-domain socket at this path instead of TCP.
    pub file: Option<PathBuf>,
    /// Wrap accepted sockets in TLS.
    pub tls: bool,
    /// Server certificate chain (PEM), required with `tls`.
    pub tls_cert: Option<PathBuf>,
    /// Server private key (PEM), required with `tls`.
    pub tls_key: Option<PathBuf>,
    /// Apply `TCP_NODELAY` to accepted sockets.
    pub no_delay: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: 0,
            address: "0.0.0.0".to_string(),
            queue_size: None,
            file: None,
            tls: false,
            tls_cert: None,
            tls_key: None,
            no_delay: true,
        }
    }
}

impl ListenConfig {
    pub fn builder() -> ListenConfigBuilder {
        ListenConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ListenConfigBuilder {
    config: ListenConfig,
}

impl ListenConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn address<S: Into<String>>(mut self, address: S) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn queue_size(mut self, backlog: i32) -> Self {
        self.config.queue_size = Some(backlog);
        self
    }

    pub fn file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.file = Some(path.into());
        self
    }

    pub fn tls<P: Into<PathBuf>>(mut self, cert: P, key: P) -> Self {
        self.config.tls = true;
        self.config.tls_cert = Some(cert.into());
        self.config.tls_key = Some(key.into());
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn build(self) -> ListenConfig {
        self.config
    }
}

/// Where and how to connect.
#[derive(Clone)]
pub struct ConnectConfig {
    pub host: String,
    /// Defaults to 80, or 443 with `tls`.
    pub port: Option<u16>,
    pub tls: bool,
    /// Extra trust anchors (PEM) for TLS verification.
    pub tls_ca_file: Option<PathBuf>,
    /// Disable server-certificate verification. Off by default.
    pub tls_no_verify: bool,
}

impl ConnectConfig {
    pub fn to<S: Into<String>>(host: S) -> ConnectConfigBuilder {
        ConnectConfigBuilder {
            config: ConnectConfig {
                host: host.into(),
                port: None,
                tls: false,
                tls_ca_file: None,
                tls_no_verify: false,
            },
        }
    }

    pub(crate) fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 443 } else { 80 })
    }
}

pub struct ConnectConfigBuilder {
    config: ConnectConfig,
}

impl ConnectConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls = enabled;
        self
    }

    pub fn tls_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.tls_ca_file = Some(path.into());
        self
    }

    pub fn tls_no_verify(mut self, skip: bool) -> Self {
        self.config.tls_no_verify = skip;
        self
    }

    pub fn build(self) -> ConnectConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.accept_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert_eq!(config.poll_wait, Duration::from_millis(250));
        assert_eq!(config.max_clients, 1000);
        assert!((config.lock_cb)(false));
    }

    #[test]
    fn builder_overrides_only_what_is_set() {
        let config = LoopConfig::builder()
            .max_clients(2)
            .poll_wait(Duration::from_millis(10))
            .build();
        assert_eq!(config.max_clients, 2);
        assert_eq!(config.poll_wait, Duration::from_millis(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
    }

    #[test]
    fn connect_port_defaults_follow_tls() {
        assert_eq!(ConnectConfig::to("example.org").build().effective_port(), 80);
        assert_eq!(
            ConnectConfig::to("example.org").tls(true).build().effective_port(),
            443
        );
        assert_eq!(
            ConnectConfig::to("example.org").port(8443).tls(true).build().effective_port(),
            8443
        );
    }
}
