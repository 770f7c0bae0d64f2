//! Readiness backends.
//!
//! The loop talks to the OS through the [`Poller`] capability set: arm a
//! descriptor for read or read+write, downgrade it back to read-only,
//! unregister it, and wait for readiness. Three implementations exist and
//! are chosen at first use in priority order kqueue > epoll > poll, each
//! forceable through an environment flag.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod pollfd;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::env_flag;
use crate::event::Event;

/// Force the portable `poll(2)` backend.
pub const ENV_FORCE_POLL: &str = "MILL_LOOP_POLL";
/// Force the `epoll(7)` backend (Linux only).
pub const ENV_FORCE_EPOLL: &str = "MILL_LOOP_EPOLL";
/// Force the `kqueue(2)` backend (BSD / macOS only).
pub const ENV_FORCE_KQUEUE: &str = "MILL_LOOP_KQUEUE";

/// Which event kinds a registered descriptor should report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub(crate) const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };
}

/// Uniform readiness interface over the platform mechanisms.
///
/// Arms are idempotent: re-arming a registered fd coalesces into an
/// interest change, and unregistering an fd that was never registered is
/// a no-op. `arm_read_only` is the downgrade path: for an fd previously
/// armed read+write it must clear the write interest.
pub(crate) trait Poller {
    fn name(&self) -> &'static str;

    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn unregister(&mut self, fd: RawFd);

    /// Block for up to `timeout` and append one merged [`Event`] per
    /// ready fd to `events`.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()>;

    fn arm_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.arm(fd, Interest::READ)
    }

    fn arm_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.arm(fd, Interest::READ_WRITE)
    }

    fn arm_read_only(&mut self, fd: RawFd) -> io::Result<()> {
        self.arm(fd, Interest::READ)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    Kqueue,
    Epoll,
    Poll,
}

impl Backend {
    fn available(self) -> bool {
        match self {
            Backend::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            )),
            Backend::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            Backend::Poll => true,
        }
    }

    fn forced(self) -> bool {
        match self {
            Backend::Kqueue => env_flag(ENV_FORCE_KQUEUE),
            Backend::Epoll => env_flag(ENV_FORCE_EPOLL),
            Backend::Poll => env_flag(ENV_FORCE_POLL),
        }
    }
}

// Priority order; force flags narrow the candidate set but never promote
// a backend the platform cannot provide.
const PRIORITY: [Backend; 3] = [Backend::Kqueue, Backend::Epoll, Backend::Poll];

fn select() -> Backend {
    let forced: Vec<Backend> = PRIORITY
        .iter()
        .copied()
        .filter(|b| b.forced() && b.available())
        .collect();
    if let Some(first) = forced.first() {
        return *first;
    }
    PRIORITY
        .iter()
        .copied()
        .find(|b| b.available())
        .unwrap_or(Backend::Poll)
}

/// Construct the backend for this process. Called lazily by the loop:
/// kernel queues do not survive `fork(2)`, so nothing is created until
/// the first operation that needs one.
pub(crate) fn create() -> io::Result<Box<dyn Poller>> {
    let backend = select();
    let poller: Box<dyn Poller> = match backend {
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly"
        ))]
        Backend::Kqueue => Box::new(kqueue::KqueuePoller::new()?),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Backend::Epoll => Box::new(epoll::EpollPoller::new()?),
        _ => Box::new(pollfd::PollFdPoller::new()),
    };
    tracing::debug!(backend = poller.name(), "readiness backend selected");
    Ok(poller)
}

pub(crate) fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn exercise(poller: &mut dyn Poller) {
        use std::os::unix::io::AsRawFd;

        let (mut a, b) = connected_pair();
        let fd = b.as_raw_fd();

        // Arms coalesce: double registration must not produce duplicate
        // reports or fail.
        poller.arm_read_write(fd).unwrap();
        poller.arm_read_write(fd).unwrap();

        a.write_all(b"x").unwrap();
        let mut events = Vec::new();
        poller
            .wait(&mut events, Duration::from_millis(500))
            .unwrap();
        let reports: Vec<_> = events.iter().filter(|e| e.fd == fd).collect();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].readable);
        assert!(reports[0].writable);

        // Downgrade clears write interest: the socket stays writable at
        // the OS level but must no longer be reported as such.
        poller.arm_read_only(fd).unwrap();
        a.write_all(b"y").unwrap();
        events.clear();
        poller
            .wait(&mut events, Duration::from_millis(500))
            .unwrap();
        let report = events.iter().find(|e| e.fd == fd).unwrap();
        assert!(report.readable);
        assert!(!report.writable);

        poller.unregister(fd);
        poller.unregister(fd); // unknown fd tolerated
        events.clear();
        poller
            .wait(&mut events, Duration::from_millis(50))
            .unwrap();
        assert!(events.iter().all(|e| e.fd != fd));
    }

    #[test]
    fn portable_backend_contract() {
        let mut poller = pollfd::PollFdPoller::new();
        exercise(&mut poller);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn epoll_backend_contract() {
        let mut poller = epoll::EpollPoller::new().unwrap();
        exercise(&mut poller);
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    #[test]
    fn kqueue_backend_contract() {
        let mut poller = kqueue::KqueuePoller::new().unwrap();
        exercise(&mut poller);
    }

    #[test]
    fn default_selection_is_platform_best() {
        let poller = create().unwrap();
        if cfg!(any(target_os = "linux", target_os = "android")) {
            assert_eq!(poller.name(), "epoll");
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly"
        )) {
            assert_eq!(poller.name(), "kqueue");
        } else {
            assert_eq!(poller.name(), "poll");
        }
    }
}
