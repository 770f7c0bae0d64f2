//! Portable `poll(2)` backend.
//!
//! Keeps the interest set in a map and rebuilds the `pollfd` array on
//! every wait. Slower than the kernel-queue backends but available on
//! every Unix, which makes it the fallback of last resort and the
//! backend the force flag reaches for in constrained environments.

use libc::{nfds_t, poll, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{timeout_millis, Interest, Poller};
use crate::event::Event;

pub(crate) struct PollFdPoller {
    interests: HashMap<RawFd, Interest>,
    fds: Vec<pollfd>,
}

impl PollFdPoller {
    pub(crate) fn new() -> Self {
        PollFdPoller {
            interests: HashMap::new(),
            fds: Vec::new(),
        }
    }
}

impl Poller for PollFdPoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        self.interests.remove(&fd);
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()> {
        self.fds.clear();
        for (fd, interest) in &self.interests {
            let mut flags = 0;
            if interest.read {
                flags |= POLLIN;
            }
            if interest.write {
                flags |= POLLOUT;
            }
            self.fds.push(pollfd {
                fd: *fd,
                events: flags,
                revents: 0,
            });
        }

        let n = unsafe {
            poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as nfds_t,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for raw in self.fds.iter().filter(|p| p.revents != 0) {
            let event = Event {
                fd: raw.fd,
                readable: raw.revents & POLLIN != 0,
                writable: raw.revents & POLLOUT != 0,
                hangup: raw.revents & POLLHUP != 0,
                error: raw.revents & (POLLERR | POLLNVAL) != 0,
            };
            event.push_merged(events);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_on_empty_set_times_out_cleanly() {
        let mut poller = PollFdPoller::new();
        let mut events = Vec::new();
        poller
            .wait(&mut events, Duration::from_millis(10))
            .unwrap();
        assert!(events.is_empty());
    }
}
