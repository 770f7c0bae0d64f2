//! Linux `epoll`-based backend.

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{timeout_millis, Interest, Poller};
use crate::event::Event;

const EVENTS_CAPACITY: usize = 256;

pub(crate) struct EpollPoller {
    epoll: RawFd,
    interests: HashMap<RawFd, Interest>,
    buf: Vec<epoll_event>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll,
            interests: HashMap::new(),
            buf: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut flags = 0;
        if interest.read {
            flags |= EPOLLIN;
        }
        if interest.write {
            flags |= EPOLLOUT;
        }
        let mut event = epoll_event {
            events: flags as u32,
            u64: fd as u64,
        };
        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.interests.get(&fd) {
            Some(current) if *current == interest => Ok(()),
            Some(_) => {
                self.ctl(EPOLL_CTL_MOD, fd, interest)?;
                self.interests.insert(fd, interest);
                Ok(())
            }
            None => {
                self.ctl(EPOLL_CTL_ADD, fd, interest)?;
                self.interests.insert(fd, interest);
                Ok(())
            }
        }
    }

    fn unregister(&mut self, fd: RawFd) {
        if self.interests.remove(&fd).is_some() {
            unsafe {
                epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()> {
        unsafe {
            self.buf.set_len(self.buf.capacity());
        }
        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.buf.as_mut_ptr(),
                self.buf.capacity() as i32,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                self.buf.set_len(0);
            }
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        unsafe {
            self.buf.set_len(n as usize);
        }

        for raw in &self.buf {
            let event = Event {
                fd: raw.u64 as RawFd,
                readable: raw.events & EPOLLIN as u32 != 0,
                writable: raw.events & EPOLLOUT as u32 != 0,
                hangup: raw.events & EPOLLHUP as u32 != 0,
                error: raw.events & EPOLLERR as u32 != 0,
            };
            event.push_merged(events);
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll);
        }
    }
}
