//! BSD / macOS `kqueue`-based backend.
//!
//! kqueue registers one filter per event kind, so this backend tracks
//! per-fd whether the write filter is currently installed: downgrading to
//! read-only must issue an `EV_DELETE` for `EVFILT_WRITE`, and nothing
//! else. End-of-file is reported on the filters themselves: `EV_EOF` with
//! a non-zero `fflags` carries an error, plain `EV_EOF` is a hangup.

use libc::{kevent, kqueue, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE, EV_EOF};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use super::{Interest, Poller};
use crate::event::Event;

const EVENTS_CAPACITY: usize = 256;

pub(crate) struct KqueuePoller {
    kq: RawFd,
    interests: HashMap<RawFd, Interest>,
    buf: Vec<kevent>,
}

// Field-by-field over a zeroed struct: BSD variants extend `struct
// kevent` past the fields this backend sets.
fn change(fd: RawFd, filter: i16, flags: u16) -> kevent {
    let mut ev: kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as usize;
    ev.filter = filter;
    ev.flags = flags;
    ev
}

impl KqueuePoller {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqueuePoller {
            kq,
            interests: HashMap::new(),
            buf: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    fn apply(&self, changes: &[kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let rc = unsafe {
            kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poller for KqueuePoller {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let previous = self.interests.get(&fd).copied();
        if previous == Some(interest) {
            return Ok(());
        }

        let mut adds = Vec::with_capacity(2);
        if interest.read {
            adds.push(change(fd, EVFILT_READ, EV_ADD | EV_ENABLE));
        }
        if interest.write {
            adds.push(change(fd, EVFILT_WRITE, EV_ADD | EV_ENABLE));
        }
        self.apply(&adds)?;

        // Dropping write interest needs an explicit filter delete; adds
        // alone would leave the stale filter firing.
        if !interest.write && previous.map(|p| p.write).unwrap_or(false) {
            let _ = self.apply(&[change(fd, EVFILT_WRITE, EV_DELETE)]);
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        if let Some(interest) = self.interests.remove(&fd) {
            if interest.read {
                let _ = self.apply(&[change(fd, EVFILT_READ, EV_DELETE)]);
            }
            if interest.write {
                let _ = self.apply(&[change(fd, EVFILT_WRITE, EV_DELETE)]);
            }
        }
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<()> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        unsafe {
            self.buf.set_len(self.buf.capacity());
        }
        let n = unsafe {
            kevent(
                self.kq,
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                self.buf.capacity() as i32,
                &ts,
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
            let eof = raw.flags & EV_EOF != 0;
            let event = Event {
                fd: raw.ident as RawFd,
                readable: raw.filter == EVFILT_READ,
                writable: raw.filter == EVFILT_WRITE,
                hangup: eof && raw.fflags == 0,
                error: eof && raw.fflags != 0,
            };
            event.push_merged(events);
        }
        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
