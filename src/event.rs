use std::os::unix::io::RawFd;

/// One readiness report from the backend, already translated out of the
/// platform event structure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Event {
    /// Fold `self` into `events`, merging bits with an existing entry for
    /// the same fd. Backends that report one filter per record (kqueue)
    /// produce several raw events per fd; the loop wants at most one.
    pub(crate) fn push_merged(self, events: &mut Vec<Event>) {
        if let Some(existing) = events.iter_mut().find(|e| e.fd == self.fd) {
            existing.readable |= self.readable;
            existing.writable |= self.writable;
            existing.hangup |= self.hangup;
            existing.error |= self.error;
        } else {
            events.push(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_coalesces_same_fd() {
        let mut events = Vec::new();
        Event {
            fd: 7,
            readable: true,
            ..Event::default()
        }
        .push_merged(&mut events);
        Event {
            fd: 7,
            writable: true,
            ..Event::default()
        }
        .push_merged(&mut events);
        Event {
            fd: 9,
            hangup: true,
            ..Event::default()
        }
        .push_merged(&mut events);

        assert_eq!(events.len(), 2);
        assert!(events[0].readable && events[0].writable);
        assert!(!events[0].hangup);
        assert!(events[1].hangup);
    }
}
