use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use log::{error, trace};

use crate::handler::Handler;
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Registration state of a handler within the poller.
///
/// `New` is unknown to the kernel, `Added` is in the kernel interest
/// list, `Deleted` is still in the fd map but withdrawn from the kernel
/// (its interest dropped to empty). Re-enabling a `Deleted` handler must
/// use `EPOLL_CTL_ADD` again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PollerState {
    New,
    Added,
    Deleted,
}

/// Scratch space for `epoll_wait`, reused across poll cycles.
pub(crate) struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }
}

/// Level-triggered I/O multiplexer over `epoll`.
///
/// Owns the epoll descriptor and an fd-keyed map of weak handler
/// references. `poll` annotates each ready handler with its observed
/// revents and hands it back; dispatch stays with the event loop.
pub(crate) struct Poller {
    ep: OwnedFd,
    handlers: Mutex<HashMap<RawFd, Weak<Handler>>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Blocks for at most `timeout_ms` and collects ready handlers into
    /// `active`. Returns the time right after wakeup. Signal interruption
    /// yields an empty active list; the caller's next cycle retries.
    pub(crate) fn poll(
        &self,
        timeout_ms: i32,
        events: &mut Events,
        active: &mut Vec<Arc<Handler>>,
    ) -> Timestamp {
        events.inner.clear();
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = Timestamp::now();
        match res {
            Ok(n) => {
                // epoll_wait assigned exactly `n` events
                unsafe { events.inner.set_len(n as usize) };
                if n > 0 {
                    trace!("{} event(s) ready", n);
                }
                let handlers = self.handlers.lock().unwrap();
                for event in &events.inner {
                    let fd = event.u64 as RawFd;
                    if let Some(handler) = handlers.get(&fd).and_then(Weak::upgrade) {
                        handler.set_revents(event.events);
                        active.push(handler);
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                trace!("epoll_wait interrupted by signal");
            }
            Err(err) => {
                error!("epoll_wait failed: {}", err);
                panic!("epoll_wait failed: {}", err);
            }
        }
        now
    }

    /// Reflects a handler's current interest into the kernel, walking the
    /// {new, added, deleted} state machine.
    pub(crate) fn update(&self, handler: &Arc<Handler>) {
        let fd = handler.fd();
        let interest = handler.interest();
        trace!("update fd={} interest={:?}", fd, interest);
        match handler.poller_state() {
            PollerState::New => {
                self.handlers
                    .lock()
                    .unwrap()
                    .insert(fd, Arc::downgrade(handler));
                if !interest.is_empty() {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, interest);
                    handler.set_poller_state(PollerState::Added);
                }
            }
            PollerState::Deleted => {
                debug_assert!(self.handlers.lock().unwrap().contains_key(&fd));
                if !interest.is_empty() {
                    // the kernel forgot this fd, a modify would fail
                    self.ctl(libc::EPOLL_CTL_ADD, fd, interest);
                    handler.set_poller_state(PollerState::Added);
                }
            }
            PollerState::Added => {
                if interest.is_empty() {
                    self.ctl(libc::EPOLL_CTL_DEL, fd, interest);
                    handler.set_poller_state(PollerState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, interest);
                }
            }
        }
    }

    /// Drops a handler from the fd map (and the kernel, if still there).
    /// Interest must already be empty and no dispatch in progress.
    pub(crate) fn remove(&self, handler: &Arc<Handler>) {
        let fd = handler.fd();
        debug_assert!(handler.interest().is_empty());
        debug_assert!(!handler.is_event_handling());
        {
            // the fd may have been reused by a newer handler already;
            // only erase the entry if it is still ours
            let mut handlers = self.handlers.lock().unwrap();
            if let Some(weak) = handlers.get(&fd) {
                if Weak::as_ptr(weak) == Arc::as_ptr(handler) {
                    handlers.remove(&fd);
                }
            }
        }
        if handler.poller_state() == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::NONE);
        }
        handler.set_poller_state(PollerState::New);
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                // the fd may already be closed; epoll cleaned up for us
                error!("epoll_ctl del fd={}: {}", fd, err);
            } else {
                error!("epoll_ctl op={} fd={}: {}", op, fd, err);
                panic!("epoll_ctl failed: {}", err);
            }
        }
    }
}

/// Level-triggered on purpose, no `EPOLLET`: write interest is toggled
/// with the output queue, a permanently armed `EPOLLOUT` would busy-loop.
fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}
