use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{trace, warn};

use crate::event_loop::LoopShared;
use crate::interest::Interest;
use crate::poller::{Poller, PollerState};
use crate::timestamp::Timestamp;

pub(crate) type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Dispatcher for one file descriptor.
///
/// Does not own the descriptor; it could be a socket, an eventfd or a
/// timerfd. Routes readiness reported by the poller to the installed
/// callbacks, and mirrors every interest change into the poller before
/// returning. A handler must be removed from its loop before the owning
/// object lets it drop.
///
/// When tied to an owner (see [`Handler::tie`]) each dispatch upgrades
/// the weak owner reference first and holds it for the whole dispatch,
/// so the owner cannot be freed from under an in-progress event even if
/// another thread forces a teardown.
pub(crate) struct Handler {
    shared: Arc<LoopShared>,
    poller: Arc<Poller>,
    fd: RawFd,
    interest: AtomicU8,
    revents: AtomicU32,
    poller_state: AtomicU8,
    event_handling: AtomicBool,
    added_to_loop: AtomicBool,
    log_hup: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    callbacks: Mutex<Callbacks>,
}

impl Handler {
    pub(crate) fn new(shared: Arc<LoopShared>, poller: Arc<Poller>, fd: RawFd) -> Arc<Handler> {
        Arc::new(Handler {
            shared,
            poller,
            fd,
            interest: AtomicU8::new(Interest::NONE.bits()),
            revents: AtomicU32::new(0),
            poller_state: AtomicU8::new(PollerState::New as u8),
            event_handling: AtomicBool::new(false),
            added_to_loop: AtomicBool::new(false),
            log_hup: AtomicBool::new(true),
            tie: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub(crate) fn is_event_handling(&self) -> bool {
        self.event_handling.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_callback(&self, callback: impl FnMut(Timestamp) + Send + 'static) {
        self.callbacks.lock().unwrap().read = Some(Box::new(callback));
    }

    pub(crate) fn set_write_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().write = Some(Box::new(callback));
    }

    pub(crate) fn set_close_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().close = Some(Box::new(callback));
    }

    pub(crate) fn set_error_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().error = Some(Box::new(callback));
    }

    /// Ties this handler to its logical owner. Dispatch upgrades the weak
    /// reference and bails out if the owner is already gone.
    pub(crate) fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&owner);
        *self.tie.lock().unwrap() = Some(weak);
    }

    #[allow(dead_code)]
    pub(crate) fn set_log_hup(&self, on: bool) {
        self.log_hup.store(on, Ordering::Relaxed);
    }

    pub(crate) fn enable_reading(self: &Arc<Self>) {
        self.modify_interest(|interest| interest.add(Interest::READABLE));
    }

    pub(crate) fn disable_reading(self: &Arc<Self>) {
        self.modify_interest(|interest| interest.remove(Interest::READABLE));
    }

    pub(crate) fn enable_writing(self: &Arc<Self>) {
        self.modify_interest(|interest| interest.add(Interest::WRITABLE));
    }

    pub(crate) fn disable_writing(self: &Arc<Self>) {
        self.modify_interest(|interest| interest.remove(Interest::WRITABLE));
    }

    pub(crate) fn disable_all(self: &Arc<Self>) {
        self.modify_interest(|_| Interest::NONE);
    }

    fn modify_interest(self: &Arc<Self>, f: impl FnOnce(Interest) -> Interest) {
        self.shared.assert_in_loop_thread();
        let next = f(self.interest());
        self.interest.store(next.bits(), Ordering::Release);
        self.added_to_loop.store(true, Ordering::Release);
        self.poller.update(self);
    }

    /// Detaches from the loop. Interest must already be empty. Safe to
    /// call more than once.
    pub(crate) fn remove(self: &Arc<Self>) {
        self.shared.assert_in_loop_thread();
        assert!(self.interest().is_empty());
        if !self.added_to_loop.swap(false, Ordering::AcqRel) {
            return;
        }
        self.poller.remove(self);
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        match self.poller_state.load(Ordering::Acquire) {
            0 => PollerState::New,
            1 => PollerState::Added,
            _ => PollerState::Deleted,
        }
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.store(state as u8, Ordering::Release);
    }

    /// Routes the last observed revents to the installed callbacks.
    pub(crate) fn handle_event(self: &Arc<Self>, receive_time: Timestamp) {
        let tied = self.tie.lock().unwrap().clone();
        let _owner_guard = match tied {
            Some(weak) => match weak.upgrade() {
                // keeps the owner alive for the rest of the dispatch
                Some(owner) => Some(owner),
                None => return,
            },
            None => None,
        };
        self.event_handling.store(true, Ordering::Release);
        self.handle_event_with_guard(receive_time);
        self.event_handling.store(false, Ordering::Release);
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let revents = self.revents.load(Ordering::Acquire) as libc::c_int;
        trace!("fd={} revents={:#x}", self.fd, revents);
        let mut callbacks = self.callbacks.lock().unwrap();
        if revents & libc::EPOLLHUP != 0 && revents & libc::EPOLLIN == 0 {
            if self.log_hup.load(Ordering::Relaxed) {
                warn!("fd={} hang up", self.fd);
            }
            if let Some(callback) = callbacks.close.as_mut() {
                callback();
            }
        }
        if revents & libc::EPOLLERR != 0 {
            if let Some(callback) = callbacks.error.as_mut() {
                callback();
            }
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0 {
            if let Some(callback) = callbacks.read.as_mut() {
                callback(receive_time);
            }
        }
        if revents & libc::EPOLLOUT != 0 {
            if let Some(callback) = callbacks.write.as_mut() {
                callback();
            }
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::Acquire));
        debug_assert!(!self.added_to_loop.load(Ordering::Acquire));
    }
}
