use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, trace};

use crate::event_loop::LoopShared;
use crate::timestamp::Timestamp;

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

/// Real arming delays are clamped to this, so a timer that is due "now"
/// still goes through the descriptor instead of hitting a zero-timeout
/// edge case.
const MIN_ARM_DELAY_MICROS: i64 = 100;

/// Sequence numbers are process-unique, never reused.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identifies a scheduled timer for [cancellation].
///
/// Ids stay valid (and inert) after their timer fired or was cancelled: a
/// stale id can never cancel a timer it did not come from.
///
/// [cancellation]: crate::LoopHandle::cancel
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerId {
    sequence: u64,
}

struct Timer {
    callback: Mutex<TimerCallback>,
    // micros, rewritten when a periodic timer restarts
    expiration: AtomicI64,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    fn new(callback: TimerCallback, when: Timestamp, interval: Option<Duration>) -> Timer {
        Timer {
            callback: Mutex::new(callback),
            expiration: AtomicI64::new(when.micros()),
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn expiration(&self) -> Timestamp {
        Timestamp::from_micros(self.expiration.load(Ordering::Acquire))
    }

    fn restart(&self, now: Timestamp) {
        let interval = self.interval.expect("restarting a one-shot timer");
        self.expiration
            .store((now + interval).micros(), Ordering::Release);
    }

    fn run(&self) {
        let mut guard = self.callback.lock().unwrap();
        let callback = &mut **guard;
        callback();
    }
}

#[derive(Default)]
struct Inner {
    // the schedule, ordered by expiration; sequence breaks ties so
    // iteration under identical expirations is deterministic
    timers: BTreeMap<(i64, u64), Arc<Timer>>,
    // sequence -> current expiration, the cancellation index
    active: HashMap<u64, i64>,
    // timers cancelled while their callback window is open; the reset
    // step must not re-insert these
    canceling: HashSet<u64>,
}

impl Inner {
    fn check_sizes(&self) {
        debug_assert_eq!(self.timers.len(), self.active.len());
    }
}

/// Ordered registry of one-shot and periodic timers, armed against a
/// single monotonic `timerfd`.
///
/// `add_timer` and `cancel` are thread-safe; they hop to the owning loop.
/// Cancelling an already-fired periodic timer from inside its own
/// callback is supported through the canceling set.
pub(crate) struct TimerQueue {
    shared: Arc<LoopShared>,
    timerfd: OwnedFd,
    inner: Mutex<Inner>,
    calling_expired: AtomicBool,
}

impl TimerQueue {
    pub(crate) fn new(shared: Arc<LoopShared>) -> io::Result<TimerQueue> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
        ))?;
        Ok(TimerQueue {
            shared,
            timerfd: unsafe { OwnedFd::from_raw_fd(fd) },
            inner: Mutex::new(Inner::default()),
            calling_expired: AtomicBool::new(false),
        })
    }

    pub(crate) fn timer_fd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    /// Schedules `callback` to run at `when`, repeating every `interval`
    /// if one is given. Callable from any thread.
    pub(crate) fn add_timer(
        self: &Arc<Self>,
        callback: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Arc::new(Timer::new(callback, when, interval));
        let id = TimerId {
            sequence: timer.sequence,
        };
        let queue = Arc::clone(self);
        self.shared
            .run_in_loop(move || queue.add_timer_in_loop(timer));
        id
    }

    /// Cancels the timer `id` refers to, if it is still active. Callable
    /// from any thread; once this has run on the owning loop, a one-shot
    /// callback will not fire and a periodic one will not be re-armed.
    pub(crate) fn cancel(self: &Arc<Self>, id: TimerId) {
        let queue = Arc::clone(self);
        self.shared.run_in_loop(move || queue.cancel_in_loop(id));
    }

    fn add_timer_in_loop(&self, timer: Arc<Timer>) {
        self.shared.assert_in_loop_thread();
        let when = timer.expiration();
        if self.insert(timer) {
            self.rearm(when);
        }
    }

    /// Returns whether the new front of the schedule changed.
    fn insert(&self, timer: Arc<Timer>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.check_sizes();
        let when = timer.expiration().micros();
        let earliest_changed = match inner.timers.keys().next() {
            Some(&(front, _)) => when < front,
            None => true,
        };
        inner.active.insert(timer.sequence, when);
        inner.timers.insert((when, timer.sequence), timer);
        inner.check_sizes();
        earliest_changed
    }

    fn cancel_in_loop(&self, id: TimerId) {
        self.shared.assert_in_loop_thread();
        let mut inner = self.inner.lock().unwrap();
        inner.check_sizes();
        if let Some(when) = inner.active.remove(&id.sequence) {
            let removed = inner.timers.remove(&(when, id.sequence));
            debug_assert!(removed.is_some());
            // no re-arm: the descriptor may now fire early, never late;
            // a spurious wakeup drains to an empty expired set
        } else if self.calling_expired.load(Ordering::Acquire) {
            inner.canceling.insert(id.sequence);
        }
        inner.check_sizes();
    }

    /// Invoked by the loop when the timer descriptor becomes readable.
    pub(crate) fn handle_read(&self, _receive_time: Timestamp) {
        self.shared.assert_in_loop_thread();
        let now = Timestamp::now();
        self.drain_timerfd(now);

        let expired = self.take_expired(now);

        self.calling_expired.store(true, Ordering::Release);
        self.inner.lock().unwrap().canceling.clear();
        // callbacks run outside the lock; they may add or cancel timers
        for timer in &expired {
            timer.run();
        }
        self.calling_expired.store(false, Ordering::Release);

        self.reset(expired, now);
    }

    /// Moves every entry due at or before `now` out of both structures.
    fn take_expired(&self, now: Timestamp) -> Vec<Arc<Timer>> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_sizes();
        let remaining = inner.timers.split_off(&(now.micros() + 1, 0));
        let due = std::mem::replace(&mut inner.timers, remaining);
        let expired: Vec<Arc<Timer>> = due.into_values().collect();
        for timer in &expired {
            let removed = inner.active.remove(&timer.sequence);
            debug_assert!(removed.is_some());
        }
        inner.check_sizes();
        expired
    }

    /// Re-inserts periodic timers that were not cancelled during the
    /// firing window, then re-arms to the new earliest expiration.
    fn reset(&self, expired: Vec<Arc<Timer>>, now: Timestamp) {
        for timer in expired {
            let cancelled = self
                .inner
                .lock()
                .unwrap()
                .canceling
                .contains(&timer.sequence);
            if timer.interval.is_some() && !cancelled {
                timer.restart(now);
                self.insert(timer);
            }
        }
        let next = self
            .inner
            .lock()
            .unwrap()
            .timers
            .keys()
            .next()
            .map(|&(when, _)| Timestamp::from_micros(when));
        if let Some(when) = next {
            self.rearm(when);
        }
    }

    fn drain_timerfd(&self, now: Timestamp) {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.timerfd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(8) => trace!(
                "timerfd fired {} time(s) at {:?}",
                u64::from_ne_bytes(buf),
                now
            ),
            Ok(n) => error!("timerfd read returned {} bytes instead of 8", n),
            // armed-then-cancelled timers wake us with nothing to read
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("timerfd read failed: {}", err),
        }
    }

    fn rearm(&self, when: Timestamp) {
        let delay = (when.micros() - Timestamp::now().micros()).max(MIN_ARM_DELAY_MICROS);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (delay / 1_000_000) as libc::time_t,
                tv_nsec: ((delay % 1_000_000) * 1_000) as libc::c_long,
            },
        };
        if let Err(err) = syscall!(timerfd_settime(
            self.timerfd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut()
        )) {
            error!("timerfd_settime failed: {}", err);
        }
    }
}
