use std::cell::Cell;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, trace};

use crate::handler::Handler;
use crate::poller::{Events, Poller};
use crate::timer::{TimerCallback, TimerId, TimerQueue};
use crate::timestamp::Timestamp;
use crate::waker::Waker;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// The timer descriptor wakes the poll on its own, so the poll timeout
/// only bounds how long a completely idle loop sleeps.
const POLL_TIMEOUT_MS: i32 = 10_000;
const EVENTS_CAPACITY: usize = 1024;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// State shared between an [`EventLoop`] and its handles: thread
/// identity, the wakeup descriptor and the pending-task queue. The queue
/// mutex is the only lock a cross-thread submitter touches.
pub(crate) struct LoopShared {
    thread_id: ThreadId,
    waker: Waker,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    looping: AtomicBool,
    event_handling: AtomicBool,
}

impl LoopShared {
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "not on the owning loop thread (owner {:?}, current {:?} \"{}\")",
            self.thread_id,
            thread::current().id(),
            thread::current().name().unwrap_or("<unnamed>"),
        );
    }

    /// Runs `task` right away when called on the owning thread, otherwise
    /// queues it.
    pub(crate) fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(Box::new(task));
        }
    }

    /// Appends `task` to the pending queue, to run after the current (or
    /// next) poll cycle. Wakes the loop when the caller is off-thread, or
    /// when the loop is already draining its queue so that late additions
    /// still get a cycle of their own.
    pub(crate) fn queue_in_loop(&self, task: Task) {
        self.pending.lock().unwrap().push(task);
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.waker.wake();
        }
    }

    pub(crate) fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.waker.wake();
        }
    }

    pub(crate) fn wakeup(&self) {
        self.waker.wake();
    }

    fn waker_fd(&self) -> RawFd {
        self.waker.as_raw_fd()
    }

    fn drain_wakeup(&self) {
        let n = self.waker.drain();
        trace!("drained wakeup counter: {}", n);
    }
}

/// Shareable handle to an [`EventLoop`].
///
/// Cloneable, `Send` and `Sync`; this is how other threads submit tasks,
/// schedule timers or quit the loop. All work funnels through the loop's
/// pending queue in FIFO order.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
    pub(crate) poller: Arc<Poller>,
    pub(crate) timers: Arc<TimerQueue>,
}

impl LoopHandle {
    /// Runs `task` immediately when called on the owning thread,
    /// otherwise queues it for the loop to pick up.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.run_in_loop(task);
    }

    /// Queues `task` to run on the owning thread after the current poll
    /// cycle, even when called from the owning thread itself.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.queue_in_loop(Box::new(task));
    }

    /// Schedules `callback` to run once at `when`.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Box::new(callback), when, None)
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Box::new(callback), Timestamp::now() + delay, None)
    }

    /// Schedules `callback` to run every `interval`, first after one
    /// whole `interval` from now.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(
            Box::new(callback),
            Timestamp::now() + interval,
            Some(interval),
        )
    }

    fn add_timer(
        &self,
        callback: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> TimerId {
        self.timers.add_timer(callback, when, interval)
    }

    /// Cancels a scheduled timer. A timer cancelled during its own firing
    /// window is not re-armed.
    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Asks the loop to exit once the current cycle completes.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Breaks a blocking poll.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Panics when the calling thread does not own this loop.
    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }
}

/// A single-threaded reactor: one poller, one timer queue, one wakeup
/// descriptor and a pending-task queue.
///
/// A loop is bound to the thread that creates it, and at most one loop
/// may exist per thread. All handlers, timers and connections owned by a
/// loop are mutated only on its thread; other threads talk to the loop
/// through a [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: Arc<Poller>,
    timers: Arc<TimerQueue>,
    timer_handler: Arc<Handler>,
    wake_handler: Arc<Handler>,
    events: Events,
    active: Vec<Arc<Handler>>,
    // fd currently being dispatched, for debugging
    current_active: Option<RawFd>,
}

impl EventLoop {
    /// Creates a loop owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> io::Result<EventLoop> {
        LOOP_IN_THIS_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "another EventLoop already exists in thread {:?}",
                thread::current().id()
            );
            flag.set(true);
        });

        let poller = Arc::new(Poller::new()?);
        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            waker: Waker::new()?,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
        });
        let timers = Arc::new(TimerQueue::new(Arc::clone(&shared))?);

        // always reading the timerfd; it is disarmed with timerfd_settime
        let timer_handler = Handler::new(Arc::clone(&shared), Arc::clone(&poller), timers.timer_fd());
        let queue = Arc::clone(&timers);
        timer_handler.set_read_callback(move |receive_time| queue.handle_read(receive_time));
        timer_handler.enable_reading();

        let wake_handler = Handler::new(Arc::clone(&shared), Arc::clone(&poller), shared.waker_fd());
        let wake_shared = Arc::clone(&shared);
        wake_handler.set_read_callback(move |_| wake_shared.drain_wakeup());
        wake_handler.enable_reading();

        debug!("EventLoop created in thread {:?}", thread::current().id());
        Ok(EventLoop {
            shared,
            poller,
            timers,
            timer_handler,
            wake_handler,
            events: Events::with_capacity(EVENTS_CAPACITY),
            active: Vec::new(),
            current_active: None,
        })
    }

    /// Returns a shareable handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
            poller: Arc::clone(&self.poller),
            timers: Arc::clone(&self.timers),
        }
    }

    /// Runs the dispatch cycle until [`quit`] is observed: poll, dispatch
    /// ready handlers, drain pending tasks, repeat.
    ///
    /// [`quit`]: LoopHandle::quit
    pub fn run(&mut self) {
        self.shared.assert_in_loop_thread();
        assert!(!self.shared.looping.swap(true, Ordering::AcqRel));
        self.shared.quit.store(false, Ordering::Release);
        debug!("EventLoop start looping");

        while !self.shared.quit.load(Ordering::Acquire) {
            self.active.clear();
            let receive_time =
                self.poller
                    .poll(POLL_TIMEOUT_MS, &mut self.events, &mut self.active);

            self.shared.event_handling.store(true, Ordering::Release);
            for handler in &self.active {
                self.current_active = Some(handler.fd());
                handler.handle_event(receive_time);
            }
            self.current_active = None;
            self.shared.event_handling.store(false, Ordering::Release);

            self.do_pending_tasks();
        }

        // teardown work submitted around quit must not be lost
        self.do_pending_tasks();
        self.shared.looping.store(false, Ordering::Release);
        debug!("EventLoop stop looping");
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.queue_in_loop(Box::new(task));
    }

    /// See [`LoopHandle::run_at`].
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timers.add_timer(Box::new(callback), when, None)
    }

    /// See [`LoopHandle::run_after`].
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timers
            .add_timer(Box::new(callback), Timestamp::now() + delay, None)
    }

    /// See [`LoopHandle::run_every`].
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timers.add_timer(
            Box::new(callback),
            Timestamp::now() + interval,
            Some(interval),
        )
    }

    /// See [`LoopHandle::cancel`].
    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// See [`LoopHandle::wakeup`].
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Panics when the calling thread does not own this loop.
    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }

    /// Swap the queue out under the lock, then run the tasks without it:
    /// callbacks never block submitters, and tasks queued by tasks are
    /// deferred to the next cycle (the queue rule wakes us for them).
    fn do_pending_tasks(&mut self) {
        let mut tasks = Vec::new();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::swap(&mut tasks, &mut *pending);
        }
        self.shared.calling_pending.store(true, Ordering::Release);
        if !tasks.is_empty() {
            trace!("{} pending task(s)", tasks.len());
        }
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("thread", &self.shared.thread_id)
            .field("looping", &self.shared.looping.load(Ordering::Acquire))
            .field(
                "event_handling",
                &self.shared.event_handling.load(Ordering::Acquire),
            )
            .field("current_active", &self.current_active)
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("EventLoop in thread {:?} gone", self.shared.thread_id);
        self.wake_handler.disable_all();
        self.wake_handler.remove();
        self.timer_handler.disable_all();
        self.timer_handler.remove();
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
    }
}
