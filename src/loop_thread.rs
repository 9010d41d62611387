use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

use crate::event_loop::{EventLoop, LoopHandle};

/// Callback invoked on each worker thread, on its own loop, before the
/// loop starts dispatching.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// A thread running its own [`EventLoop`].
///
/// The worker constructs the loop itself (so the loop is bound to the
/// worker thread), runs the init callback, publishes a handle through a
/// startup barrier and then dispatches until quit. Dropping the wrapper
/// quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    handle: Option<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Creates a (not yet started) loop thread.
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            handle: None,
            thread: None,
        }
    }

    /// Spawns the worker and blocks until its loop is up, returning a
    /// handle to it.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");

        let rendezvous = Arc::new((Mutex::new(None::<LoopHandle>), Condvar::new()));
        let publish = Arc::clone(&rendezvous);
        let init = self.init.clone();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut event_loop = EventLoop::new().expect("failed to set up event loop");
                if let Some(init) = init {
                    (*init)(&event_loop.handle());
                }
                {
                    let (slot, condvar) = &*publish;
                    *slot.lock().unwrap() = Some(event_loop.handle());
                    condvar.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn loop thread");
        self.thread = Some(thread);

        let (slot, condvar) = &*rendezvous;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = condvar.wait(guard).unwrap();
        }
        let handle = guard.take().unwrap();
        self.handle = Some(handle.clone());
        handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

/// Pool of worker loop threads with round-robin assignment.
///
/// With zero workers the base loop doubles as the I/O loop and
/// [`get_next_loop`] hands it back.
///
/// [`get_next_loop`]: EventLoopPool::get_next_loop
pub struct EventLoopPool {
    base: LoopHandle,
    name: String,
    num_threads: usize,
    started: bool,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopPool {
    /// Creates an empty pool around the base loop. Worker threads are
    /// named `{name}{index}`.
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopPool {
        EventLoopPool {
            base,
            name: name.into(),
            num_threads: 0,
            started: false,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Sets the number of worker threads. Zero means the base loop serves
    /// connections too.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    /// Spawns the workers. Must run on the base loop's thread.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started);
        self.base.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let mut loop_thread =
                EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            self.loops.push(loop_thread.start_loop());
            self.threads.push(loop_thread);
        }
        debug!(
            "EventLoopPool [{}] started {} worker(s)",
            self.name,
            self.threads.len()
        );

        if self.num_threads == 0 {
            if let Some(init) = init {
                (*init)(&self.base);
            }
        }
    }

    /// Picks the next loop round-robin; the base loop when the pool is
    /// empty. Must run on the base loop's thread.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }

    /// Whether [`start`] has run.
    ///
    /// [`start`]: EventLoopPool::start
    pub fn started(&self) -> bool {
        self.started
    }
}
