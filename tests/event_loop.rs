use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use gyre::{EventLoop, EventLoopThread, LoopHandle};

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn handle_is_send_and_sync() {
    assert_send::<LoopHandle>();
    assert_sync::<LoopHandle>();
}

#[test]
fn run_in_loop_on_owning_thread_is_immediate() {
    init();

    let event_loop = EventLoop::new().expect("unable to create event loop");
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));

    // executed synchronously, the loop is not even running
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn queued_tasks_run_in_fifo_order() {
    init();

    let mut loop_thread = EventLoopThread::new("fifo", None);
    let handle = loop_thread.start_loop();

    let (sender, receiver) = mpsc::channel();
    for i in 0..10 {
        let sender = sender.clone();
        handle.queue_in_loop(move || sender.send(i).unwrap());
    }

    for expected in 0..10 {
        let got = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("task did not run");
        assert_eq!(got, expected);
    }
}

#[test]
fn cross_thread_task_wakes_a_blocked_poll() {
    init();

    let mut loop_thread = EventLoopThread::new("wake", None);
    let handle = loop_thread.start_loop();

    // the loop is now idle inside poll; a submission must not wait for
    // the poll timeout
    let (sender, receiver) = mpsc::channel();
    let start = Instant::now();
    handle.run_in_loop(move || sender.send(()).unwrap());
    receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("task did not run");
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn quit_from_another_thread_stops_the_loop() {
    init();

    let mut loop_thread = EventLoopThread::new("quit", None);
    let handle = loop_thread.start_loop();

    let start = Instant::now();
    handle.quit();
    // drop joins the worker; it must not sit out the 10s poll timeout
    drop(loop_thread);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn second_loop_in_one_thread_is_refused() {
    init();

    let _first = EventLoop::new().expect("unable to create event loop");
    let second = panic::catch_unwind(|| EventLoop::new());
    assert!(second.is_err());
}

#[test]
fn tasks_queued_by_tasks_are_deferred_but_not_lost() {
    init();

    let mut loop_thread = EventLoopThread::new("requeue", None);
    let handle = loop_thread.start_loop();

    let (sender, receiver) = mpsc::channel();
    let inner_handle = handle.clone();
    handle.queue_in_loop(move || {
        let sender = sender.clone();
        // queued while the loop drains its queue: needs its own wakeup
        inner_handle.queue_in_loop(move || sender.send(()).unwrap());
    });

    receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("inner task did not run");
}
