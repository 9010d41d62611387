use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use gyre::{EventLoopThread, Timestamp, TimerId};

mod util;

use util::init;

#[test]
fn run_after_fires_once() {
    init();

    let mut loop_thread = EventLoopThread::new("timer", None);
    let handle = loop_thread.start_loop();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    handle.run_after(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_before_expiry_suppresses_the_callback() {
    init();

    let mut loop_thread = EventLoopThread::new("cancel", None);
    let handle = loop_thread.start_loop();

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first);
    let t1 = handle.run_after(Duration::from_millis(200), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&second);
    let _t2 = handle.run_after(Duration::from_millis(300), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // cancel t1 from another thread well before it is due
    thread::sleep(Duration::from_millis(50));
    handle.cancel(t1);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[test]
fn periodic_timer_cancelled_from_its_own_callback() {
    init();

    let mut loop_thread = EventLoopThread::new("periodic", None);
    let handle = loop_thread.start_loop();

    let fires = Arc::new(AtomicUsize::new(0));
    let own_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&fires);
    let id_slot = Arc::clone(&own_id);
    let cancel_handle = handle.clone();
    let id = handle.run_every(Duration::from_millis(50), move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 3 {
            // cancel-while-firing: the reset step must not re-arm us
            if let Some(id) = *id_slot.lock().unwrap() {
                cancel_handle.cancel(id);
            }
        }
    });
    *own_id.lock().unwrap() = Some(id);

    thread::sleep(Duration::from_millis(600));
    assert_eq!(fires.load(Ordering::SeqCst), 3);
}

#[test]
fn identical_expirations_fire_in_submission_order() {
    init();

    let mut loop_thread = EventLoopThread::new("order", None);
    let handle = loop_thread.start_loop();

    let when = Timestamp::now() + Duration::from_millis(100);
    let (sender, receiver) = mpsc::channel();
    for i in 0..3 {
        let sender = sender.clone();
        handle.run_at(when, move || sender.send(i).unwrap());
    }

    for expected in 0..3 {
        let got = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("timer did not fire");
        assert_eq!(got, expected);
    }
}

#[test]
fn stale_cancel_is_a_no_op() {
    init();

    let mut loop_thread = EventLoopThread::new("stale", None);
    let handle = loop_thread.start_loop();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let id = handle.run_after(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    util::wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 1);

    // the timer is long gone; cancelling must neither panic nor disturb
    // anything scheduled later
    handle.cancel(id);

    let fired_again = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired_again);
    handle.run_after(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    util::wait_until(Duration::from_secs(5), || {
        fired_again.load(Ordering::SeqCst) == 1
    });
}
