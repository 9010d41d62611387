use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;

use gyre::{EventLoopThread, ServerOption, TcpConnection, TcpServer};

mod util;

use util::{connect_with_retry, init, wait_until};

type ConnSlot = Arc<Mutex<Option<Arc<TcpConnection>>>>;

#[test]
fn echo_single_connection() {
    init();

    let mut loop_thread = EventLoopThread::new("echo-main", None);
    let handle = loop_thread.start_loop();

    let down = Arc::new(AtomicUsize::new(0));
    let mut server = TcpServer::bind(
        &handle,
        "127.0.0.1:0".parse().unwrap(),
        "echo",
        ServerOption::NoReusePort,
    )
    .expect("unable to bind");
    server.set_message_callback(|conn, buf, _when| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });
    let counter = Arc::clone(&down);
    server.set_connection_callback(move |conn| {
        if conn.disconnected() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.start();

    let addr = server.local_addr().unwrap();
    let mut stream = connect_with_retry(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut buf = [0u8; 5];
    stream.write_all(b"hello").unwrap();
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    stream.write_all(b"world").unwrap();
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"world");

    // half close: the server observes EOF and tears the connection down
    stream.shutdown(Shutdown::Write).unwrap();
    wait_until(Duration::from_secs(5), || down.load(Ordering::SeqCst) == 1);
}

#[test]
fn cross_thread_sends_arrive_in_submission_order() {
    init();

    let mut loop_thread = EventLoopThread::new("order-main", None);
    let handle = loop_thread.start_loop();

    let slot: ConnSlot = Arc::new(Mutex::new(None));
    let mut server = TcpServer::bind(
        &handle,
        "127.0.0.1:0".parse().unwrap(),
        "order",
        ServerOption::NoReusePort,
    )
    .expect("unable to bind");
    server.set_thread_num(4);
    let publish = Arc::clone(&slot);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            *publish.lock().unwrap() = Some(Arc::clone(conn));
        }
    });
    server.start();

    let addr = server.local_addr().unwrap();
    let mut stream = connect_with_retry(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    wait_until(Duration::from_secs(5), || slot.lock().unwrap().is_some());
    let conn = slot.lock().unwrap().clone().unwrap();

    // a producer that does not own the connection's loop
    let producer = thread::spawn(move || {
        conn.send(b"A");
        conn.send(b"B");
        conn.send(b"C");
    });
    producer.join().unwrap();

    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ABC");

    slot.lock().unwrap().take();
}

#[test]
fn high_water_mark_fires_once_and_write_completes() {
    const MARK: usize = 1024;
    const PAYLOAD_LEN: usize = 8 * 1024 * 1024;

    init();

    let mut loop_thread = EventLoopThread::new("hwm-main", None);
    let handle = loop_thread.start_loop();

    let slot: ConnSlot = Arc::new(Mutex::new(None));
    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_total = Arc::new(AtomicUsize::new(0));
    let write_complete = Arc::new(AtomicUsize::new(0));

    let mut server = TcpServer::bind(
        &handle,
        "127.0.0.1:0".parse().unwrap(),
        "hwm",
        ServerOption::NoReusePort,
    )
    .expect("unable to bind");
    let publish = Arc::clone(&slot);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.set_high_water_mark(MARK);
            *publish.lock().unwrap() = Some(Arc::clone(conn));
        }
    });
    let hits = Arc::clone(&hwm_hits);
    let total = Arc::clone(&hwm_total);
    server.set_high_water_mark_callback(move |_conn, len| {
        hits.fetch_add(1, Ordering::SeqCst);
        total.store(len, Ordering::SeqCst);
    });
    let completions = Arc::clone(&write_complete);
    server.set_write_complete_callback(move |_conn| {
        completions.fetch_add(1, Ordering::SeqCst);
    });
    server.start();

    let addr = server.local_addr().unwrap();
    let mut stream = connect_with_retry(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    wait_until(Duration::from_secs(5), || slot.lock().unwrap().is_some());
    let conn = slot.lock().unwrap().clone().unwrap();

    let mut payload = vec![0u8; PAYLOAD_LEN];
    rand::rng().fill(&mut payload[..]);

    // the slow peer is not reading yet; one nonblocking write cannot
    // take all of this, so the rest lands in the output buffer and
    // crosses the mark exactly once
    conn.send(&payload);
    wait_until(Duration::from_secs(5), || {
        hwm_hits.load(Ordering::SeqCst) == 1
    });
    assert!(hwm_total.load(Ordering::SeqCst) >= MARK);

    // now drain; the write-complete callback fires exactly once
    let mut received = vec![0u8; PAYLOAD_LEN];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    wait_until(Duration::from_secs(30), || {
        write_complete.load(Ordering::SeqCst) == 1
    });
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);

    slot.lock().unwrap().take();
}

#[test]
fn force_close_twice_reports_down_exactly_once() {
    init();

    let mut loop_thread = EventLoopThread::new("close-main", None);
    let handle = loop_thread.start_loop();

    let slot: ConnSlot = Arc::new(Mutex::new(None));
    let down = Arc::new(AtomicUsize::new(0));

    let mut server = TcpServer::bind(
        &handle,
        "127.0.0.1:0".parse().unwrap(),
        "close",
        ServerOption::NoReusePort,
    )
    .expect("unable to bind");
    let publish = Arc::clone(&slot);
    let counter = Arc::clone(&down);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            *publish.lock().unwrap() = Some(Arc::clone(conn));
        } else if conn.disconnected() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.start();

    let addr = server.local_addr().unwrap();
    let mut stream = connect_with_retry(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    wait_until(Duration::from_secs(5), || slot.lock().unwrap().is_some());
    let conn = slot.lock().unwrap().clone().unwrap();

    conn.force_close();
    conn.force_close();

    wait_until(Duration::from_secs(5), || down.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(down.load(Ordering::SeqCst), 1);

    // release our references so the socket closes; the peer gets EOF
    drop(conn);
    slot.lock().unwrap().take();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn send_then_shutdown_delivers_everything_then_eof() {
    const PAYLOAD_LEN: usize = 300 * 1024;

    init();

    let mut loop_thread = EventLoopThread::new("drain-main", None);
    let handle = loop_thread.start_loop();

    let mut payload = vec![0u8; PAYLOAD_LEN];
    rand::rng().fill(&mut payload[..]);
    let payload = Arc::new(payload);

    let mut server = TcpServer::bind(
        &handle,
        "127.0.0.1:0".parse().unwrap(),
        "drain",
        ServerOption::NoReusePort,
    )
    .expect("unable to bind");
    let to_send = Arc::clone(&payload);
    server.set_message_callback(move |conn, buf, _when| {
        buf.retrieve_all();
        // a send bigger than one nonblocking write, then a shutdown:
        // the write half must close only after the drain
        conn.send(&to_send);
        conn.shutdown();
    });
    server.start();

    let addr = server.local_addr().unwrap();
    let mut stream = connect_with_retry(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    stream.write_all(b"go").unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    assert_eq!(received, *payload);
}

#[test]
fn thread_init_callback_runs_on_every_worker() {
    init();

    let mut loop_thread = EventLoopThread::new("init-main", None);
    let handle = loop_thread.start_loop();

    let inits = Arc::new(AtomicUsize::new(0));
    let mut server = TcpServer::bind(
        &handle,
        "127.0.0.1:0".parse().unwrap(),
        "init",
        ServerOption::NoReusePort,
    )
    .expect("unable to bind");
    server.set_thread_num(2);
    let counter = Arc::clone(&inits);
    server.set_thread_init_callback(move |_handle| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.start();

    wait_until(Duration::from_secs(5), || inits.load(Ordering::SeqCst) == 2);
}

#[test]
fn connections_get_distinct_names() {
    init();

    let mut loop_thread = EventLoopThread::new("names-main", None);
    let handle = loop_thread.start_loop();

    let names = Arc::new(Mutex::new(Vec::new()));
    let mut server = TcpServer::bind(
        &handle,
        "127.0.0.1:0".parse().unwrap(),
        "names",
        ServerOption::NoReusePort,
    )
    .expect("unable to bind");
    let collect = Arc::clone(&names);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            collect.lock().unwrap().push(conn.name().to_string());
        }
    });
    server.start();

    let addr = server.local_addr().unwrap();
    let first = connect_with_retry(addr);
    let second = connect_with_retry(addr);
    wait_until(Duration::from_secs(5), || names.lock().unwrap().len() == 2);

    let names = names.lock().unwrap();
    assert_ne!(names[0], names[1]);
    assert!(names[0].starts_with("names-"));

    drop(first);
    drop(second);
}
