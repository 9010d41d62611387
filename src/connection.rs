use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::event_loop::LoopHandle;
use crate::handler::Handler;
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Invoked when a connection is established and again when it goes down.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked with the input buffer whenever data arrived.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
/// Invoked when the output buffer drained completely.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked when a send pushed the output buffer across the high-water
/// mark, with the new total.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub(crate) type CloseCallback = Box<dyn FnOnce(&Arc<TcpConnection>) + Send>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

/// The default connection callback: logs the transition.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "up" } else { "down" }
    );
    // no force_close here: registering only a message callback is fine
}

/// The default message callback: a drain-all sink.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _when: Timestamp) {
    buf.retrieve_all();
}

/// One established TCP connection, owned by a single loop.
///
/// Shared between the server's registry and any in-flight tasks; use it
/// through `Arc`. `send`, `shutdown` and `force_close` are callable from
/// any thread — off-loop calls hop to the owning loop, and sends from one
/// thread reach the wire in submission order.
///
/// Lifecycle is forward-only: connecting → connected → disconnecting →
/// disconnected. The socket closes when the last reference drops, which
/// requires the disconnected state.
pub struct TcpConnection {
    handle: LoopHandle,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    handler: Arc<Handler>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    high_water_mark: AtomicUsize,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(
        handle: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let handler = Handler::new(
                Arc::clone(&handle.shared),
                Arc::clone(&handle.poller),
                socket.as_raw_fd(),
            );
            {
                let conn = Weak::clone(weak);
                handler.set_read_callback(move |receive_time| {
                    if let Some(conn) = conn.upgrade() {
                        conn.handle_read(receive_time);
                    }
                });
            }
            {
                let conn = Weak::clone(weak);
                handler.set_write_callback(move || {
                    if let Some(conn) = conn.upgrade() {
                        conn.handle_write();
                    }
                });
            }
            {
                let conn = Weak::clone(weak);
                handler.set_close_callback(move || {
                    if let Some(conn) = conn.upgrade() {
                        conn.handle_close();
                    }
                });
            }
            {
                let conn = Weak::clone(weak);
                handler.set_error_callback(move || {
                    if let Some(conn) = conn.upgrade() {
                        conn.handle_error();
                    }
                });
            }
            TcpConnection {
                handle,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                reading: AtomicBool::new(true),
                socket,
                handler,
                local_addr,
                peer_addr,
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                connection_callback: Mutex::new(
                    Arc::new(default_connection_callback) as ConnectionCallback
                ),
                message_callback: Mutex::new(Arc::new(default_message_callback) as MessageCallback),
                write_complete_callback: Mutex::new(None),
                high_water_mark_callback: Mutex::new(None),
                close_callback: Mutex::new(None),
            }
        });
        debug!(
            "TcpConnection::new [{}] fd={}",
            conn.name,
            conn.socket.as_raw_fd()
        );
        if let Err(err) = conn.socket.set_keep_alive(true) {
            warn!("{}: set_keepalive failed: {}", conn.name, err);
        }
        conn
    }

    /// The connection's unique name within its server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local endpoint of the socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote endpoint of the socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle to the loop that owns this connection.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Whether the connection is up.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Whether the connection reached its terminal state.
    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Whether the read side is watched for input.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Toggles `TCP_NODELAY`.
    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = self.socket.set_nodelay(on) {
            warn!("{}: set_nodelay failed: {}", self.name, err);
        }
    }

    /// Output-buffer size that triggers the high-water-mark callback when
    /// crossed upward. Defaults to 64 MiB.
    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    /// Replaces the connection callback.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = callback;
    }

    /// Replaces the message callback.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = callback;
    }

    /// Installs the write-complete callback.
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    /// Installs the high-water-mark callback.
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback) {
        *self.high_water_mark_callback.lock().unwrap() = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(callback);
    }

    /// Sends `data`, from any thread. On the owning loop this writes
    /// directly; elsewhere the bytes are copied and the write hops to the
    /// loop, preserving per-thread submission order.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let message = data.to_vec();
            let conn = Arc::clone(self);
            self.handle.run_in_loop(move || conn.send_in_loop(&message));
        }
    }

    /// Sends and drains the readable region of `buf`.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let message = buf.retrieve_all_as_bytes();
            let conn = Arc::clone(self);
            self.handle.run_in_loop(move || conn.send_in_loop(&message));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("{}: disconnected, give up writing", self.name);
            return;
        }
        let mut written = 0;
        let mut fault = false;
        let mut output = self.output.lock().unwrap();
        // nothing queued: try writing directly, skipping the buffer
        if !self.handler.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone()
                        {
                            let conn = Arc::clone(self);
                            self.handle.queue_in_loop(move || (*callback)(&conn));
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("{}: write failed: {}", self.name, err);
                    if matches!(
                        err.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(callback) = self.high_water_mark_callback.lock().unwrap().clone() {
                    let conn = Arc::clone(self);
                    let total = old_len + remaining;
                    self.handle.queue_in_loop(move || (*callback)(&conn, total));
                }
            }
            // appending keeps the bytes ordered behind what is in flight
            output.append(&data[written..]);
            if !self.handler.is_writing() {
                self.handler.enable_writing();
            }
        }
    }

    /// Closes the write half once everything queued has drained. No-op
    /// unless the connection is up.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = Arc::clone(self);
            self.handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        if !self.handler.is_writing() {
            // nothing in flight; otherwise handle_write shuts down after
            // the drain
            self.socket.shutdown_write();
        }
    }

    /// Tears the connection down as if the peer had closed it. Also
    /// accepted while disconnecting, so a forced close terminates a
    /// pending drain.
    pub fn force_close(self: &Arc<Self>) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let conn = Arc::clone(self);
            self.handle.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Like [`force_close`], delayed by `delay`; a connection that closed
    /// in the meantime is left alone.
    ///
    /// [`force_close`]: TcpConnection::force_close
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let conn = Arc::downgrade(self);
            // not force_close_in_loop, to avoid racing a concurrent close
            self.handle.run_after(delay, move || {
                if let Some(conn) = conn.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            // as if we read 0 bytes
            self.handle_close();
        }
    }

    /// Resumes watching the read side.
    pub fn start_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.handle.run_in_loop(move || conn.start_read_in_loop());
    }

    fn start_read_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        if !self.reading.load(Ordering::Acquire) || !self.handler.is_reading() {
            self.handler.enable_reading();
            self.reading.store(true, Ordering::Release);
        }
    }

    /// Stops watching the read side; backpressure towards the peer.
    pub fn stop_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.handle.run_in_loop(move || conn.stop_read_in_loop());
    }

    fn stop_read_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        if self.reading.load(Ordering::Acquire) || self.handler.is_reading() {
            self.handler.disable_reading();
            self.reading.store(false, Ordering::Release);
        }
    }

    /// One-shot completion of the server handshake, on the owning loop:
    /// ties the handler to this connection, starts reading and notifies
    /// the user.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        self.handler.tie(self);
        self.handler.enable_reading();

        let callback = self.connection_callback.lock().unwrap().clone();
        (*callback)(self);
    }

    /// Final detach from the loop, scheduled by the server after
    /// deregistration. Idempotent against a prior [`handle_close`].
    ///
    /// [`handle_close`]: Self::handle_close
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.handler.disable_all();

            let callback = self.connection_callback.lock().unwrap().clone();
            (*callback)(self);
        }
        self.handler.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.handle.assert_in_loop_thread();
        let mut input = self.input.lock().unwrap();
        match input.read_fd(self.socket.as_raw_fd()) {
            Ok(0) => {
                // peer closed
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                trace!("{}: read {} byte(s)", self.name, n);
                let callback = self.message_callback.lock().unwrap().clone();
                (*callback)(self, &mut input, receive_time);
            }
            Err(ref err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                drop(input);
                error!("{}: read failed: {}", self.name, err);
                self.handle_error();
                if err.kind() == io::ErrorKind::ConnectionReset {
                    self.handle_close();
                }
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if !self.handler.is_writing() {
            trace!("{}: down, no more writing", self.name);
            return;
        }
        let mut output = self.output.lock().unwrap();
        let mut drained_while_disconnecting = false;
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.handler.disable_writing();
                    if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
                        let conn = Arc::clone(self);
                        self.handle.queue_in_loop(move || (*callback)(&conn));
                    }
                    drained_while_disconnecting = self.state() == State::Disconnecting;
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            // not fatal here: the read side will observe the close
            Err(err) => error!("{}: write failed: {}", self.name, err),
        }
        drop(output);
        if drained_while_disconnecting {
            self.shutdown_in_loop();
        }
    }

    /// Both ends of teardown meet here: the peer closing (read returned
    /// zero) and a forced close. Notifies the user, then lets the server
    /// deregister this connection — that callback must stay last.
    fn handle_close(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        let state = self.state();
        trace!(
            "{}: fd={} state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            state
        );
        assert!(state == State::Connected || state == State::Disconnecting);
        // the fd itself stays open until drop, so leaks are visible
        self.set_state(State::Disconnected);
        self.handler.disable_all();

        let guard = Arc::clone(self);
        let callback = self.connection_callback.lock().unwrap().clone();
        (*callback)(&guard);

        if let Some(close_callback) = self.close_callback.lock().unwrap().take() {
            close_callback(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!("{}: SO_ERROR = {}", self.name, err),
            Ok(None) => error!("{}: error event without SO_ERROR", self.name),
            Err(err) => error!("{}: failed to read SO_ERROR: {}", self.name, err),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state()
        );
        debug_assert_eq!(self.state(), State::Disconnected);
    }
}
