use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::LoopHandle;
use crate::loop_thread::{EventLoopPool, ThreadInitCallback};
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerOption {
    /// Only `SO_REUSEADDR`.
    NoReusePort,
    /// Also `SO_REUSEPORT`, for one listening socket per process.
    ReusePort,
}

/// A TCP server: an acceptor on the base loop, a pool of worker loops and
/// a registry of live connections.
///
/// New connections are assigned to worker loops round-robin and live on
/// that loop until torn down. The server must outlive the connections it
/// issued; dropping it schedules teardown for everything still alive.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    handle: LoopHandle,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopPool>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
}

impl TcpServer {
    /// Creates a server listening (once [started]) on `listen_addr`, with
    /// its acceptor on the loop behind `handle`.
    ///
    /// [started]: TcpServer::start
    pub fn bind(
        handle: &LoopHandle,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(
            handle.clone(),
            listen_addr,
            option == ServerOption::ReusePort,
        )?;
        let ip_port = acceptor.local_addr()?.to_string();
        let inner = Arc::new(ServerInner {
            handle: handle.clone(),
            pool: Mutex::new(EventLoopPool::new(handle.clone(), name.clone())),
            name,
            ip_port,
            acceptor: Arc::clone(&acceptor),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            connection_callback: Mutex::new(
                Arc::new(default_connection_callback) as ConnectionCallback
            ),
            message_callback: Mutex::new(Arc::new(default_message_callback) as MessageCallback),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
        });

        let server = Arc::downgrade(&inner);
        acceptor.set_new_connection_callback(Box::new(move |socket, peer_addr| {
            if let Some(server) = server.upgrade() {
                ServerInner::new_connection(&server, socket, peer_addr);
            }
        }));
        Ok(TcpServer { inner })
    }

    /// The server's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound listen address, with the real port when 0 was requested.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    /// Handle to the base (acceptor) loop.
    pub fn handle(&self) -> &LoopHandle {
        &self.inner.handle
    }

    /// Number of worker loops; zero serves connections on the base loop.
    /// Must be called before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    /// Callback for connection establishment and teardown.
    pub fn set_connection_callback(
        &mut self,
        callback: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.inner.connection_callback.lock().unwrap() = Arc::new(callback);
    }

    /// Callback for incoming data.
    pub fn set_message_callback(
        &mut self,
        callback: impl Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.inner.message_callback.lock().unwrap() = Arc::new(callback);
    }

    /// Callback for output-buffer drain completion.
    pub fn set_write_complete_callback(
        &mut self,
        callback: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.inner.write_complete_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Callback for upward high-water-mark crossings.
    pub fn set_high_water_mark_callback(
        &mut self,
        callback: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        *self.inner.high_water_mark_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Callback run on every worker loop before it starts dispatching.
    pub fn set_thread_init_callback(
        &mut self,
        callback: impl Fn(&LoopHandle) + Send + Sync + 'static,
    ) {
        *self.inner.thread_init_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Starts the worker pool and the acceptor. Idempotent; safe to call
    /// from any thread.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.handle.run_in_loop(move || {
            let init = inner.thread_init_callback.lock().unwrap().clone();
            inner.pool.lock().unwrap().start(init);
            assert!(!inner.acceptor.listening());
            inner.acceptor.listen();
        });
    }
}

impl ServerInner {
    /// Base-loop side of a fresh accept: pick a worker loop, name and
    /// register the connection, install callbacks and hand it over.
    fn new_connection(inner: &Arc<ServerInner>, socket: Socket, peer_addr: SocketAddr) {
        inner.handle.assert_in_loop_thread();
        let io_loop = inner.pool.lock().unwrap().get_next_loop();
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            inner.name, conn_name, peer_addr
        );
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("getsockname failed: {}", err);
                return;
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        conn.set_connection_callback(inner.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(inner.message_callback.lock().unwrap().clone());
        if let Some(callback) = inner.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(callback);
        }
        if let Some(callback) = inner.high_water_mark_callback.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(callback);
        }
        // weak: the connection must not keep its server alive
        let server = Arc::downgrade(inner);
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(server) = server.upgrade() {
                ServerInner::remove_connection(&server, Arc::clone(conn));
            }
        }));

        inner
            .connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&conn));
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Runs on the connection's loop (it is the close callback); hops to
    /// the base loop for deregistration.
    fn remove_connection(inner: &Arc<ServerInner>, conn: Arc<TcpConnection>) {
        let server = Arc::clone(inner);
        inner
            .handle
            .run_in_loop(move || ServerInner::remove_connection_in_loop(&server, conn));
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, conn: Arc<TcpConnection>) {
        inner.handle.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            inner.name,
            conn.name()
        );
        let removed = inner.connections.lock().unwrap().remove(conn.name());
        if removed.is_none() {
            // a concurrent server drop already drained the registry;
            // connect_destroyed is idempotent, scheduling twice is fine
            debug!("connection {} already deregistered", conn.name());
        }
        let io_loop = conn.handle().clone();
        // queued, not run inline: the worker loop must finish its current
        // dispatch before the handler is removed
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!("TcpServer::drop [{}]", self.inner.name);
        let connections: Vec<Arc<TcpConnection>> = self
            .inner
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let io_loop = conn.handle().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
