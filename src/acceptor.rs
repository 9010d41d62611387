use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info, warn};

use crate::event_loop::LoopHandle;
use crate::handler::Handler;
use crate::socket::Socket;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Accepts connections on a listening socket, on the server's base loop.
///
/// Readiness triggers an accept loop that drains the backlog until
/// `EAGAIN`, amortising the wakeup under connection bursts. A reserved
/// idle descriptor (`/dev/null`) makes `EMFILE` survivable: release it,
/// accept and drop the pending connection, reserve again.
pub(crate) struct Acceptor {
    handle: LoopHandle,
    socket: Socket,
    handler: Arc<Handler>,
    idle_fd: Mutex<Option<OwnedFd>>,
    listening: AtomicBool,
    on_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub(crate) fn new(
        handle: LoopHandle,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::bind(listen_addr, reuse_port)?;
        let idle_fd = open_idle_fd()?;
        Ok(Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let handler = Handler::new(
                Arc::clone(&handle.shared),
                Arc::clone(&handle.poller),
                socket.as_raw_fd(),
            );
            let acceptor = Weak::clone(weak);
            handler.set_read_callback(move |_| {
                if let Some(acceptor) = acceptor.upgrade() {
                    acceptor.handle_read();
                }
            });
            Acceptor {
                handle,
                socket,
                handler,
                idle_fd: Mutex::new(Some(idle_fd)),
                listening: AtomicBool::new(false),
                on_connection: Mutex::new(None),
            }
        }))
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_connection.lock().unwrap() = Some(callback);
    }

    /// The bound address, with the real port when 0 was requested.
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Starts listening and watches for readability. Runs on the base
    /// loop; failure to listen is a setup error and fatal.
    pub(crate) fn listen(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(err) = self.socket.listen() {
            error!("listen failed: {}", err);
            panic!("listen failed: {}", err);
        }
        self.handler.enable_reading();
        match self.local_addr() {
            Ok(addr) => info!("accepting connections on {}", addr),
            Err(_) => info!("accepting connections"),
        }
    }

    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        loop {
            match self.accept_one() {
                Ok(Some((socket, peer_addr))) => {
                    let mut callback = self.on_connection.lock().unwrap();
                    match callback.as_mut() {
                        Some(callback) => callback(socket, peer_addr),
                        // nobody wants it; closing refuses the connection
                        None => drop(socket),
                    }
                }
                Ok(None) => break,
                Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                    warn!("accept: out of file descriptors");
                    self.shed_connection();
                }
                Err(err) => {
                    error!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn accept_one(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        loop {
            match syscall!(accept4(
                self.socket.as_raw_fd(),
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
            )) {
                Ok(fd) => {
                    let socket = unsafe { Socket::from_raw_fd(fd) };
                    match socket.peer_addr() {
                        Ok(peer_addr) => return Ok(Some((socket, peer_addr))),
                        // peer vanished between accept and getpeername
                        Err(err) => {
                            warn!("peer address unavailable for accepted fd: {}", err);
                            continue;
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// EMFILE recovery: free the reserve so accept has a descriptor, drop
    /// the excess connection, then reserve again.
    fn shed_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        idle.take();
        if let Ok(fd) = syscall!(accept(
            self.socket.as_raw_fd(),
            ptr::null_mut(),
            ptr::null_mut()
        )) {
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        match open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(err) => error!("unable to re-reserve idle fd: {}", err),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let handler = Arc::clone(&self.handler);
        self.handle.run_in_loop(move || {
            handler.disable_all();
            handler.remove();
        });
    }
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
