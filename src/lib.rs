//! A callback-driven TCP server runtime for Linux.
//!
//! Gyre implements the one-loop-per-thread reactor pattern: every worker
//! thread owns an [`EventLoop`] that multiplexes readiness with
//! level-triggered epoll, dispatches ready descriptors to per-descriptor
//! handlers, runs a timerfd-backed timer queue and drains a cross-thread
//! task queue woken through an eventfd.
//!
//! A [`TcpServer`] accepts on its base loop, spreads connections over a
//! pool of worker loops round-robin, and drives user code through five
//! callbacks: connection up/down, message, write complete, high-water
//! mark and (internally) close. A [`TcpConnection`] is a shared handle;
//! `send`, `shutdown` and `force_close` may be called from any thread
//! and are delivered to the owning loop in submission order.
//!
//! # Examples
//!
//! An echo server on four worker threads:
//!
//! ```no_run
//! use gyre::{EventLoop, ServerOption, TcpServer};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut event_loop = EventLoop::new()?;
//! let mut server = TcpServer::bind(
//!     &event_loop.handle(),
//!     "127.0.0.1:9981".parse().unwrap(),
//!     "echo",
//!     ServerOption::NoReusePort,
//! )?;
//! server.set_message_callback(|conn, buf, _when| {
//!     let data = buf.retrieve_all_as_bytes();
//!     conn.send(&data);
//! });
//! server.set_thread_num(4);
//! server.start();
//! event_loop.run();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("gyre requires epoll, timerfd and eventfd (Linux or Android)");

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod connection;
mod event_loop;
mod handler;
mod interest;
mod loop_thread;
mod poller;
mod server;
mod socket;
mod timer;
mod timestamp;
mod waker;

pub use crate::buffer::Buffer;
pub use crate::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::interest::Interest;
pub use crate::loop_thread::{EventLoopPool, EventLoopThread, ThreadInitCallback};
pub use crate::server::{ServerOption, TcpServer};
pub use crate::socket::Socket;
pub use crate::timer::TimerId;
pub use crate::timestamp::Timestamp;
