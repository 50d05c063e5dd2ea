//! Multi-threaded reactor-pattern TCP networking.
//!
//! `revent` demultiplexes events from many sockets onto a fixed pool of
//! event loops, one pinned to each worker thread ("one loop per thread").
//! Each [`EventLoop`] polls its own fds, dispatches readiness to per-fd
//! [`Channel`]s, runs due timers from a timerfd-backed [`TimerId`] queue,
//! and drains a cross-thread task queue woken through an eventfd.
//!
//! Servers are built from the [`net::TcpServer`] façade: an acceptor on the
//! base loop hands each new socket to a worker loop round-robin, where it
//! lives as a [`net::TcpConnection`] with buffered, non-blocking I/O. User
//! code plugs in through four narrow callbacks (connection, message,
//! write-complete, high-water); every callback runs on its connection's
//! loop thread and must not block.
//!
//! ```no_run
//! use std::sync::Arc;
//! use revent::net::TcpServer;
//! use revent::EventLoop;
//!
//! let mut base = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:7000".parse().unwrap();
//! let server = TcpServer::new(&base.handle(), &addr, "echo", false).unwrap();
//! server.set_message_callback(Arc::new(|conn, buf, _at| {
//!     let msg = buf.retrieve_all_as_bytes();
//!     conn.send(&msg);
//! }));
//! server.set_thread_num(4);
//! server.start();
//! base.run();
//! ```
//!
//! Loop-owned state is mutated only from the owning thread; violations
//! panic. Other threads interact through the sendable [`LoopHandle`]
//! (`run_in_loop`, timers, `quit`) or the thread-safe connection methods
//! (`send`, `shutdown`, `force_close`).

mod buffer;
mod channel;
mod event_loop;
mod interest;
pub mod net;
mod pool;
mod poller;
mod sys;
mod timer;

pub use crate::buffer::Buffer;
pub use crate::channel::{Channel, EventCallback, ReadCallback};
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::interest::{Interest, Ready};
pub use crate::pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use crate::timer::TimerId;
