use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::socket::{self, Socket};

/// Invoked on the acceptor's loop with each freshly accepted socket. The fd
/// is already non-blocking and close-on-exec; ownership transfers to the
/// callback.
pub type NewConnectionCallback = Box<dyn FnMut(OwnedFd, SocketAddr) + Send>;

struct Inner {
    handle: LoopHandle,
    socket: Socket,
    /// Spare fd used to accept-then-drop when the process is out of fds.
    idle_fd: Mutex<Option<OwnedFd>>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

/// Listening-socket state machine running on the base loop.
///
/// Construction binds; [`listen`] arms the socket and its read channel. Each
/// readable event accepts one peer and hands it to the new-connection
/// callback.
///
/// [`listen`]: Acceptor::listen
pub struct Acceptor {
    inner: Arc<Inner>,
    channel: Arc<Channel>,
}

impl Acceptor {
    pub fn new(
        handle: &LoopHandle,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Acceptor> {
        let socket = Socket::for_addr(listen_addr)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;

        let channel = Channel::new(handle, socket.as_raw_fd());
        let inner = Arc::new(Inner {
            handle: handle.clone(),
            socket,
            idle_fd: Mutex::new(socket::open_dev_null().ok()),
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        channel.set_read_callback(Box::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_read();
            }
        }));

        Ok(Acceptor { inner, channel })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self
            .inner
            .new_connection_cb
            .lock()
            .expect("acceptor poisoned") = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Start listening and enable the read channel. Base-loop thread only.
    pub fn listen(&self) -> io::Result<()> {
        self.inner.handle.assert_in_loop_thread();
        self.inner.listening.store(true, Ordering::SeqCst);
        self.inner.socket.listen(libc::SOMAXCONN)?;
        self.channel.enable_reading();
        Ok(())
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let channel = Arc::clone(&self.channel);
        let inner = Arc::clone(&self.inner);
        let cleanup = move || {
            channel.disable_all();
            channel.remove();
            // `inner` (and with it the listen fd) must outlive the poller
            // registration.
            drop(inner);
        };
        if self.inner.handle.is_in_loop_thread() {
            cleanup();
        } else {
            self.inner.handle.run_in_loop(cleanup);
        }
    }
}

impl Inner {
    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                let mut cb = self.new_connection_cb.lock().expect("acceptor poisoned");
                match cb.as_mut() {
                    Some(cb) => cb(socket.into(), peer_addr),
                    // Nobody wants it; closing refuses the connection.
                    None => drop(socket),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EMFILE) => {
                // Out of fds: the pending connection would stay in the
                // backlog and re-trigger the poller forever. Sacrifice the
                // idle fd to accept-then-close it, then take the fd back.
                // See "The special problem of accept()ing when you can't"
                // in libev's documentation.
                warn!("accept: process out of file descriptors");
                let mut idle = self.idle_fd.lock().expect("acceptor poisoned");
                idle.take();
                if let Ok((socket, _)) = self.socket.accept() {
                    drop(socket);
                }
                *idle = socket::open_dev_null().ok();
            }
            Err(err) => error!("accept failed: {}", err),
        }
    }
}
