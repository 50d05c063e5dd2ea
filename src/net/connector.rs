use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::Socket;
use crate::timer::TimerId;

/// Receives the connected socket once the handshake completes; ownership
/// transfers to the callback.
pub type NewConnectionCallback = Box<dyn FnMut(OwnedFd) + Send>;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    handle: LoopHandle,
    server_addr: SocketAddr,
    /// Intent flag: `start` raises it, `stop` lowers it. Every step of the
    /// state machine re-checks it, so a stop wins over an in-flight
    /// writable event or a scheduled retry.
    connect: AtomicBool,
    state: Mutex<State>,
    retry_delay: Mutex<Duration>,
    /// The half-open socket while a connect is in flight.
    pending: Mutex<Option<Socket>>,
    channel: Mutex<Option<Arc<Channel>>>,
    retry_timer: Mutex<Option<TimerId>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

/// Outgoing-connect state machine with exponential backoff.
///
/// Transient connect failures (refused, unreachable, address in use) retry
/// after 500 ms, doubling up to a 30 s ceiling. A writable event on the
/// half-open socket is confirmed with `SO_ERROR` and a self-connect check
/// before the socket is handed over.
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    pub fn new(handle: &LoopHandle, server_addr: SocketAddr) -> Connector {
        Connector {
            inner: Arc::new(Inner {
                handle: handle.clone(),
                server_addr,
                connect: AtomicBool::new(false),
                state: Mutex::new(State::Disconnected),
                retry_delay: Mutex::new(INIT_RETRY_DELAY),
                pending: Mutex::new(None),
                channel: Mutex::new(None),
                retry_timer: Mutex::new(None),
                new_connection_cb: Mutex::new(None),
            }),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self
            .inner
            .new_connection_cb
            .lock()
            .expect("connector poisoned") = Some(cb);
    }

    /// Begin connecting. Safe from any thread.
    pub fn start(&self) {
        self.inner.connect.store(true, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        self.inner.handle.run_in_loop(move || {
            if let Some(inner) = weak.upgrade() {
                inner.start_in_loop();
            }
        });
    }

    /// Give up: cancel any scheduled retry and abandon a half-open connect.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        self.inner.handle.queue_in_loop(move || {
            if let Some(inner) = weak.upgrade() {
                inner.stop_in_loop();
            }
        });
    }

    /// Connect again from scratch with the initial backoff delay. Loop
    /// thread only; used by the client façade for reconnects.
    pub fn restart(&self) {
        self.inner.handle.assert_in_loop_thread();
        *self.inner.state.lock().expect("connector poisoned") = State::Disconnected;
        *self.inner.retry_delay.lock().expect("connector poisoned") = INIT_RETRY_DELAY;
        self.inner.connect.store(true, Ordering::SeqCst);
        self.inner.start_in_loop();
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let channel = self.inner.channel.lock().expect("connector poisoned").take();
        if let Some(channel) = channel {
            let socket = self.inner.pending.lock().expect("connector poisoned").take();
            let cleanup = move || {
                channel.disable_all();
                channel.remove();
                drop(socket);
            };
            if self.inner.handle.is_in_loop_thread() {
                cleanup();
            } else {
                self.inner.handle.run_in_loop(cleanup);
            }
        }
    }
}

impl Inner {
    fn state(&self) -> State {
        *self.state.lock().expect("connector poisoned")
    }

    fn set_state(&self, state: State) {
        *self.state.lock().expect("connector poisoned") = state;
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if !self.connect.load(Ordering::SeqCst) {
            debug!("connector stopped, do not connect");
            return;
        }
        if self.state() != State::Disconnected {
            return;
        }
        self.do_connect();
    }

    fn do_connect(self: &Arc<Self>) {
        let socket = match Socket::for_addr(&self.server_addr) {
            Ok(socket) => socket,
            Err(err) => {
                error!("connector socket creation failed: {}", err);
                return;
            }
        };

        let errno = match socket.connect(&self.server_addr) {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(libc::EINVAL),
        };
        // A failed socket is not recoverable; every retry starts over with a
        // fresh one.
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),

            _ => {
                error!(
                    "connect to {} failed: {}",
                    self.server_addr,
                    io::Error::from_raw_os_error(errno)
                );
                drop(socket);
            }
        }
    }

    /// Watch the half-open socket for writability, which signals the
    /// handshake outcome.
    fn connecting(self: &Arc<Self>, socket: Socket) {
        self.set_state(State::Connecting);
        let channel = Channel::new(&self.handle, socket.as_raw_fd());
        *self.pending.lock().expect("connector poisoned") = Some(socket);

        let weak = Arc::downgrade(self);
        channel.set_write_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_write();
            }
        }));
        let weak = Arc::downgrade(self);
        channel.set_error_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_error();
            }
        }));

        channel.enable_writing();
        *self.channel.lock().expect("connector poisoned") = Some(channel);
    }

    /// Detach and discard the watch channel, returning the half-open socket.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        if let Some(channel) = self.channel.lock().expect("connector poisoned").take() {
            channel.disable_all();
            channel.remove();
        }
        self.pending.lock().expect("connector poisoned").take()
    }

    fn handle_write(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if self.state() != State::Connecting {
            return;
        }
        let socket = match self.remove_and_reset_channel() {
            Some(socket) => socket,
            None => return,
        };

        // Writable does not mean connected: check SO_ERROR, then guard
        // against the kernel pairing the socket with itself.
        match socket.take_error() {
            Ok(Some(err)) => {
                warn!("connect to {} failed: {}", self.server_addr, err);
                self.retry(socket);
            }
            Err(err) => {
                warn!("SO_ERROR query failed: {}", err);
                self.retry(socket);
            }
            Ok(None) if socket.is_self_connect() => {
                warn!("connect to {}: self connect", self.server_addr);
                self.retry(socket);
            }
            Ok(None) => {
                self.set_state(State::Connected);
                if self.connect.load(Ordering::SeqCst) {
                    let mut cb = self.new_connection_cb.lock().expect("connector poisoned");
                    match cb.as_mut() {
                        Some(cb) => cb(socket.into()),
                        None => drop(socket),
                    }
                } else {
                    // Stopped while the handshake was in flight.
                    drop(socket);
                }
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        if self.state() != State::Connecting {
            return;
        }
        error!("connector error while connecting to {}", self.server_addr);
        if let Some(socket) = self.remove_and_reset_channel() {
            if let Ok(Some(err)) = socket.take_error() {
                debug!("SO_ERROR = {}", err);
            }
            self.retry(socket);
        }
    }

    /// Close the failed socket and schedule another attempt with doubled
    /// delay, unless stopped.
    fn retry(self: &Arc<Self>, socket: Socket) {
        drop(socket);
        self.set_state(State::Disconnected);
        if !self.connect.load(Ordering::SeqCst) {
            debug!("connector stopped, do not retry");
            return;
        }

        let delay = *self.retry_delay.lock().expect("connector poisoned");
        info!(
            "retry connecting to {} in {} ms",
            self.server_addr,
            delay.as_millis()
        );
        let weak: Weak<Inner> = Arc::downgrade(self);
        let timer = self.handle.run_after(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.start_in_loop();
            }
        });
        *self.retry_timer.lock().expect("connector poisoned") = Some(timer);
        *self.retry_delay.lock().expect("connector poisoned") =
            std::cmp::min(delay * 2, MAX_RETRY_DELAY);
    }

    fn stop_in_loop(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if let Some(timer) = self.retry_timer.lock().expect("connector poisoned").take() {
            self.handle.cancel(timer);
        }
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel() {
                // Runs the flag check once more; with connect lowered this
                // just closes the socket.
                self.retry(socket);
            }
        }
    }
}
