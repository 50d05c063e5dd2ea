use std::any::Any;
use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::Socket;

/// Invoked on Connected and Disconnected transitions.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked after every successful read; consume bytes via the buffer's
/// `retrieve*` family.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
/// Invoked when the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked when buffered output first crosses the high-water mark,
/// with the buffered byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
/// Framework-internal: unlinks the connection from its owning façade.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
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

struct ConnIo {
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established TCP connection, pinned to one loop.
///
/// Shared ownership: the owning façade's map holds a strong reference, the
/// channel a weak tie upgraded per dispatch, and every callback receives
/// `&Arc<TcpConnection>`. All I/O and state transitions happen on the
/// connection's loop thread; `send`/`shutdown`/`force_close` may be called
/// from anywhere and hop threads as needed.
///
/// The socket fd is closed when the last reference drops, not at
/// close-event time; a leaked connection is therefore visible as a leaked
/// fd.
pub struct TcpConnection {
    handle: LoopHandle,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    reading: AtomicBool,
    io: Mutex<ConnIo>,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConnection {
    /// Wrap an already-connected socket. The connection starts in
    /// `Connecting`; the façade transfers it to its loop and calls
    /// [`connect_established`].
    ///
    /// [`connect_established`]: TcpConnection::connect_established
    pub fn new(
        handle: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let channel = Channel::new(&handle, socket.as_raw_fd());
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let w = weak.clone();
            channel.set_read_callback(Box::new(move |receive_time| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(receive_time);
                }
            }));
            let w = weak.clone();
            channel.set_write_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            }));
            let w = weak.clone();
            channel.set_close_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            }));
            let w = weak.clone();
            channel.set_error_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            }));

            TcpConnection {
                handle,
                name,
                socket,
                channel: Arc::clone(&channel),
                local_addr,
                peer_addr,
                state: AtomicU8::new(State::Connecting as u8),
                reading: AtomicBool::new(true),
                io: Mutex::new(ConnIo {
                    input: Buffer::new(),
                    output: Buffer::new(),
                    high_water_mark: DEFAULT_HIGH_WATER_MARK,
                }),
                callbacks: Mutex::new(Callbacks::default()),
                context: Mutex::new(None),
            }
        });
        debug!("TcpConnection::new [{}] fd={}", conn.name, conn.socket.as_raw_fd());
        if let Err(err) = conn.socket.set_keep_alive(true) {
            warn!("{}: SO_KEEPALIVE failed: {}", conn.name, err);
        }
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The loop this connection is pinned to; all its callbacks run there.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().expect("connection poisoned").connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().expect("connection poisoned").message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().expect("connection poisoned").write_complete = Some(cb);
    }

    /// Backpressure hook: fires when buffered output first crosses `mark`
    /// upward.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().expect("connection poisoned").high_water = Some(cb);
        self.io.lock().expect("connection poisoned").high_water_mark = mark;
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().expect("connection poisoned").close = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = self.socket.set_tcp_no_delay(on) {
            warn!("{}: TCP_NODELAY failed: {}", self.name, err);
        }
    }

    /// Attach an arbitrary user value to this connection.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().expect("connection poisoned") = Some(context);
    }

    /// Access the user value attached with [`set_context`].
    ///
    /// [`set_context`]: TcpConnection::set_context
    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.context.lock().expect("connection poisoned")
    }

    /// Send bytes. On the loop thread with nothing queued this is one
    /// direct write; any remainder is buffered and flushed on writable
    /// events. From other threads the bytes are copied and the write hops
    /// onto the loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = Arc::clone(self);
            let data = data.to_vec();
            self.handle.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Send a buffer's whole readable region, consuming it.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let conn = Arc::clone(self);
            let data = buf.retrieve_all_as_bytes();
            self.handle.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Close the write half once buffered output has drained; the peer sees
    /// every queued byte, then FIN. The read half stays open.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let conn = Arc::clone(self);
            self.handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Synthesize a close event, discarding unsent output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = Arc::clone(self);
            self.handle.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// [`force_close`] after `delay`. Holds only a weak reference across
    /// the wait, so a connection destroyed in the meantime is not revived.
    ///
    /// [`force_close`]: TcpConnection::force_close
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let weak = Arc::downgrade(self);
            self.handle.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resume delivering readable events (the default state).
    pub fn start_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.handle.run_in_loop(move || {
            conn.handle.assert_in_loop_thread();
            if !conn.reading.load(Ordering::SeqCst) || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.store(true, Ordering::SeqCst);
            }
        });
    }

    /// Stop delivering readable events; kernel-level flow control, since
    /// the unread bytes back up the peer's TCP window.
    pub fn stop_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.handle.run_in_loop(move || {
            conn.handle.assert_in_loop_thread();
            if conn.reading.load(Ordering::SeqCst) || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.store(false, Ordering::SeqCst);
            }
        });
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    /// Bytes currently queued for write.
    pub fn output_bytes(&self) -> usize {
        self.io.lock().expect("connection poisoned").output.readable_bytes()
    }

    /// Finish establishment on the connection's loop: tie the channel, arm
    /// reading, fire the connection callback. Called exactly once by the
    /// façade.
    pub fn connect_established(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        let tie: Arc<dyn Any + Send + Sync> = Arc::clone(self) as Arc<dyn Any + Send + Sync>;
        self.channel.tie(&tie);
        self.channel.enable_reading();

        if let Some(cb) = self.connection_callback() {
            cb(self);
        }
    }

    /// Final teardown on the connection's loop: the last method ever called
    /// on a connection by the framework. Fires the disconnect callback if
    /// the close path has not already done so, then drops the poller
    /// registration.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_callback() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().expect("connection poisoned").connection.clone()
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.handle.assert_in_loop_thread();
        let mut io = self.io.lock().expect("connection poisoned");
        match io.input.read_fd(self.socket.as_raw_fd()) {
            Ok(0) => {
                drop(io);
                self.handle_close();
            }
            Ok(_) => {
                // Hand the input buffer to the user with no lock held, so
                // the callback can freely send, shutdown or close.
                let mut input = mem::take(&mut io.input);
                drop(io);
                let cb = self.callbacks.lock().expect("connection poisoned").message.clone();
                match cb {
                    Some(cb) => cb(self, &mut input, receive_time),
                    None => input.retrieve_all(),
                }
                self.io.lock().expect("connection poisoned").input = input;
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(io);
                error!("{}: read failed: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("{} is down, no more writing", self.name);
            return;
        }
        let mut io = self.io.lock().expect("connection poisoned");
        match self.socket.write(io.output.peek()) {
            Ok(n) => {
                io.output.retrieve(n);
                if io.output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    drop(io);
                    self.queue_write_complete();
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("{}: write failed: {}", self.name, err),
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("{}: disconnected, give up writing", self.name);
            return;
        }

        let mut io = self.io.lock().expect("connection poisoned");
        let mut nwrote = 0;
        let mut fault = false;

        // Nothing in flight: try the direct write and buffer only the rest.
        if !self.channel.is_writing() && io.output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    if nwrote == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("{}: send failed: {}", self.name, err);
                    if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        // The peer is gone; the next readable event observes
                        // the hang-up and runs the close path.
                        fault = true;
                    }
                }
            }
        }

        if !fault && nwrote < data.len() {
            let remaining = data.len() - nwrote;
            let old_len = io.output.readable_bytes();
            if old_len + remaining >= io.high_water_mark && old_len < io.high_water_mark {
                let cb = self.callbacks.lock().expect("connection poisoned").high_water.clone();
                if let Some(cb) = cb {
                    let conn = Arc::clone(self);
                    let queued = old_len + remaining;
                    self.handle.queue_in_loop(move || cb(&conn, queued));
                }
            }
            io.output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("{}: shutdown failed: {}", self.name, err);
            }
        }
        // Still writing: handle_write performs the shutdown once the output
        // buffer drains.
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            // As if a read had returned 0.
            self.handle_close();
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        trace!("{}: close, state {:?}", self.name, self.state());
        assert!(matches!(self.state(), State::Connected | State::Disconnecting));
        // The fd is not closed here; it closes with the connection, which
        // keeps leaks observable.
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        if let Some(cb) = self.connection_callback() {
            cb(self);
        }
        let close = self.callbacks.lock().expect("connection poisoned").close.clone();
        // Must be last: it unlinks this connection from the façade's map.
        if let Some(cb) = close {
            cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!("{}: SO_ERROR = {}", self.name, err),
            Ok(None) => {}
            Err(err) => error!("{}: SO_ERROR query failed: {}", self.name, err),
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.lock().expect("connection poisoned").write_complete.clone();
        if let Some(cb) = cb {
            let conn = Arc::clone(self);
            self.handle.queue_in_loop(move || cb(&conn));
        }
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
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Default connection callback: log the transition and nothing else.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
    // Do not close here; some users only register a message callback.
}

/// Default message callback: discard everything.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _at: Instant) {
    buf.retrieve_all();
}
