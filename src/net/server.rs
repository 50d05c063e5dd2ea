use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::event_loop::LoopHandle;
use crate::net::acceptor::Acceptor;
use crate::net::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::sys::Socket;

struct ServerInner {
    handle: LoopHandle,
    name: String,
    ip_port: String,
    acceptor: Acceptor,
    pool: EventLoopThreadPool,
    /// Keyed by connection name; touched only on the base loop's thread.
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
}

/// TCP server façade: an acceptor on the base loop, a pool of worker
/// loops, and a map of live connections.
///
/// Each accepted socket becomes a [`TcpConnection`] assigned round-robin to
/// a worker loop (the base loop itself with zero workers); all its
/// callbacks then run on that worker's thread.
pub struct TcpServer {
    inner: Arc<ServerInner>,
    started: AtomicBool,
}

impl TcpServer {
    /// Bind `listen_addr` on the base loop behind `handle`. The server is
    /// inert until [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn new(
        handle: &LoopHandle,
        listen_addr: &SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(handle, listen_addr, reuse_port)?;
        let ip_port = acceptor
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| listen_addr.to_string());

        let inner = Arc::new(ServerInner {
            handle: handle.clone(),
            name: name.to_owned(),
            ip_port,
            acceptor,
            pool: EventLoopThreadPool::new(handle.clone(), name),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            connection_cb: Mutex::new(Arc::new(default_connection_callback)),
            message_cb: Mutex::new(Arc::new(default_message_callback)),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(fd, peer_addr);
                }
            }));

        Ok(TcpServer {
            inner,
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The actual bound address as `ip:port` (port 0 gets resolved).
    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.inner.handle
    }

    /// Number of worker loops; 0 keeps everything on the base loop. Must be
    /// called before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self
            .inner
            .thread_init_cb
            .lock()
            .expect("server poisoned") = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock().expect("server poisoned") = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock().expect("server poisoned") = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock().expect("server poisoned") = Some(cb);
    }

    /// Spin up the worker pool and start listening. Idempotent; safe from
    /// any thread.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let init = self
            .inner
            .thread_init_cb
            .lock()
            .expect("server poisoned")
            .clone();
        let inner = Arc::clone(&self.inner);
        self.inner.handle.run_in_loop(move || {
            inner.pool.start(init);
            assert!(!inner.acceptor.listening());
            inner
                .acceptor
                .listen()
                .expect("failed to listen on server socket");
        });
    }

    /// Live connection count, as observed by the façade.
    pub fn num_connections(&self) -> usize {
        self.inner.connections.lock().expect("server poisoned").len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = std::mem::take(
            &mut *self.inner.connections.lock().expect("server poisoned"),
        );
        for (_, conn) in connections {
            let worker = conn.loop_handle().clone();
            worker.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl ServerInner {
    fn new_connection(self: &Arc<Self>, fd: OwnedFd, peer_addr: SocketAddr) {
        self.handle.assert_in_loop_thread();
        let worker = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let socket = Socket::from(fd);
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname failed: {}", err);
                return;
            }
        };

        let conn = TcpConnection::new(
            worker.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );
        conn.set_connection_callback(self.connection_cb.lock().expect("server poisoned").clone());
        conn.set_message_callback(self.message_cb.lock().expect("server poisoned").clone());
        if let Some(cb) = self
            .write_complete_cb
            .lock()
            .expect("server poisoned")
            .clone()
        {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .expect("server poisoned")
            .insert(conn_name, Arc::clone(&conn));
        worker.run_in_loop(move || conn.connect_established());
    }

    /// Runs on the connection's worker; bounce to the base loop where the
    /// map lives.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let inner = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.handle.run_in_loop(move || {
            inner.remove_connection_in_loop(&conn);
        });
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.handle.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection [{}] - connection {}",
            self.name,
            conn.name()
        );
        self.connections
            .lock()
            .expect("server poisoned")
            .remove(conn.name());
        let worker = conn.loop_handle().clone();
        let conn = Arc::clone(conn);
        // Queued, not inline: the worker may still be inside this
        // connection's dispatch.
        worker.queue_in_loop(move || conn.connect_destroyed());
    }
}
