use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::event_loop::LoopHandle;
use crate::net::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::net::connector::Connector;
use crate::sys::Socket;

struct ClientInner {
    handle: LoopHandle,
    connector: Connector,
    name: String,
    /// Reconnect after an *established* connection drops.
    retry: AtomicBool,
    /// Whether connecting is wanted at all.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
}

/// TCP client façade: one [`Connector`] plus at most one live connection,
/// all on a single loop.
///
/// [`Connector`]: crate::net::Connector
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    pub fn new(handle: &LoopHandle, server_addr: SocketAddr, name: &str) -> TcpClient {
        let inner = Arc::new(ClientInner {
            handle: handle.clone(),
            connector: Connector::new(handle, server_addr),
            name: name.to_owned(),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            connection_cb: Mutex::new(Arc::new(default_connection_callback)),
            message_cb: Mutex::new(Arc::new(default_message_callback)),
            write_complete_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .connector
            .set_new_connection_callback(Box::new(move |fd| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(fd);
                }
            }));

        TcpClient { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.connector.server_addr()
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.inner.handle
    }

    /// The live connection, if currently established.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.inner.connection.lock().expect("client poisoned").clone()
    }

    /// Reconnect automatically when an established connection drops.
    pub fn enable_retry(&self) {
        self.inner.retry.store(true, Ordering::SeqCst);
    }

    pub fn retry_enabled(&self) -> bool {
        self.inner.retry.load(Ordering::SeqCst)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock().expect("client poisoned") = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock().expect("client poisoned") = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock().expect("client poisoned") = Some(cb);
    }

    /// Start connecting (with the connector's backoff on failure).
    pub fn connect(&self) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.inner.name,
            self.inner.connector.server_addr()
        );
        self.inner.connect.store(true, Ordering::SeqCst);
        self.inner.connector.start();
    }

    /// Gracefully close the current connection (half-close after the output
    /// drains); keeps any in-flight connect attempt running.
    pub fn disconnect(&self) {
        self.inner.connect.store(false, Ordering::SeqCst);
        if let Some(conn) = self.inner.connection.lock().expect("client poisoned").as_ref() {
            conn.shutdown();
        }
    }

    /// Abort connecting: cancel backoff retries and any half-open attempt.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::SeqCst);
        self.inner.connector.stop();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.inner.connector.stop();
        let conn = self.inner.connection.lock().expect("client poisoned").take();
        if let Some(conn) = conn {
            // The close callback referencing this client dies with us;
            // replace it with one that only finishes the teardown.
            conn.set_close_callback(Arc::new(|conn: &Arc<TcpConnection>| {
                let worker = conn.loop_handle().clone();
                let conn = Arc::clone(conn);
                worker.queue_in_loop(move || conn.connect_destroyed());
            }));
            conn.force_close();
        }
    }
}

impl ClientInner {
    fn new_connection(self: &Arc<Self>, fd: OwnedFd) {
        self.handle.assert_in_loop_thread();
        let socket = Socket::from(fd);
        let peer_addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("getpeername failed: {}", err);
                return;
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname failed: {}", err);
                return;
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = TcpConnection::new(
            self.handle.clone(),
            conn_name,
            socket,
            local_addr,
            peer_addr,
        );
        conn.set_connection_callback(self.connection_cb.lock().expect("client poisoned").clone());
        conn.set_message_callback(self.message_cb.lock().expect("client poisoned").clone());
        if let Some(cb) = self
            .write_complete_cb
            .lock()
            .expect("client poisoned")
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

        *self.connection.lock().expect("client poisoned") = Some(Arc::clone(&conn));
        conn.connect_established();
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        self.handle.assert_in_loop_thread();
        *self.connection.lock().expect("client poisoned") = None;
        {
            let conn = Arc::clone(conn);
            self.handle.queue_in_loop(move || conn.connect_destroyed());
        }
        if self.retry.load(Ordering::SeqCst) && self.connect.load(Ordering::SeqCst) {
            info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}
