// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Once;
use std::time::Duration;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// `127.0.0.1:0`; the kernel picks the port.
pub fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// An address nothing listens on: bind, read the port, drop the listener.
pub fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind(any_local_address()).unwrap();
    listener.local_addr().unwrap()
}

/// Receive with a generous deadline so a hung loop fails the test instead
/// of wedging the suite.
pub fn recv_within<T>(rx: &mpsc::Receiver<T>, timeout: Duration) -> T {
    rx.recv_timeout(timeout).expect("timed out waiting on loop")
}
