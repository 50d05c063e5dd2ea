//! Same reactor, portable poll(2) backend. Integration tests run one per
//! process, so setting the selector env var here cannot leak into the
//! epoll-backed suites.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use revent::net::TcpServer;
use revent::EventLoopThread;

mod util;

use util::{any_local_address, init};

#[test]
fn echo_round_trip_over_poll() {
    std::env::set_var("REVENT_USE_POLL", "1");
    init();

    let mut loop_thread = EventLoopThread::new("poll-echo");
    let handle = loop_thread.start_loop();

    let server = TcpServer::new(&handle, &any_local_address(), "poll-echo", false).unwrap();
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let msg = buf.retrieve_all_as_bytes();
        conn.send(&msg);
    }));
    server.set_thread_num(2);
    server.start();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"over poll(2)").unwrap();

    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"over poll(2)");
}

#[test]
fn peer_half_close_over_poll() {
    std::env::set_var("REVENT_USE_POLL", "1");
    init();

    let mut loop_thread = EventLoopThread::new("poll-half-close");
    let handle = loop_thread.start_loop();

    let server = TcpServer::new(&handle, &any_local_address(), "poll-hc", false).unwrap();
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let msg = buf.retrieve_all_as_bytes();
        conn.send(&msg);
    }));
    server.start();
    let addr = server.local_addr().unwrap();

    // Half-close from the peer: the request must still be answered over
    // the peer's open read half before the server tears down.
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"last words").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"last words");

    let mut rest = [0u8; 16];
    assert_eq!(stream.read(&mut rest).unwrap(), 0);
}

#[test]
fn timers_fire_over_poll() {
    std::env::set_var("REVENT_USE_POLL", "1");
    init();

    let mut event_loop = revent::EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let fired = Arc::new(Mutex::new(0));

    let fired2 = Arc::clone(&fired);
    let handle2 = handle.clone();
    handle.run_after(Duration::from_millis(50), move || {
        *fired2.lock().unwrap() += 1;
        handle2.quit();
    });
    event_loop.run();
    assert_eq!(*fired.lock().unwrap(), 1);
}
