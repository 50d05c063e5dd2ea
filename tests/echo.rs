use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use revent::net::TcpServer;
use revent::EventLoopThread;

mod util;

use util::{any_local_address, init, recv_within};

/// An echo server running on its own base loop thread; returns the server
/// (keep it alive), its address, and counters.
struct EchoServer {
    _loop_thread: EventLoopThread,
    _server: TcpServer,
    addr: std::net::SocketAddr,
    messages: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

fn echo_server(name: &str, threads: usize) -> EchoServer {
    let mut loop_thread = EventLoopThread::new(name);
    let handle = loop_thread.start_loop();

    let server = TcpServer::new(&handle, &any_local_address(), name, false).unwrap();
    let messages = Arc::new(AtomicUsize::new(0));
    let bytes = Arc::new(AtomicUsize::new(0));

    let messages2 = Arc::clone(&messages);
    let bytes2 = Arc::clone(&bytes);
    server.set_message_callback(Arc::new(move |conn, buf, _at| {
        messages2.fetch_add(1, Ordering::SeqCst);
        bytes2.fetch_add(buf.readable_bytes(), Ordering::SeqCst);
        let msg = buf.retrieve_all_as_bytes();
        conn.send(&msg);
    }));
    server.set_thread_num(threads);
    server.start();

    let addr = server.local_addr().unwrap();
    EchoServer {
        _loop_thread: loop_thread,
        _server: server,
        addr,
        messages,
        bytes,
    }
}

#[test]
fn echo_round_trip() {
    init();

    let server = echo_server("echo", 0);

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    assert!(server.messages.load(Ordering::SeqCst) >= 1);
    assert_eq!(server.bytes.load(Ordering::SeqCst), 6);
}

#[test]
fn echo_many_messages_accounting() {
    init();

    let server = echo_server("echo-acct", 1);

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // Ping-pong: every write comes back before the next goes out, so
    // echoed bytes equal written bytes exactly.
    let writes = 100;
    let payload = [b'x'; 32];
    for _ in 0..writes {
        stream.write_all(&payload).unwrap();
        let mut reply = [0u8; 32];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, payload);
    }

    assert_eq!(server.bytes.load(Ordering::SeqCst), writes * payload.len());
    assert!(server.messages.load(Ordering::SeqCst) <= writes);
}

#[test]
fn connection_lifecycle_callback_order() {
    init();

    let mut loop_thread = EventLoopThread::new("lifecycle");
    let handle = loop_thread.start_loop();

    #[derive(Debug, PartialEq, Clone, Copy)]
    enum Event {
        Up,
        Message,
        Down,
    }

    let server = TcpServer::new(&handle, &any_local_address(), "lifecycle", false).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();

    let events2 = Arc::clone(&events);
    let done = Mutex::new(Some(done_tx));
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            events2.lock().unwrap().push(Event::Up);
        } else {
            events2.lock().unwrap().push(Event::Down);
            if let Some(done) = done.lock().unwrap().take() {
                let _ = done.send(());
            }
        }
    }));
    let events3 = Arc::clone(&events);
    server.set_message_callback(Arc::new(move |_conn, buf, _at| {
        events3.lock().unwrap().push(Event::Message);
        buf.retrieve_all();
    }));
    server.start();
    let addr = server.local_addr().unwrap();

    {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        stream.flush().unwrap();
        // Give the worker a moment to run the message callback before FIN.
        std::thread::sleep(Duration::from_millis(100));
    }

    recv_within(&done_rx, Duration::from_secs(5));
    let events = events.lock().unwrap().clone();
    assert_eq!(events.first(), Some(&Event::Up));
    assert_eq!(events.last(), Some(&Event::Down));
    assert_eq!(events.iter().filter(|e| **e == Event::Up).count(), 1);
    assert_eq!(events.iter().filter(|e| **e == Event::Down).count(), 1);
    assert!(events.contains(&Event::Message));
    assert!(server.num_connections() == 0 || {
        // Removal bounces over the base loop; allow it to land.
        std::thread::sleep(Duration::from_millis(200));
        server.num_connections() == 0
    });
}

#[test]
fn half_close_delivers_queued_bytes_before_fin() {
    init();

    let mut loop_thread = EventLoopThread::new("half-close");
    let handle = loop_thread.start_loop();

    // On connect: push well past the socket buffer so part of the payload
    // must queue in the output buffer, then shut down immediately. The
    // peer must still see every byte, then EOF.
    const TOTAL: usize = 8 * 1024 * 1024;
    let server = TcpServer::new(&handle, &any_local_address(), "flood", false).unwrap();
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            let payload = vec![b'f'; TOTAL];
            conn.send(&payload);
            conn.shutdown();
        }
    }));
    server.start();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut received = 0usize;
    let mut chunk = [0u8; 64 * 1024];
    let started = Instant::now();
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break, // FIN only after everything queued went out
            Ok(n) => {
                assert!(chunk[..n].iter().all(|&b| b == b'f'));
                received += n;
            }
            Err(err) => panic!("read failed after {} bytes: {}", received, err),
        }
        assert!(started.elapsed() < Duration::from_secs(10), "flood stalled");
    }
    assert_eq!(received, TOTAL);
}

#[test]
fn peer_half_close_still_gets_a_reply() {
    init();

    let server = echo_server("peer-half-close", 0);

    // The peer sends a request and closes its write half immediately. The
    // server must observe the half-close as end-of-read, not as a dead
    // connection: the queued request still reaches the message callback and
    // the echo still flows back over the peer's open read half.
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"parting shot").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"parting shot");

    // After the echo, the server side runs its close path and the peer
    // sees EOF.
    let mut rest = [0u8; 16];
    assert_eq!(stream.read(&mut rest).unwrap(), 0);
    assert_eq!(server.bytes.load(Ordering::SeqCst), 12);
}

#[test]
fn send_from_foreign_thread() {
    init();

    let mut loop_thread = EventLoopThread::new("xthread-send");
    let handle = loop_thread.start_loop();

    let server = TcpServer::new(&handle, &any_local_address(), "xthread", false).unwrap();
    let (conn_tx, conn_rx) = mpsc::channel();
    let conn_tx = Mutex::new(conn_tx);
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            let _ = conn_tx.lock().unwrap().send(Arc::clone(conn));
        }
    }));
    server.start();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // This test thread is not the connection's loop thread; send must hop.
    let conn = recv_within(&conn_rx, Duration::from_secs(5));
    assert!(!conn.loop_handle().is_in_loop_thread());
    conn.send(b"offloop");

    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"offloop");

    drop(server);
}

#[test]
fn write_complete_and_high_water_callbacks() {
    init();

    let mut loop_thread = EventLoopThread::new("marks");
    let handle = loop_thread.start_loop();

    let server = TcpServer::new(&handle, &any_local_address(), "marks", false).unwrap();
    let write_complete = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));

    const TOTAL: usize = 8 * 1024 * 1024;
    let high_water2 = Arc::clone(&high_water);
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            let high_water3 = Arc::clone(&high_water2);
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn, queued| {
                    assert!(queued >= 64 * 1024);
                    high_water3.fetch_add(1, Ordering::SeqCst);
                }),
                64 * 1024,
            );
            let payload = vec![b'w'; TOTAL];
            conn.send(&payload);
            conn.shutdown();
        }
    }));
    let write_complete2 = Arc::clone(&write_complete);
    server.set_write_complete_callback(Arc::new(move |_conn| {
        write_complete2.fetch_add(1, Ordering::SeqCst);
    }));
    server.start();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut received = 0usize;
    let mut chunk = [0u8; 64 * 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(err) => panic!("read failed: {}", err),
        }
    }
    assert_eq!(received, TOTAL);

    // 8 MiB cannot fit a socket buffer: output must have queued past the
    // 64 KiB mark exactly once, and draining it fires write-complete.
    assert_eq!(high_water.load(Ordering::SeqCst), 1);
    assert!(write_complete.load(Ordering::SeqCst) >= 1);
}
