use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use revent::{EventLoop, EventLoopThread, LoopHandle};

mod util;

use util::{assert_send, assert_sync, init, recv_within};

#[test]
fn handle_is_send_and_sync() {
    assert_send::<LoopHandle>();
    assert_sync::<LoopHandle>();
}

#[test]
fn run_in_loop_is_inline_on_own_thread() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    // On the loop's own thread this must not wait for a poll cycle.
    event_loop.run_in_loop(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn queued_task_runs_within_one_cycle() {
    init();

    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let (tx, rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        handle.queue_in_loop(move || {
            tx.send(thread::current().id()).unwrap();
        });
    });

    // The queue_in_loop above happens while we are *not* polling yet; the
    // wake-up must still carry over so this single cycle sees it.
    let started = Instant::now();
    event_loop.run_once(Duration::from_secs(5));
    let loop_thread = recv_within(&rx, Duration::from_secs(1));

    assert_eq!(loop_thread, thread::current().id());
    // Far below the poll timeout: the eventfd interrupted the poll.
    assert!(started.elapsed() < Duration::from_secs(5));
    worker.join().unwrap();
}

#[test]
fn quit_from_other_thread_stops_the_loop() {
    init();

    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    let started = Instant::now();
    event_loop.run();
    // Well below the 10 s poll timeout: quit() woke the loop.
    assert!(started.elapsed() < Duration::from_secs(5));
    quitter.join().unwrap();
}

#[test]
fn task_queued_by_task_is_seen_before_next_poll_blocks() {
    init();

    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let order1 = Arc::clone(&order);
    let handle1 = handle.clone();
    handle.queue_in_loop(move || {
        order1.lock().unwrap().push("first");
        let order2 = Arc::clone(&order1);
        // Queued from inside the pending phase; the self-wake guarantees
        // the next cycle's poll returns immediately instead of blocking.
        handle1.queue_in_loop(move || {
            order2.lock().unwrap().push("second");
        });
    });

    let started = Instant::now();
    event_loop.run_once(Duration::from_secs(5));
    event_loop.run_once(Duration::from_secs(5));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn tasks_run_in_queue_order() {
    init();

    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    for i in 0..16 {
        let seen = Arc::clone(&seen);
        handle.queue_in_loop(move || seen.lock().unwrap().push(i));
    }
    event_loop.run_once(Duration::from_secs(5));

    assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
}

#[test]
fn current_returns_this_threads_loop() {
    init();

    assert!(EventLoop::current().is_none());
    let event_loop = EventLoop::new().unwrap();
    let current = EventLoop::current().expect("loop just constructed");
    assert!(current.is_in_loop_thread());
    drop(event_loop);
    assert!(EventLoop::current().is_none());
}

#[test]
#[should_panic(expected = "another EventLoop already exists")]
fn second_loop_on_one_thread_panics() {
    init();

    let _first = EventLoop::new().unwrap();
    let _second = EventLoop::new().unwrap();
}

#[test]
#[should_panic(expected = "loop owned by")]
fn foreign_thread_mutator_panics() {
    init();

    let mut loop_thread = EventLoopThread::new("affinity-test");
    let handle = loop_thread.start_loop();
    // This thread is not the loop's thread; any mutator path must die here.
    handle.assert_in_loop_thread();
}

#[test]
fn iteration_counts_cycles() {
    init();

    let mut event_loop = EventLoop::new().unwrap();
    assert_eq!(event_loop.iteration(), 0);
    event_loop.run_once(Duration::from_millis(10));
    event_loop.run_once(Duration::from_millis(10));
    assert_eq!(event_loop.iteration(), 2);
}
