use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::debug;

use crate::event_loop::{EventLoop, LoopHandle};

/// Runs once on each worker loop's own thread before the loop starts, e.g.
/// to set up per-thread state.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// A thread whose entire life is one [`EventLoop`].
///
/// The loop is constructed on the spawned thread's own stack (so the
/// affinity checks bind to that thread) and its handle is passed back to the
/// starter, which blocks until the loop exists.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<thread::JoinHandle<()>>,
    handle: Option<LoopHandle>,
}

impl EventLoopThread {
    pub fn new(name: &str) -> EventLoopThread {
        EventLoopThread {
            name: name.to_owned(),
            init: None,
            thread: None,
            handle: None,
        }
    }

    pub fn with_init(name: &str, init: ThreadInitCallback) -> EventLoopThread {
        EventLoopThread {
            name: name.to_owned(),
            init: Some(init),
            thread: None,
            handle: None,
        }
    }

    /// Spawn the thread and block until its loop is constructed.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");

        let (tx, rx) = mpsc::channel();
        let init = self.init.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // The loop lives on this stack; it dies when run() returns.
                let mut event_loop =
                    EventLoop::new().expect("failed to create worker event loop");
                if let Some(init) = init {
                    init(&event_loop.handle());
                }
                tx.send(event_loop.handle())
                    .expect("loop starter went away");
                event_loop.run();
                debug!("worker loop finished");
            })
            .expect("failed to spawn loop thread");

        let handle = rx.recv().expect("worker loop died during startup");
        self.thread = Some(thread);
        self.handle = Some(handle.clone());
        handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            // The loop observes quit within one poll timeout at worst.
            let _ = thread.join();
        }
    }
}

/// A fixed set of worker loops plus the caller-supplied base loop.
///
/// With zero workers every request for a loop returns the base loop, which
/// is the single-threaded mode. Workers are assigned round-robin by
/// [`get_next_loop`], or by hash for connection affinity.
///
/// [`get_next_loop`]: EventLoopThreadPool::get_next_loop
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_owned(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads; must be set before [`start`].
    ///
    /// [`start`]: EventLoopThreadPool::start
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started(), "pool already started");
        self.num_threads.store(num_threads, Ordering::SeqCst);
    }

    pub fn start(&self, init: Option<ThreadInitCallback>) {
        assert!(!self.started.swap(true, Ordering::SeqCst), "pool already started");
        self.base.assert_in_loop_thread();

        let num_threads = self.num_threads.load(Ordering::SeqCst);
        let mut threads = self.threads.lock().expect("pool poisoned");
        let mut loops = self.loops.lock().expect("pool poisoned");
        for i in 0..num_threads {
            let name = format!("{}{}", self.name, i);
            let mut thread = match &init {
                Some(init) => EventLoopThread::with_init(&name, Arc::clone(init)),
                None => EventLoopThread::new(&name),
            };
            loops.push(thread.start_loop());
            threads.push(thread);
        }
        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Round-robin worker selection; the base loop when there are no
    /// workers. Called from the base loop only (the acceptor path).
    pub fn get_next_loop(&self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started());
        let loops = self.loops.lock().expect("pool poisoned");
        if loops.is_empty() {
            return self.base.clone();
        }
        let index = self.next.load(Ordering::SeqCst);
        let handle = loops[index].clone();
        self.next.store((index + 1) % loops.len(), Ordering::SeqCst);
        handle
    }

    /// Deterministic worker for `hash`, for callers that want the same loop
    /// per key.
    pub fn get_loop_for_hash(&self, hash: u64) -> LoopHandle {
        self.base.assert_in_loop_thread();
        let loops = self.loops.lock().expect("pool poisoned");
        if loops.is_empty() {
            self.base.clone()
        } else {
            loops[(hash % loops.len() as u64) as usize].clone()
        }
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        self.base.assert_in_loop_thread();
        assert!(self.started());
        let loops = self.loops.lock().expect("pool poisoned");
        if loops.is_empty() {
            vec![self.base.clone()]
        } else {
            loops.clone()
        }
    }
}
