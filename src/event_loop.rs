use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::timer::{Timer, TimerId, TimerQueue};
use crate::sys;

/// A deferred unit of work for some loop's thread.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// How long one poll may block. Bounds the latency of observing `quit` set
/// without a wake-up.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    /// The loop constructed on this thread, if any. Enforces "one loop per
    /// thread" and routes `run_in_loop` for free.
    static CURRENT_LOOP: RefCell<Weak<LoopShared>> = RefCell::new(Weak::new());
}

/// State shared between an [`EventLoop`] and its [`LoopHandle`]s.
pub(crate) struct LoopShared {
    thread_id: ThreadId,
    poller: Box<dyn Poller>,
    pub(crate) timers: TimerQueue,
    waker: sys::Waker,
    pending: Mutex<Vec<Task>>,
    quit: AtomicBool,
    looping: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
}

impl LoopShared {
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop owned by {:?} touched from {:?}",
            self.thread_id,
            thread::current().id(),
        );
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.has_channel(channel)
    }

    fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            error!("loop wake-up write failed: {}", err);
        }
    }

    fn queue(self: &Arc<Self>, task: Task) {
        self.pending.lock().expect("pending queue poisoned").push(task);
        // Off-thread callers must interrupt the poll. So must tasks queued
        // from inside the pending phase, or they would sit through a full
        // poll timeout before running.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    fn run_or_queue(self: &Arc<Self>, task: Task) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue(task);
        }
    }
}

/// Sendable face of an [`EventLoop`].
///
/// A handle can be cloned freely and used from any thread to queue work,
/// schedule timers, or ask the loop to quit. It is the Rust counterpart of
/// passing the loop by pointer around a C-style reactor.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    /// True when the calling thread is the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Panic unless on the loop's own thread. Mutators of loop-owned state
    /// call this; a violation is a design bug, not a runtime condition.
    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }

    /// Run `f` on the loop thread: inline when already there, queued (and
    /// the loop woken) otherwise.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.run_or_queue(Box::new(f));
    }

    /// Queue `f` for the loop's next pending-task phase, even when called
    /// from the loop thread itself.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.queue(Box::new(f));
    }

    /// Number of tasks waiting for the pending phase.
    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().expect("pending queue poisoned").len()
    }

    /// Run `cb` once at `when`.
    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Timer::new(Box::new(cb), when, None))
    }

    /// Run `cb` once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Run `cb` every `interval`, first firing one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Timer::new(
            Box::new(cb),
            Instant::now() + interval,
            Some(interval),
        ))
    }

    /// Cancel a timer. Safe from any thread, also from inside the timer's
    /// own callback.
    pub fn cancel(&self, id: TimerId) {
        let weak = Arc::downgrade(&self.shared);
        self.run_in_loop(move || {
            if let Some(shared) = weak.upgrade() {
                shared.timers.cancel_in_loop(id);
            }
        });
    }

    /// Ask the loop to exit after its current cycle. Safe from any thread;
    /// off-thread callers wake the loop so the flag is observed promptly.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }

    /// Completed poll cycles of this loop.
    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::SeqCst)
    }

    /// Whether `channel` is registered with this loop's poller. Loop thread
    /// only.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.shared.has_channel(channel)
    }

    fn add_timer(&self, timer: Timer) -> TimerId {
        let id = timer.id();
        let weak = Arc::downgrade(&self.shared);
        self.run_in_loop(move || {
            if let Some(shared) = weak.upgrade() {
                shared.timers.add_timer_in_loop(timer);
            }
        });
        id
    }
}

/// A per-thread reactor: poll for I/O, dispatch to channels, drain queued
/// tasks, repeat.
///
/// Exactly one loop may exist per thread, and it must be driven by the
/// thread that constructed it. Everything the loop owns (channels, timers,
/// connection state of connections assigned to it) is mutated only from that
/// thread; other threads talk to it through a [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    wakeup_channel: Arc<Channel>,
    timer_channel: Arc<Channel>,
    /// Scratch list reused across cycles.
    active_channels: Vec<Arc<Channel>>,
}

impl EventLoop {
    /// Create the loop for the *current* thread. Panics if this thread
    /// already owns one.
    pub fn new() -> io::Result<EventLoop> {
        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            poller: poller::new_default_poller()?,
            timers: TimerQueue::new()?,
            waker: sys::Waker::new()?,
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
        });

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.upgrade().is_none(),
                "another EventLoop already exists on thread {:?}",
                thread::current().id(),
            );
            *current = Arc::downgrade(&shared);
        });
        debug!("EventLoop created on {:?}", shared.thread_id);

        let handle = LoopHandle {
            shared: Arc::clone(&shared),
        };

        // The wake-up channel's only job is to interrupt a blocking poll;
        // the read callback just drains the counter.
        let wakeup_channel = Channel::new(&handle, shared.waker.as_raw_fd());
        {
            let weak = Arc::downgrade(&shared);
            wakeup_channel.set_read_callback(Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    if let Err(err) = shared.waker.drain() {
                        error!("loop wake-up read failed: {}", err);
                    }
                }
            }));
        }
        wakeup_channel.enable_reading();

        let timer_channel = Channel::new(&handle, shared.timers.fd());
        {
            let weak = Arc::downgrade(&shared);
            timer_channel.set_read_callback(Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.timers.handle_expired();
                }
            }));
        }
        timer_channel.enable_reading();

        Ok(EventLoop {
            shared,
            wakeup_channel,
            timer_channel,
            active_channels: Vec::new(),
        })
    }

    /// The loop constructed on the current thread, if any.
    pub fn current() -> Option<LoopHandle> {
        CURRENT_LOOP.with(|current| {
            current
                .borrow()
                .upgrade()
                .map(|shared| LoopHandle { shared })
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drive the reactor until [`quit`] is observed.
    ///
    /// Each cycle: poll (at most 10 s), dispatch every active channel with
    /// the poll wake-up time, then swap out and run the pending tasks.
    ///
    /// [`quit`]: LoopHandle::quit
    pub fn run(&mut self) {
        self.shared.assert_in_loop_thread();
        assert!(
            !self.shared.looping.swap(true, Ordering::SeqCst),
            "EventLoop::run called while already looping",
        );
        trace!("EventLoop start looping");

        loop {
            self.active_channels.clear();
            let receive_time = self
                .shared
                .poller
                .poll(POLL_TIMEOUT, &mut self.active_channels);
            self.shared.iteration.fetch_add(1, Ordering::SeqCst);

            self.shared.event_handling.store(true, Ordering::SeqCst);
            for channel in &self.active_channels {
                channel.handle_event(receive_time);
            }
            self.shared.event_handling.store(false, Ordering::SeqCst);

            self.do_pending_tasks();

            if self.shared.quit.load(Ordering::SeqCst) {
                break;
            }
        }

        trace!("EventLoop stop looping");
        self.shared.looping.store(false, Ordering::SeqCst);
    }

    /// One poll-dispatch-drain cycle with the given poll timeout. Test and
    /// bootstrap helper; production code calls [`run`](EventLoop::run).
    pub fn run_once(&mut self, timeout: Duration) {
        self.shared.assert_in_loop_thread();
        self.active_channels.clear();
        let receive_time = self.shared.poller.poll(timeout, &mut self.active_channels);
        self.shared.iteration.fetch_add(1, Ordering::SeqCst);
        self.shared.event_handling.store(true, Ordering::SeqCst);
        for channel in &self.active_channels {
            channel.handle_event(receive_time);
        }
        self.shared.event_handling.store(false, Ordering::SeqCst);
        self.do_pending_tasks();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.shared.assert_in_loop_thread();
    }

    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(f);
    }

    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(f);
    }

    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_at(when, cb)
    }

    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_after(delay, cb)
    }

    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_every(interval, cb)
    }

    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id);
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::SeqCst)
    }

    fn do_pending_tasks(&mut self) {
        self.shared.calling_pending.store(true, Ordering::SeqCst);
        // Swap under the lock, run outside it: tasks are free to queue more
        // work (seen next cycle, plus a self-wake) or to take other locks.
        let tasks = mem::take(
            &mut *self
                .shared
                .pending
                .lock()
                .expect("pending queue poisoned"),
        );
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("EventLoop on {:?} destructs", self.shared.thread_id);
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        self.timer_channel.disable_all();
        self.timer_channel.remove();
        // Unexecuted tasks may capture handles to this loop; drop them so
        // nothing keeps the shared state alive past the loop itself.
        self.shared
            .pending
            .lock()
            .expect("pending queue poisoned")
            .clear();
        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Weak::new();
        });
    }
}
