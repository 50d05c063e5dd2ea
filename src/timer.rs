use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::sys;

/// Process-wide monotonic timer sequence. Doubles as the tie-breaker for
/// timers that expire at the same instant: lower sequence fires first, which
/// is insertion order.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identifies a timer for cancellation. Obtained from
/// [`LoopHandle::run_at`]/[`run_after`]/[`run_every`].
///
/// [`LoopHandle::run_at`]: crate::LoopHandle::run_at
/// [`run_after`]: crate::LoopHandle::run_after
/// [`run_every`]: crate::LoopHandle::run_every
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Timer {
    when: Instant,
    interval: Option<Duration>,
    callback: TimerCallback,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(callback: TimerCallback, when: Instant, interval: Option<Duration>) -> Timer {
        Timer {
            when,
            interval,
            callback,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId {
            sequence: self.sequence,
        }
    }

    fn run(&mut self) {
        (self.callback)();
    }

    fn restart(&mut self, now: Instant) {
        // Periodic deadlines are measured from the moment the batch ran, not
        // from the original deadline; a stalled loop does not burst-fire.
        self.when = now + self.interval.expect("restarting a one-shot timer");
    }
}

#[derive(Default)]
struct TimerList {
    /// Dispatch order: earliest deadline first, insertion order within one
    /// instant.
    timers: BTreeMap<(Instant, u64), Timer>,
    /// Cancellation lookup: sequence to current deadline.
    active: HashMap<u64, Instant>,
    /// Timers cancelled from inside an expiration batch; consulted before a
    /// periodic timer is re-inserted.
    canceling: HashSet<u64>,
    calling_expired: bool,
}

impl TimerList {
    fn insert(&mut self, timer: Timer) -> bool {
        let key = (timer.when, timer.sequence);
        let earliest_changed = self.timers.keys().next().map_or(true, |first| key < *first);
        self.active.insert(timer.sequence, timer.when);
        self.timers.insert(key, timer);
        earliest_changed
    }

    fn earliest(&self) -> Option<Instant> {
        self.timers.keys().next().map(|&(when, _)| when)
    }
}

/// All timers of one event loop, multiplexed onto a single timerfd.
///
/// The fd is armed to the earliest pending deadline whenever the set is
/// non-empty; its readable event drives [`handle_expired`].
///
/// [`handle_expired`]: TimerQueue::handle_expired
pub(crate) struct TimerQueue {
    thread_id: ThreadId,
    timerfd: sys::TimerFd,
    list: Mutex<TimerList>,
}

impl TimerQueue {
    /// Must run on the loop's own thread; the queue remembers it for
    /// affinity asserts.
    pub(crate) fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            thread_id: thread::current().id(),
            timerfd: sys::TimerFd::new()?,
            list: Mutex::new(TimerList::default()),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    pub(crate) fn add_timer_in_loop(&self, timer: Timer) {
        self.assert_in_loop_thread();
        let when = timer.when;
        let earliest_changed = self
            .list
            .lock()
            .expect("timer queue poisoned")
            .insert(timer);
        if earliest_changed {
            self.rearm(when);
        }
    }

    pub(crate) fn cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop_thread();
        let mut list = self.list.lock().expect("timer queue poisoned");
        if let Some(when) = list.active.remove(&id.sequence) {
            list.timers.remove(&(when, id.sequence));
        } else if list.calling_expired {
            // Being dispatched right now; remember so reset skips it.
            list.canceling.insert(id.sequence);
        }
    }

    /// The timerfd fired: run every timer at or before `now`, then re-insert
    /// the periodic survivors and re-arm to the new earliest.
    pub(crate) fn handle_expired(&self) {
        self.assert_in_loop_thread();
        let now = Instant::now();
        match self.timerfd.read() {
            Ok(count) => trace!("timerfd fired, count {}", count),
            Err(err) => error!("timerfd read failed: {}", err),
        }

        let mut expired: Vec<Timer> = Vec::new();
        {
            let mut list = self.list.lock().expect("timer queue poisoned");
            let due: Vec<(Instant, u64)> = list
                .timers
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect();
            for key in due {
                let timer = list.timers.remove(&key).expect("due timer vanished");
                list.active.remove(&timer.sequence);
                expired.push(timer);
            }
            list.calling_expired = true;
            list.canceling.clear();
        }

        // Callbacks run outside the lock so they may add or cancel timers.
        for timer in &mut expired {
            timer.run();
        }

        let next = {
            let mut list = self.list.lock().expect("timer queue poisoned");
            list.calling_expired = false;
            for mut timer in expired {
                if timer.interval.is_some() && !list.canceling.contains(&timer.sequence) {
                    timer.restart(now);
                    list.insert(timer);
                }
            }
            list.earliest()
        };
        if let Some(when) = next {
            self.rearm(when);
        }
    }

    fn rearm(&self, when: Instant) {
        if let Err(err) = self.timerfd.set(when) {
            error!("timerfd_settime failed: {}", err);
        }
    }

    fn assert_in_loop_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.thread_id,
            "timer queue touched off its loop thread",
        );
    }
}
