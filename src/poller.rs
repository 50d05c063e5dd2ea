use std::collections::HashMap;
use std::env;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::{Channel, Registration};
use crate::interest::{Interest, Ready};
use crate::sys;
use crate::sys::unix::epoll::millis;

/// An I/O multiplexer serving one event loop.
///
/// Implementations keep an `fd -> Channel` map. A channel whose interest is
/// cleared stays in the map (registration state *deleted*) so a later
/// re-enable is cheap; only [`remove_channel`] forgets it entirely.
///
/// [`remove_channel`]: Poller::remove_channel
pub(crate) trait Poller: Send + Sync {
    /// Block for at most `timeout`, appending `(channel, readiness)` for
    /// every active fd into `active`. Returns the wake-up time, which the
    /// loop forwards to read callbacks as the receive time. Transient errors
    /// (`EINTR`) leave `active` empty.
    fn poll(&self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Push a channel's current interest mask to the kernel, moving it
    /// through the new/added/deleted registration states.
    fn update_channel(&self, channel: &Arc<Channel>);

    /// Forget a (disabled) channel entirely.
    fn remove_channel(&self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Pick the backend: epoll by default, `poll(2)` when `REVENT_USE_POLL` is
/// set in the environment.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if env::var_os("REVENT_USE_POLL").is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        Ok(Box::new(EpollPoller::new()?))
    }
}

const INITIAL_EVENTS: usize = 16;

/// I/O multiplexing with epoll(7).
pub(crate) struct EpollPoller {
    epoll: sys::Epoll,
    channels: Mutex<HashMap<RawFd, Arc<Channel>>>,
    /// Scratch buffer for `epoll_wait`; grows when a poll fills it.
    events: Mutex<Vec<libc::epoll_event>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        Ok(EpollPoller {
            epoll: sys::Epoll::new()?,
            channels: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::with_capacity(INITIAL_EVENTS)),
        })
    }
}

impl Poller for EpollPoller {
    fn poll(&self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant {
        let mut events = self.events.lock().expect("poller poisoned");
        match self.epoll.wait(&mut events, timeout) {
            Ok(()) => {
                let channels = self.channels.lock().expect("poller poisoned");
                for event in events.iter() {
                    let fd = event.u64 as RawFd;
                    // Removed between the kernel queuing the event and us
                    // draining it; stale, skip.
                    let channel = match channels.get(&fd) {
                        Some(channel) => channel,
                        None => continue,
                    };
                    channel.set_ready(ready_from_epoll(event.events));
                    active.push(Arc::clone(channel));
                }
                if events.len() == events.capacity() {
                    // A full buffer probably means more events are pending.
                    let grow = events.capacity();
                    events.reserve(grow);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait failed: {}", err),
        }
        Instant::now()
    }

    fn update_channel(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let interest = channel.interest();
        trace!("epoll update fd {} to {:?}", fd, interest);
        match channel.registration() {
            Registration::New | Registration::Deleted => {
                if interest.is_empty() {
                    return;
                }
                self.channels
                    .lock()
                    .expect("poller poisoned")
                    .insert(fd, Arc::clone(channel));
                if let Err(err) = self.epoll.add(fd, epoll_from_interest(interest)) {
                    error!("epoll add fd {} failed: {}", fd, err);
                    return;
                }
                channel.set_registration(Registration::Added);
            }
            Registration::Added => {
                if interest.is_empty() {
                    // Detach from the kernel set (HUP/ERR are reported even
                    // with an empty mask) but keep the map entry warm.
                    if let Err(err) = self.epoll.delete(fd) {
                        error!("epoll delete fd {} failed: {}", fd, err);
                    }
                    channel.set_registration(Registration::Deleted);
                } else if let Err(err) = self.epoll.modify(fd, epoll_from_interest(interest)) {
                    error!("epoll modify fd {} failed: {}", fd, err);
                }
            }
        }
    }

    fn remove_channel(&self, channel: &Channel) {
        let fd = channel.fd();
        assert!(channel.is_none_event(), "removing an enabled channel");
        self.channels.lock().expect("poller poisoned").remove(&fd);
        if channel.registration() == Registration::Added {
            if let Err(err) = self.epoll.delete(fd) {
                error!("epoll delete fd {} failed: {}", fd, err);
            }
        }
        channel.set_registration(Registration::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .lock()
            .expect("poller poisoned")
            .get(&channel.fd())
            .map_or(false, |found| std::ptr::eq(&**found, channel))
    }
}

fn epoll_from_interest(interest: Interest) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        // EPOLLRDHUP must be requested here; unlike EPOLLHUP/EPOLLERR the
        // kernel does not report it unsolicited.
        kind |= libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

fn ready_from_epoll(events: u32) -> Ready {
    let events = events as libc::c_int;
    let mut ready = Ready::empty();
    if (events & (libc::EPOLLIN | libc::EPOLLPRI)) != 0 {
        ready |= Ready::READABLE;
    }
    if (events & libc::EPOLLOUT) != 0 {
        ready |= Ready::WRITABLE;
    }
    if (events & libc::EPOLLERR) != 0 {
        ready |= Ready::ERROR;
    }
    if (events & libc::EPOLLHUP) != 0 {
        ready |= Ready::HUP;
    }
    if (events & libc::EPOLLRDHUP) != 0 {
        ready |= Ready::READ_CLOSED;
    }
    ready
}

/// I/O multiplexing with poll(2); the portable fallback. The pollfd array
/// is rebuilt from the channel map every cycle, so the map is the single
/// source of truth and no slot bookkeeping is needed.
pub(crate) struct PollPoller {
    channels: Mutex<HashMap<RawFd, Arc<Channel>>>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant {
        let mut pollfds: Vec<libc::pollfd> = {
            let channels = self.channels.lock().expect("poller poisoned");
            channels
                .values()
                .filter(|channel| !channel.interest().is_empty())
                .map(|channel| libc::pollfd {
                    fd: channel.fd(),
                    events: poll_from_interest(channel.interest()),
                    revents: 0,
                })
                .collect()
        };

        let timeout_ms = std::cmp::min(millis(timeout), i32::MAX as u64) as i32;
        match sys::unix::poll(&mut pollfds, timeout_ms) {
            Ok(n) if n > 0 => {
                let channels = self.channels.lock().expect("poller poisoned");
                for pollfd in pollfds.iter().filter(|pollfd| pollfd.revents != 0) {
                    if let Some(channel) = channels.get(&pollfd.fd) {
                        channel.set_ready(ready_from_poll(pollfd.revents));
                        active.push(Arc::clone(channel));
                    }
                }
            }
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("poll failed: {}", err),
        }
        Instant::now()
    }

    fn update_channel(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("poll update fd {} to {:?}", fd, channel.interest());
        match channel.registration() {
            Registration::New | Registration::Deleted => {
                if channel.interest().is_empty() {
                    return;
                }
                self.channels
                    .lock()
                    .expect("poller poisoned")
                    .insert(fd, Arc::clone(channel));
                channel.set_registration(Registration::Added);
            }
            Registration::Added => {
                // The rebuilt pollfd array picks up the new mask; an empty
                // mask just drops the fd from the next array.
                if channel.interest().is_empty() {
                    channel.set_registration(Registration::Deleted);
                }
            }
        }
    }

    fn remove_channel(&self, channel: &Channel) {
        assert!(channel.is_none_event(), "removing an enabled channel");
        self.channels
            .lock()
            .expect("poller poisoned")
            .remove(&channel.fd());
        channel.set_registration(Registration::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .lock()
            .expect("poller poisoned")
            .get(&channel.fd())
            .map_or(false, |found| std::ptr::eq(&**found, channel))
    }
}

fn poll_from_interest(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        // As with epoll, POLLRDHUP is only reported when requested.
        events |= libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn ready_from_poll(revents: libc::c_short) -> Ready {
    let mut ready = Ready::empty();
    if (revents & (libc::POLLIN | libc::POLLPRI)) != 0 {
        ready |= Ready::READABLE;
    }
    if (revents & libc::POLLOUT) != 0 {
        ready |= Ready::WRITABLE;
    }
    if (revents & (libc::POLLERR | libc::POLLNVAL)) != 0 {
        ready |= Ready::ERROR;
    }
    if (revents & libc::POLLHUP) != 0 {
        ready |= Ready::HUP;
    }
    if (revents & libc::POLLRDHUP) != 0 {
        ready |= Ready::READ_CLOSED;
    }
    ready
}
