use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::trace;

use crate::event_loop::{LoopHandle, LoopShared};
use crate::interest::{Interest, Ready};

/// Callback invoked on readable events, with the poll wake-up time.
pub type ReadCallback = Box<dyn FnMut(Instant) + Send>;
/// Callback invoked on writable, close and error events.
pub type EventCallback = Box<dyn FnMut() + Send>;

/// Registration state of a channel inside its poller.
///
/// A deleted channel stays in the poller's fd map with no kernel interest,
/// so re-enabling it is a modify instead of a fresh add.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Registration {
    New,
    Added,
    Deleted,
}

struct State {
    interest: Interest,
    ready: Ready,
    registration: Registration,
    tied: bool,
}

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// The binding between one file descriptor and the callbacks that service
/// its events.
///
/// A channel never owns its fd; the fd's owner (socket, eventfd, timerfd)
/// outlives the registration. All methods other than construction must be
/// called from the owning loop's thread.
pub struct Channel {
    shared: Weak<LoopShared>,
    self_ref: Weak<Channel>,
    fd: RawFd,
    state: Mutex<State>,
    tie: Mutex<Weak<dyn Any + Send + Sync>>,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    /// A channel for `fd`, owned by the loop behind `handle`. The fd stays
    /// owned by the caller.
    pub fn new(handle: &LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_ref| Channel {
            shared: Arc::downgrade(handle.shared()),
            self_ref: self_ref.clone(),
            fd,
            state: Mutex::new(State {
                interest: Interest::empty(),
                ready: Ready::empty(),
                registration: Registration::New,
                tied: false,
            }),
            tie: Mutex::new(Weak::<()>::new()),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        self.callbacks.lock().expect("channel poisoned").read = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.callbacks.lock().expect("channel poisoned").write = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.callbacks.lock().expect("channel poisoned").close = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.callbacks.lock().expect("channel poisoned").error = Some(cb);
    }

    /// Tie this channel to its owning object. Dispatch upgrades the weak
    /// reference and drops the whole event batch if the owner is gone, so an
    /// owner destroyed by an earlier handler in the same poll batch is never
    /// called into.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().expect("channel poisoned") = Arc::downgrade(owner);
        self.state.lock().expect("channel poisoned").tied = true;
    }

    pub fn interest(&self) -> Interest {
        self.state.lock().expect("channel poisoned").interest
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub fn is_none_event(&self) -> bool {
        self.interest().is_empty()
    }

    pub fn enable_reading(&self) {
        self.change_interest(|i| i.add(Interest::READABLE));
    }

    pub fn disable_reading(&self) {
        self.change_interest(|i| i.remove(Interest::READABLE));
    }

    pub fn enable_writing(&self) {
        self.change_interest(|i| i.add(Interest::WRITABLE));
    }

    pub fn disable_writing(&self) {
        self.change_interest(|i| i.remove(Interest::WRITABLE));
    }

    pub fn disable_all(&self) {
        self.change_interest(|_| Interest::empty());
    }

    /// Drop the poller registration entirely. The channel must be disabled
    /// first.
    pub fn remove(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_channel(self);
        }
    }

    pub(crate) fn set_ready(&self, ready: Ready) {
        self.state.lock().expect("channel poisoned").ready = ready;
    }

    pub(crate) fn registration(&self) -> Registration {
        self.state.lock().expect("channel poisoned").registration
    }

    pub(crate) fn set_registration(&self, registration: Registration) {
        self.state.lock().expect("channel poisoned").registration = registration;
    }

    /// Dispatch the events recorded by the last poll.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let tied = self.state.lock().expect("channel poisoned").tied;
        if tied {
            // Keep the owner alive for the whole dispatch.
            let guard = self.tie.lock().expect("channel poisoned").upgrade();
            match guard {
                Some(_guard) => self.handle_event_with_guard(receive_time),
                None => trace!("fd {}: owner is gone, dropping event", self.fd),
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let ready = self.state.lock().expect("channel poisoned").ready;
        trace!("fd {}: handling {:?}", self.fd, ready);
        let mut cbs = self.callbacks.lock().expect("channel poisoned");

        // Hang-up with nothing left to read means the connection is done;
        // close wins over read/write. An error is reported alongside
        // whatever else fired.
        if ready.is_hup() && !ready.is_readable() {
            if let Some(cb) = cbs.close.as_mut() {
                cb();
            }
        }
        if ready.is_error() {
            if let Some(cb) = cbs.error.as_mut() {
                cb();
            }
        }
        if ready.is_readable() || ready.is_read_closed() {
            if let Some(cb) = cbs.read.as_mut() {
                cb(receive_time);
            }
        }
        if ready.is_writable() {
            if let Some(cb) = cbs.write.as_mut() {
                cb();
            }
        }
    }

    fn change_interest(&self, f: impl FnOnce(Interest) -> Interest) {
        {
            let mut state = self.state.lock().expect("channel poisoned");
            state.interest = f(state.interest);
        }
        self.update();
    }

    fn update(&self) {
        let (shared, this) = match (self.shared.upgrade(), self.self_ref.upgrade()) {
            (Some(shared), Some(this)) => (shared, this),
            // Loop already torn down; nothing to update against.
            _ => return,
        };
        shared.update_channel(&this);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("channel poisoned");
        fmt.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &state.interest)
            .field("registration", &state.registration)
            .finish()
    }
}
