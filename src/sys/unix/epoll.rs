use std::cmp;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Thin RAII wrapper around an epoll instance.
///
/// Readiness interpretation (which bits mean readable, what to do with
/// `EPOLLHUP`) is left to the poller layer; this type only moves
/// `epoll_event`s across the syscall boundary.
#[derive(Debug)]
pub(crate) struct Epoll {
    epfd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
        })
    }

    /// Wait for events for at most `timeout`, appending into `events`.
    ///
    /// `events` is cleared first; at most `events.capacity()` events are
    /// returned.
    pub(crate) fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Duration,
    ) -> io::Result<()> {
        let timeout_ms = cmp::min(millis(timeout), i32::MAX as u64) as i32;

        events.clear();
        let cnt = syscall!(epoll_wait(
            self.epfd.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout_ms,
        ))?;
        unsafe { events.set_len(cnt as usize) };
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.epfd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn modify(&self, fd: RawFd, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.epfd.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        // Linux < 2.6.9 required a non-null event argument; keep a dummy one
        // for compatibility.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(
            self.epfd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            &mut event
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}

const NANOS_PER_MILLI: u32 = 1_000_000;
const MILLIS_PER_SEC: u64 = 1_000;

/// Convert a `Duration` to milliseconds, rounding up and saturating at
/// `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    // Round up.
    let millis = (duration.subsec_nanos() + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI;
    duration
        .as_secs()
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add(u64::from(millis))
}
