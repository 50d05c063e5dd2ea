//! Platform-specific plumbing.
//!
//! Everything that talks to the kernel directly lives below this module:
//! epoll/poll(2), eventfd, timerfd and the raw socket calls. The rest of the
//! crate only sees the safe wrappers re-exported here.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{
    epoll::Epoll,
    socket::{self, Socket},
    timerfd::TimerFd,
    uio::read_fd_with_extension,
    waker::Waker,
};
