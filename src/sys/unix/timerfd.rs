use std::cmp;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

/// Kernel timer exposed as a file descriptor, on `CLOCK_MONOTONIC`.
///
/// Armed with a relative one-shot deadline only; periodic timers are
/// simulated by re-arming after every expiration batch, so the fd's readable
/// edge always corresponds to the earliest pending timer.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: File,
}

/// An already-due deadline is armed this far in the future instead of 0,
/// which would disarm the timer.
const MIN_ARM: Duration = Duration::from_micros(100);

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        Ok(TimerFd {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Re-arm to fire at `deadline`.
    pub(crate) fn set(&self, deadline: Instant) -> io::Result<()> {
        let delay = cmp::max(deadline.saturating_duration_since(Instant::now()), MIN_ARM);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(delay.subsec_nanos() as i32),
            },
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    /// Consume the expiration count so a level-triggered poller settles.
    pub(crate) fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(8) => Ok(u64::from_ne_bytes(buf)),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("timerfd read returned {} bytes instead of 8", n),
            )),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
