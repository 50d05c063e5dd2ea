use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Wake-up fd backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are added to the count; reads must also be 8 bytes and reset
/// the count to 0, returning the previous value.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = syscall!(eventfd(0, flags))?;
        Ok(Waker {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is about to overflow.
                // Reset the counter and wake again.
                self.drain()?;
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Consume the pending count. Called from the wake-up channel's read
    /// callback so a level-triggered poller does not spin.
    #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
    pub(crate) fn drain(&self) -> io::Result<()> {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            // Not woken yet; nothing to consume.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
