use std::io;
use std::os::fd::RawFd;

/// One scatter read into `buf` plus `extension`, so a single syscall can
/// absorb a burst larger than the buffer's current writable region.
///
/// Returns the total byte count; the caller decides how much of it landed in
/// the extension.
pub(crate) fn read_fd_with_extension(
    fd: RawFd,
    buf: &mut [u8],
    extension: &mut [u8],
) -> io::Result<usize> {
    let mut iov = [
        libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        },
        libc::iovec {
            iov_base: extension.as_mut_ptr() as *mut libc::c_void,
            iov_len: extension.len(),
        },
    ];
    // Skip the extension when the in-place region is already large enough to
    // take a full burst on its own.
    let iovcnt = if buf.len() >= extension.len() { 1 } else { 2 };
    let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))?;
    Ok(n as usize)
}
