use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// An owned, always non-blocking, close-on-exec TCP socket.
///
/// This is the only type in the crate that closes a socket file descriptor:
/// channels and pollers borrow the raw fd but never own it.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

/// A `sockaddr_in` / `sockaddr_in6` by value, so a converted address can be
/// passed to the kernel without borrowing from the caller.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

/// Convert a std address into its C representation.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sockaddr_in },
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// `storage` must hold a `sockaddr_in` or `sockaddr_in6` written by the
/// kernel.
unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

impl Socket {
    /// Create a non-blocking stream socket for the given address family.
    pub(crate) fn new(family: libc::c_int) -> io::Result<Socket> {
        let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        let fd = syscall!(socket(family, ty, 0))?;
        Ok(unsafe { Socket::from_raw_fd(fd) })
    }

    /// Create a socket suitable for connecting to / binding `addr`.
    pub(crate) fn for_addr(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::new(family)
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw_addr, len) = socket_addr(addr);
        syscall!(bind(self.fd.as_raw_fd(), raw_addr.as_ptr(), len)).map(|_| ())
    }

    pub(crate) fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), backlog)).map(|_| ())
    }

    /// Initiate a non-blocking connect. `EINPROGRESS` is returned as an
    /// error like any other; the caller owns the errno triage.
    pub(crate) fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw_addr, len) = socket_addr(addr);
        syscall!(connect(self.fd.as_raw_fd(), raw_addr.as_ptr(), len)).map(|_| ())
    }

    /// Accept a peer; the returned socket is non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((socket, addr))
    }

    /// Write with `MSG_NOSIGNAL` so a reset peer yields `EPIPE` instead of
    /// killing the process with `SIGPIPE`.
    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        write_fd(self.fd.as_raw_fd(), buf)
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd.as_raw_fd(), libc::SHUT_WR)).map(|_| ())
    }

    pub(crate) fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    /// Fetch and clear `SO_ERROR`.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut errno: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errno as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        if errno == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(errno)))
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.fd.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    /// True when the kernel picked the connection's own (address, port)
    /// tuple as the source, i.e. the socket connected to itself.
    pub(crate) fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    fn set_opt(&self, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> io::Result<()> {
        syscall!(setsockopt(
            self.fd.as_raw_fd(),
            level,
            name,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
}

impl From<OwnedFd> for Socket {
    fn from(fd: OwnedFd) -> Socket {
        Socket { fd }
    }
}

impl From<Socket> for OwnedFd {
    fn from(socket: Socket) -> OwnedFd {
        socket.fd
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

/// `send(2)` with `MSG_NOSIGNAL`, usable on fds the caller does not own.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        libc::MSG_NOSIGNAL,
    ))?;
    Ok(n as usize)
}

/// A spare fd on `/dev/null`, sacrificed and reacquired to drain the accept
/// backlog under fd exhaustion.
pub(crate) fn open_dev_null() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
