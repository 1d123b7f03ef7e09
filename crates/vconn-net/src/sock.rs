//! Socket connection and non-blocking syscall wrappers
//!
//! All raw I/O uses the signed-return convention: `>= 0` is a byte count
//! (or an fd), `< 0` is a negative errno. Callers branch on specific
//! errnos (`-EAGAIN`, `-ECONNRESET`, ...) without going through `io::Error`.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use vconn_core::buffer::IoSpan;
use vconn_core::error::{NetError, NetResult};

pub const NO_FD: RawFd = -1;

#[inline]
fn neg_errno() -> i64 {
    -(unsafe { *libc::__errno_location() } as i64)
}

#[inline]
pub fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Scatter read. One span uses `read`, several use `readv`.
pub fn sock_read(fd: RawFd, spans: &[IoSpan]) -> i64 {
    if spans.is_empty() {
        return 0;
    }
    let r = if spans.len() == 1 {
        unsafe { libc::read(fd, spans[0].ptr as *mut libc::c_void, spans[0].len) as i64 }
    } else {
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; vconn_core::NET_MAX_IOV];
        for (i, s) in spans.iter().enumerate() {
            iov[i].iov_base = s.ptr as *mut libc::c_void;
            iov[i].iov_len = s.len;
        }
        unsafe { libc::readv(fd, iov.as_ptr(), spans.len() as i32) as i64 }
    };
    if r < 0 {
        neg_errno()
    } else {
        r
    }
}

/// Gather write via `sendmsg` with `MSG_NOSIGNAL`: a peer reset surfaces
/// as `-EPIPE`/`-ECONNRESET` instead of killing the process.
pub fn sock_write(fd: RawFd, spans: &[IoSpan]) -> i64 {
    if spans.is_empty() {
        return 0;
    }
    let mut iov = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; vconn_core::NET_MAX_IOV];
    for (i, s) in spans.iter().enumerate() {
        iov[i].iov_base = s.ptr as *mut libc::c_void;
        iov[i].iov_len = s.len;
    }
    let msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: iov.as_mut_ptr(),
        msg_iovlen: spans.len(),
        msg_control: std::ptr::null_mut(),
        msg_controllen: 0,
        msg_flags: 0,
    };
    let r = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) as i64 };
    if r < 0 {
        neg_errno()
    } else {
        r
    }
}

/// Best-effort urgent-data send.
pub fn sock_send_oob(fd: RawFd, buf: &[u8]) -> i64 {
    let r = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_OOB | libc::MSG_NOSIGNAL,
        ) as i64
    };
    if r < 0 {
        neg_errno()
    } else {
        r
    }
}

/// `how`: 0 = read, 1 = write, 2 = both.
pub fn sock_shutdown(fd: RawFd, how: i32) -> i64 {
    let r = unsafe { libc::shutdown(fd, how) as i64 };
    if r < 0 {
        neg_errno()
    } else {
        r
    }
}

fn set_nonblocking(fd: RawFd) -> NetResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(NetError::Os(last_errno()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(NetError::Os(last_errno()));
        }
    }
    Ok(())
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn addr_from_storage(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                sin.sin_addr.s_addr.to_ne_bytes().into(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                sin6.sin6_addr.s6_addr.into(),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// The socket a virtual connection owns: a descriptor plus addressing and
/// setup state. Moves between connections during thread migration; the fd
/// is closed exactly once, by whoever holds it last.
pub struct Connection {
    pub fd: RawFd,
    pub local: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
    pub is_bound: bool,
    pub is_connected: bool,
    pub sock_type: i32,
}

impl Connection {
    pub fn closed() -> Connection {
        Connection {
            fd: NO_FD,
            local: None,
            peer: None,
            is_bound: false,
            is_connected: false,
            sock_type: 0,
        }
    }

    /// Create a non-blocking stream socket for `target`'s address family.
    pub fn open(&mut self, target: &SocketAddr) -> NetResult<()> {
        debug_assert_eq!(self.fd, NO_FD);
        let family = match target {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(NetError::Os(last_errno()));
        }
        self.fd = fd;
        self.sock_type = libc::SOCK_STREAM;
        Ok(())
    }

    /// Start a non-blocking connect. `EINPROGRESS` counts as success; write
    /// readiness reports completion.
    pub fn connect(&mut self, target: &SocketAddr) -> NetResult<()> {
        let (storage, len) = sockaddr_of(target);
        let r = unsafe {
            libc::connect(
                self.fd,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if r != 0 {
            let e = last_errno();
            if e != libc::EINPROGRESS {
                return Err(NetError::Os(e));
            }
        }
        self.peer = Some(*target);
        self.is_connected = true;
        self.is_bound = true;
        Ok(())
    }

    /// Wire up a descriptor the caller already connected. Probes `SO_TYPE`
    /// (fails when the fd is not a socket, which is fine) and forces
    /// non-blocking mode.
    pub fn adopt(&mut self, fd: RawFd) -> NetResult<()> {
        let mut sock_type: i32 = 0;
        let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_TYPE,
                &mut sock_type as *mut _ as *mut libc::c_void,
                &mut len,
            );
        }
        set_nonblocking(fd)?;
        self.fd = fd;
        self.sock_type = sock_type;
        self.is_connected = true;
        self.is_bound = true;
        Ok(())
    }

    /// Record the locally bound address.
    pub fn set_local_addr(&mut self) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let r = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if r == 0 {
            self.local = addr_from_storage(&storage);
        }
    }

    pub fn close(&mut self) {
        if self.fd != NO_FD {
            unsafe { libc::close(self.fd) };
            self.fd = NO_FD;
        }
        self.is_bound = false;
        self.is_connected = false;
    }

    /// Take the connection, leaving this one closed-but-fdless. Used by
    /// thread migration: the descriptor survives while the source VC is
    /// torn down.
    pub fn move_out(&mut self) -> Connection {
        std::mem::replace(self, Connection::closed())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Listener helpers (acceptor-side setup for demos and tests) ───────

/// Bind + listen on `addr` with SO_REUSEADDR; non-blocking.
pub fn bind_listener(addr: &SocketAddr) -> NetResult<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(NetError::Os(last_errno()));
    }
    unsafe {
        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            4,
        );
    }
    let (storage, len) = sockaddr_of(addr);
    let r = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if r != 0 {
        let e = last_errno();
        unsafe { libc::close(fd) };
        return Err(NetError::Os(e));
    }
    if unsafe { libc::listen(fd, 1024) } != 0 {
        let e = last_errno();
        unsafe { libc::close(fd) };
        return Err(NetError::Os(e));
    }
    Ok(fd)
}

/// The local address a listener actually bound (port 0 resolves here).
pub fn listener_addr(fd: RawFd) -> NetResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let r = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if r != 0 {
        return Err(NetError::Os(last_errno()));
    }
    addr_from_storage(&storage).ok_or(NetError::Os(libc::EAFNOSUPPORT))
}

/// Accept one connection: returns the new fd (non-blocking, CLOEXEC,
/// TCP_NODELAY) or a negative errno.
pub fn accept_on(listen_fd: RawFd) -> i64 {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return neg_errno();
    }
    unsafe {
        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            4,
        );
    }
    fd as i64
}

/// Non-blocking connected socket pair, for tests.
#[cfg(test)]
pub(crate) fn socketpair_nb() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let r = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(r, 0, "socketpair failed: {}", last_errno());
    (fds[0], fds[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use vconn_core::MioBuffer;

    #[test]
    fn test_scatter_roundtrip_over_socketpair() {
        let (a, b) = socketpair_nb();
        let buf = MioBuffer::with_sizes(4, 64);
        buf.write(b"scatter me please");
        let (w, _) = buf.with_read_spans(0, 17, |spans| {
            assert!(spans.len() > 1);
            sock_write(a, spans)
        });
        assert_eq!(w, 17);

        let rbuf = MioBuffer::with_sizes(4, 64);
        let (r, _) = rbuf.with_write_spans(0, 32, |spans| sock_read(b, spans));
        assert_eq!(r, 17);
        rbuf.fill(r);
        let mut out = [0u8; 32];
        assert_eq!(rbuf.read(&mut out), 17);
        assert_eq!(&out[..17], b"scatter me please");

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_read_empty_socket_is_eagain() {
        let (a, b) = socketpair_nb();
        let buf = MioBuffer::new();
        let (r, _) = buf.with_write_spans(0, 16, |spans| sock_read(a, spans));
        assert_eq!(r, -(libc::EAGAIN as i64));
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_listener_accept() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let lfd = bind_listener(&addr).unwrap();
        let bound = listener_addr(lfd).unwrap();
        assert_ne!(bound.port(), 0);

        // Nothing pending yet.
        assert_eq!(accept_on(lfd), -(libc::EAGAIN as i64));

        let mut conn = Connection::closed();
        conn.open(&bound).unwrap();
        conn.connect(&bound).unwrap();
        // Give the kernel a moment to complete the loopback handshake.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let accepted = accept_on(lfd);
        assert!(accepted > 0, "accept failed: {}", accepted);

        unsafe {
            libc::close(accepted as RawFd);
            libc::close(lfd);
        }
    }
}
