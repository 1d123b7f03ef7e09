//! Edge-triggered poller and the per-connection readiness handle
//!
//! `Poller` wraps an epoll instance plus an eventfd the reactor uses to
//! interrupt its own wait (off-thread reenables and external tasks write
//! it). `Ep` is the readiness registration token each connection owns:
//! started once with both directions of interest, modified as directions
//! enable and disable, stopped at close.
//!
//! Everything is edge-triggered: the kernel reports a readiness transition
//! once, and the connection's `triggered` flag holds it until a syscall
//! drains to EAGAIN.

use std::os::unix::io::RawFd;
use vconn_core::error::{NetError, NetResult};
use vconn_core::kdebug;

use crate::sock::{last_errno, NO_FD};

pub const EVENTIO_READ: u32 = 0x1;
pub const EVENTIO_WRITE: u32 = 0x2;

/// Tag reserved for the wakeup eventfd.
const WAKEUP_TAG: u64 = 0;

/// One readiness notification: the registration tag and the directions
/// that fired.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub tag: u64,
    pub flags: u32,
}

fn epoll_mask(flags: u32) -> u32 {
    let mut ev = libc::EPOLLET as u32;
    if flags & EVENTIO_READ != 0 {
        ev |= libc::EPOLLIN as u32;
    }
    if flags & EVENTIO_WRITE != 0 {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

/// The reactor's poll descriptor.
pub struct Poller {
    epfd: RawFd,
    wakeup_fd: RawFd,
}

impl Poller {
    pub fn new() -> NetResult<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::Os(last_errno()));
        }
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            let e = last_errno();
            unsafe { libc::close(epfd) };
            return Err(NetError::Os(e));
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKEUP_TAG,
        };
        let r = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wakeup_fd, &mut ev) };
        if r != 0 {
            let e = last_errno();
            unsafe {
                libc::close(wakeup_fd);
                libc::close(epfd);
            }
            return Err(NetError::Os(e));
        }
        Ok(Poller { epfd, wakeup_fd })
    }

    /// Wait for readiness. Fills `out` and returns the count, or a negative
    /// errno. Wakeup-eventfd notifications are drained internally and do
    /// not appear in `out`.
    pub fn wait(&self, out: &mut Vec<PollEvent>, max_events: usize, timeout_ms: i32) -> i64 {
        out.clear();
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; max_events];
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), max_events as i32, timeout_ms)
        };
        if n < 0 {
            let e = last_errno();
            if e == libc::EINTR {
                return 0;
            }
            return -(e as i64);
        }
        for ev in raw.iter().take(n as usize) {
            if ev.u64 == WAKEUP_TAG {
                self.drain_wakeup();
                continue;
            }
            let mut flags = 0u32;
            let bits = ev.events;
            let err = bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
            if err || bits & libc::EPOLLIN as u32 != 0 {
                flags |= EVENTIO_READ;
            }
            if err || bits & libc::EPOLLOUT as u32 != 0 {
                flags |= EVENTIO_WRITE;
            }
            out.push(PollEvent { tag: ev.u64, flags });
        }
        out.len() as i64
    }

    /// Interrupt a wait in progress. Coalesces: many wakes before the
    /// drain produce one notification.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.wakeup_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
        // EAGAIN means the counter is saturated and a wake is already
        // pending; nothing to do.
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(
                self.wakeup_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            );
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
            libc::close(self.epfd);
        }
    }
}

/// A connection's registration with its reactor's poller.
///
/// Owned by the VC; all calls happen on the owning reactor or under its
/// mutex. Survives with a copied `epfd` so later calls need no poller
/// reference (the registration dies with `stop`, and migration stops the
/// source registration before starting a fresh one on the target).
pub struct Ep {
    epfd: RawFd,
    fd: RawFd,
    tag: u64,
    mask: u32,
    started: bool,
}

impl Ep {
    pub fn new() -> Ep {
        Ep {
            epfd: NO_FD,
            fd: NO_FD,
            tag: 0,
            mask: 0,
            started: false,
        }
    }

    /// Register `fd` with the poller. Returns 0 or a negative errno.
    pub fn start(&mut self, poller: &Poller, fd: RawFd, tag: u64, flags: u32) -> i64 {
        debug_assert!(!self.started);
        let mut ev = libc::epoll_event {
            events: epoll_mask(flags),
            u64: tag,
        };
        let r = unsafe { libc::epoll_ctl(poller.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if r != 0 {
            return -(last_errno() as i64);
        }
        self.epfd = poller.epfd;
        self.fd = fd;
        self.tag = tag;
        self.mask = flags;
        self.started = true;
        0
    }

    /// Add directions of interest.
    pub fn modify_add(&mut self, flags: u32) -> i64 {
        self.set_mask(self.mask | flags)
    }

    /// Drop directions of interest.
    pub fn modify_remove(&mut self, flags: u32) -> i64 {
        self.set_mask(self.mask & !flags)
    }

    /// Re-arm the current registration. With epoll edge-triggering this is
    /// a plain MOD with the unchanged mask; kept so callers re-assert
    /// interest at every reschedule, which is what oneshot-style pollers
    /// require.
    pub fn refresh(&mut self) -> i64 {
        if !self.started {
            return 0;
        }
        let cur = self.mask;
        self.apply(cur)
    }

    /// Deregister. Idempotent; a stopped handle can be started again (the
    /// migration path does exactly that on the target poller).
    pub fn stop(&mut self) -> i64 {
        if !self.started {
            return 0;
        }
        let r = unsafe {
            libc::epoll_ctl(
                self.epfd,
                libc::EPOLL_CTL_DEL,
                self.fd,
                std::ptr::null_mut(),
            )
        };
        if r != 0 {
            kdebug!("ep stop: epoll_ctl DEL failed, errno {}", last_errno());
        }
        self.epfd = NO_FD;
        self.fd = NO_FD;
        self.mask = 0;
        self.started = false;
        0
    }

    fn set_mask(&mut self, mask: u32) -> i64 {
        if !self.started || mask == self.mask {
            self.mask = mask;
            return 0;
        }
        self.mask = mask;
        self.apply(mask)
    }

    fn apply(&mut self, mask: u32) -> i64 {
        let mut ev = libc::epoll_event {
            events: epoll_mask(mask),
            u64: self.tag,
        };
        let r = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, self.fd, &mut ev) };
        if r != 0 {
            return -(last_errno() as i64);
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::socketpair_nb;

    #[test]
    fn test_edge_triggered_readiness() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair_nb();
        let mut ep = Ep::new();
        assert_eq!(ep.start(&poller, b, 7, EVENTIO_READ | EVENTIO_WRITE), 0);

        // Fresh socket: write-ready edge.
        let mut events = Vec::new();
        let n = poller.wait(&mut events, 16, 100);
        assert!(n >= 1);
        let ev = events.iter().find(|e| e.tag == 7).unwrap();
        assert!(ev.flags & EVENTIO_WRITE != 0);

        // Data arrives: read edge.
        unsafe { libc::write(a, b"x".as_ptr() as *const libc::c_void, 1) };
        let n = poller.wait(&mut events, 16, 1000);
        assert!(n >= 1);
        let ev = events.iter().find(|e| e.tag == 7).unwrap();
        assert!(ev.flags & EVENTIO_READ != 0);

        // Edge semantics: no second notification without draining.
        let n = poller.wait(&mut events, 16, 50);
        assert!(!events.iter().any(|e| e.tag == 7 && e.flags & EVENTIO_READ != 0) || n == 0);

        ep.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_wakeup() {
        let poller = Poller::new().unwrap();
        let mut events = Vec::new();
        poller.wake();
        let start = std::time::Instant::now();
        let n = poller.wait(&mut events, 16, 5000);
        // The wake must end the wait promptly and not surface as an event.
        assert_eq!(n, 0);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair_nb();
        let mut ep = Ep::new();
        ep.start(&poller, a, 1, EVENTIO_READ);
        assert_eq!(ep.stop(), 0);
        assert_eq!(ep.stop(), 0);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
