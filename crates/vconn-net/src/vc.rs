//! The virtual connection
//!
//! A `NetVc` owns one socket and the state that lets a reactor multiplex
//! it: two directions of outstanding I/O, timeout deadlines, the recursion
//! latch that defers teardown while a callback is on the stack, and the
//! readiness registration. The public surface is the `do_io_*` family plus
//! `reenable`, `send_oob` and thread migration; the drain paths that move
//! actual bytes live in [`crate::io`].
//!
//! # Locking discipline
//!
//! Lock order, when more than one is taken: reactor mutex, then read VIO
//! mutex, then write VIO mutex. Every acquisition the reactor makes is a
//! try-lock; failure defers the work (retry timer or enable queue), never
//! blocks. VIO mutex identity is re-checked after every callback return
//! because a continuation may have replaced the VIO under us.
//!
//! # Safety
//!
//! `NetVc` is shared between the user and the reactor, so its hot flags are
//! atomics and its structured state sits in `UnsafeCell`s, each guarded by
//! a named lock:
//!
//! - `read`/`write` VIO cells: that direction's coordinating mutex.
//! - `con`, `ep`, `tls` cells: the owning reactor thread (or the reactor
//!   mutex for off-thread setup), plus the migration window where the
//!   caller is the single thread touching the connection.
//! - list links: the owning reactor's mutex.

use crate::cont::{ContRef, EventData};
use crate::handler::{now_ns, NetHandler, TimerAction};
use crate::io;
use crate::link::VcLink;
use crate::poll::{Ep, EVENTIO_READ, EVENTIO_WRITE};
use crate::sock::{sock_send_oob, sock_shutdown, Connection, NO_FD};
use crate::state::NetState;
use crate::stats::NET_STATS;
use crate::throttle::{check_net_throttle, check_throttle_warning};
use crate::tls::TlsHooks;
use crate::vio::{Vio, VioOp};
use std::cell::UnsafeCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, AtomicI32, AtomicI64, AtomicI8, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use vconn_core::error::ENET_THROTTLING;
use vconn_core::{current_thread_id, kdebug, CoMutex, Dir, MioBuffer, NetError, NetEvent, NetResult, SignalResult, SpinLock};

pub type VcRef = Arc<NetVc>;

pub(crate) const SHUTDOWN_READ: u8 = 0x1;
pub(crate) const SHUTDOWN_WRITE: u8 = 0x2;

const OOB_RETRY_MS: u64 = 10;

/// Which half (or both) to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    ReadWrite,
}

/// Which timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Inactivity,
    Active,
}

/// Result of `send_oob`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobResult {
    /// Delivered (or the peer is gone); nothing pending.
    Done,
    /// A retry is scheduled; cancellable via `cancel_oob`.
    Pending,
}

/// Introspection handles, mirroring the plugin-API data ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiDataId {
    ReadVio,
    WriteVio,
    Closed,
}

pub enum ApiData {
    Vio(*const Vio),
    Closed(i32),
}

struct OobPending {
    cont: ContRef,
    data: Vec<u8>,
    cancel: Arc<std::sync::atomic::AtomicBool>,
}

pub struct NetVc {
    pub(crate) con: UnsafeCell<Connection>,
    pub(crate) read: NetState,
    pub(crate) write: NetState,
    pub(crate) open_link: VcLink,
    /// The VC's own coordinating mutex; the default for VIOs whose
    /// continuation brings none.
    mutex: SpinLock<Arc<CoMutex>>,
    /// Back-reference to the owning reactor. Lookup only; cleared at close.
    nh: SpinLock<Option<Arc<NetHandler>>>,
    thread: AtomicU64,
    /// 0 open, 1 closed clean, -1 closed with error.
    closed: AtomicI8,
    lerrno: AtomicI32,
    /// Nonzero while a callback is on the stack; close defers until it
    /// returns to zero.
    pub(crate) recursion: AtomicI32,
    shutdown: AtomicU8,
    inactivity_timeout_in: AtomicI64,
    active_timeout_in: AtomicI64,
    pub(crate) next_inactivity_timeout_at: AtomicI64,
    pub(crate) next_activity_timeout_at: AtomicI64,
    /// Armed write-buffer-empty trap, 0 = none.
    write_buffer_empty_event: AtomicU8,
    pub(crate) ep: UnsafeCell<Ep>,
    tls: UnsafeCell<Option<Box<dyn TlsHooks>>>,
    oob: SpinLock<Option<OobPending>>,
    /// The acceptor's or connector's continuation.
    action: SpinLock<Option<ContRef>>,
    self_ref: Weak<NetVc>,
}

// Safety: see the module-level locking map.
unsafe impl Send for NetVc {}
unsafe impl Sync for NetVc {}

impl NetVc {
    pub fn new() -> VcRef {
        Arc::new_cyclic(|weak| {
            let mutex = CoMutex::new();
            NetVc {
                con: UnsafeCell::new(Connection::closed()),
                read: NetState::new(mutex.clone()),
                write: NetState::new(mutex.clone()),
                open_link: VcLink::new(),
                mutex: SpinLock::new(mutex),
                nh: SpinLock::new(None),
                thread: AtomicU64::new(0),
                closed: AtomicI8::new(0),
                lerrno: AtomicI32::new(0),
                recursion: AtomicI32::new(0),
                shutdown: AtomicU8::new(0),
                inactivity_timeout_in: AtomicI64::new(0),
                active_timeout_in: AtomicI64::new(0),
                next_inactivity_timeout_at: AtomicI64::new(0),
                next_activity_timeout_at: AtomicI64::new(0),
                write_buffer_empty_event: AtomicU8::new(0),
                ep: UnsafeCell::new(Ep::new()),
                tls: UnsafeCell::new(None),
                oob: SpinLock::new(None),
                action: SpinLock::new(None),
                self_ref: weak.clone(),
            }
        })
    }

    /// Restore a recycled connection to its pristine state. Caller owns
    /// the only strong reference.
    pub(crate) fn reset(&self) {
        debug_assert_eq!(self.fd(), NO_FD);
        debug_assert!(!self.open_link.in_list());
        debug_assert!(!self.read.ready_link.in_list());
        debug_assert!(!self.write.ready_link.in_list());
        let mutex = CoMutex::new();
        *self.mutex.lock() = mutex.clone();
        *self.read.vio_mutex.lock() = mutex.clone();
        *self.write.vio_mutex.lock() = mutex;
        // Safety: sole owner during slab recycle.
        unsafe {
            self.read.vio_mut().reset();
            self.write.vio_mut().reset();
            *self.tls_mut() = None;
            *self.con_mut() = Connection::closed();
            *self.ep_mut() = Ep::new();
        }
        self.read.enabled.store(false, Ordering::Release);
        self.read.triggered.store(false, Ordering::Release);
        self.read.in_enabled_list.store(false, Ordering::Release);
        self.write.enabled.store(false, Ordering::Release);
        self.write.triggered.store(false, Ordering::Release);
        self.write.in_enabled_list.store(false, Ordering::Release);
        self.nh.lock().take();
        self.thread.store(0, Ordering::Release);
        self.closed.store(0, Ordering::Release);
        self.lerrno.store(0, Ordering::Release);
        self.recursion.store(0, Ordering::Release);
        self.shutdown.store(0, Ordering::Release);
        self.inactivity_timeout_in.store(0, Ordering::Release);
        self.active_timeout_in.store(0, Ordering::Release);
        self.next_inactivity_timeout_at.store(0, Ordering::Release);
        self.next_activity_timeout_at.store(0, Ordering::Release);
        self.write_buffer_empty_event.store(0, Ordering::Release);
        self.oob.lock().take();
        self.action.lock().take();
    }

    // ── Small accessors ──────────────────────────────────────────────

    #[inline]
    pub(crate) fn vc_ref(&self) -> VcRef {
        self.self_ref.upgrade().expect("connection already freed")
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        // Safety: reading an int field; torn reads impossible.
        unsafe { (*self.con.get()).fd }
    }

    /// Tri-state: 0 open, 1 closed clean, -1 closed with error.
    #[inline]
    pub fn closed(&self) -> i8 {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_closed(&self, v: i8) {
        self.closed.store(v, Ordering::Release);
    }

    /// Last OS error recorded on this connection, 0 if none.
    #[inline]
    pub fn lerrno(&self) -> i32 {
        self.lerrno.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_lerrno(&self, e: i32) {
        self.lerrno.store(e, Ordering::Release);
    }

    /// The VC's coordinating mutex.
    pub fn mutex(&self) -> Arc<CoMutex> {
        self.mutex.lock().clone()
    }

    pub(crate) fn set_mutex(&self, m: Arc<CoMutex>) {
        *self.mutex.lock() = m;
    }

    pub(crate) fn nh_ref(&self) -> Option<Arc<NetHandler>> {
        self.nh.lock().clone()
    }

    pub(crate) fn set_nh(&self, nh: Arc<NetHandler>) {
        *self.nh.lock() = Some(nh);
    }

    pub(crate) fn clear_nh(&self) {
        self.nh.lock().take();
    }

    pub(crate) fn set_action(&self, cont: ContRef) {
        *self.action.lock() = Some(cont);
    }

    #[inline]
    pub(crate) fn state(&self, dir: Dir) -> &NetState {
        match dir {
            Dir::Read => &self.read,
            Dir::Write => &self.write,
        }
    }

    #[inline]
    pub(crate) fn shutdown_flags(&self) -> u8 {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Arm the write-buffer-empty trap: deliver `event` once, when a write
    /// pass drains the reader buffer exactly.
    pub fn trap_write_buffer_empty(&self, event: NetEvent) {
        self.write_buffer_empty_event
            .store(event as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn wbe_raw(&self) -> u8 {
        self.write_buffer_empty_event.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn clear_wbe(&self) {
        self.write_buffer_empty_event.store(0, Ordering::Release);
    }

    /// Install TLS hooks. Must happen before the connection is handed to a
    /// reactor.
    pub fn set_tls(&self, hooks: Box<dyn TlsHooks>) {
        debug_assert!(self.nh_ref().is_none());
        // Safety: pre-install, single owner.
        unsafe { *self.tls_mut() = Some(hooks) };
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn con_mut(&self) -> &mut Connection {
        &mut *self.con.get()
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn ep_mut(&self) -> &mut Ep {
        &mut *self.ep.get()
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn tls_mut(&self) -> &mut Option<Box<dyn TlsHooks>> {
        &mut *self.tls.get()
    }

    /// Short-lived VIO peeks; each borrow begins and ends inside the call.
    #[inline]
    pub(crate) fn vio_op(&self, dir: Dir) -> VioOp {
        // Safety: field copy under the caller's lock discipline.
        unsafe { (*self.state(dir).vio.get()).op }
    }

    #[inline]
    pub(crate) fn vio_cont(&self, dir: Dir) -> Option<ContRef> {
        // Safety: as above.
        unsafe { (*self.state(dir).vio.get()).cont.clone() }
    }

    /// Progress of a direction's VIO as `(ndone, nbytes)`.
    pub fn vio_progress(&self, dir: Dir) -> (i64, i64) {
        // Safety: field copies; callers read these from inside callbacks
        // where the direction's mutex is held.
        unsafe {
            let vio = &*self.state(dir).vio.get();
            (vio.ndone, vio.nbytes)
        }
    }

    /// The buffer attached to a direction's VIO.
    pub fn vio_buffer(&self, dir: Dir) -> Option<Arc<MioBuffer>> {
        // Safety: as above.
        unsafe { (*self.state(dir).vio.get()).buffer.clone() }
    }

    // ── TLS capability ───────────────────────────────────────────────

    #[inline]
    pub(crate) fn handshake_complete(&self) -> bool {
        // Safety: owner-thread read.
        unsafe { (*self.tls.get()).as_ref().map_or(true, |t| t.handshake_complete()) }
    }

    #[inline]
    pub(crate) fn tls_is_client(&self) -> bool {
        // Safety: owner-thread read.
        unsafe { (*self.tls.get()).as_ref().map_or(false, |t| t.is_client()) }
    }

    pub(crate) fn tls_start_handshake(&self, side: crate::tls::TlsSide) -> crate::tls::HandshakeOutcome {
        // Safety: owner-thread access.
        match unsafe { (*self.tls.get()).as_mut() } {
            Some(t) => t.start_handshake(side),
            None => crate::tls::HandshakeOutcome::Done,
        }
    }

    // ── Public contract: do_io_* ─────────────────────────────────────

    /// Prepare a read VIO: up to `nbytes` into `buf`, events to `cont`.
    ///
    /// A null continuation is only legal with a zero byte goal. Passing no
    /// buffer disables reading. Fails on a closed connection; the caller
    /// must treat that as fatal and drop the connection.
    ///
    /// The caller must hold the direction's current coordinating mutex (a
    /// continuation inside a callback already does).
    pub fn do_io_read(
        &self,
        cont: Option<ContRef>,
        nbytes: i64,
        buf: Option<Arc<MioBuffer>>,
    ) -> NetResult<()> {
        debug_assert!(cont.is_some() || nbytes == 0);
        if self.closed() != 0 {
            kdebug!("do_io_read on closed vc {:p}", self);
            return Err(NetError::Closed);
        }
        let m = cont
            .as_ref()
            .map(|c| c.mutex())
            .unwrap_or_else(|| self.mutex());
        // Hold the incoming mutex across the rewrite so anyone who reads
        // the slot and locks sees a whole VIO. Recursive when the caller
        // is the continuation itself.
        let _g = m.lock();
        *self.read.vio_mutex.lock() = m.clone();
        let has_buf = buf.is_some();
        // Safety: holding the coordinating mutex just published.
        unsafe {
            let vio = self.read.vio_mut();
            vio.op = VioOp::Read;
            vio.cont = cont;
            vio.nbytes = nbytes;
            vio.ndone = 0;
            vio.buffer = buf;
        }
        if has_buf {
            if !self.read.enabled() {
                self.reenable(Dir::Read);
            }
        } else {
            self.read.enabled.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Prepare a write VIO: up to `nbytes` drained from `reader`.
    ///
    /// Same preconditions as [`do_io_read`]; passing no reader disables
    /// writing.
    pub fn do_io_write(
        &self,
        cont: Option<ContRef>,
        nbytes: i64,
        reader: Option<Arc<MioBuffer>>,
    ) -> NetResult<()> {
        if self.closed() != 0 {
            kdebug!("do_io_write on closed vc {:p}", self);
            return Err(NetError::Closed);
        }
        let m = cont
            .as_ref()
            .map(|c| c.mutex())
            .unwrap_or_else(|| self.mutex());
        let _g = m.lock();
        *self.write.vio_mutex.lock() = m.clone();
        let has_reader = reader.is_some();
        // Safety: holding the coordinating mutex just published.
        unsafe {
            let vio = self.write.vio_mut();
            vio.op = VioOp::Write;
            vio.cont = cont;
            vio.nbytes = nbytes;
            vio.ndone = 0;
            if has_reader {
                vio.buffer = reader;
            }
        }
        if has_reader {
            if nbytes != 0 && !self.write.enabled() {
                self.reenable(Dir::Write);
            }
        } else {
            self.write.enabled.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Request teardown. `alerrno == -1` closes clean; any other value
    /// closes with error and (when nonzero) records it as `lerrno`.
    ///
    /// If no callback is on the stack and the caller already holds the
    /// reactor's mutex (or the connection was never installed), the close
    /// completes inline; otherwise the owning reactor finalizes it on its
    /// next pass.
    pub fn do_io_close(&self, alerrno: i32) {
        self.read.enabled.store(false, Ordering::Release);
        self.write.enabled.store(false, Ordering::Release);
        {
            let m = self.read.vio_mutex();
            let _g = m.lock();
            // Safety: holding the read coordinating mutex.
            unsafe {
                let vio = self.read.vio_mut();
                vio.buffer = None;
                vio.nbytes = 0;
                vio.op = VioOp::None;
                vio.cont = None;
            }
        }
        {
            let m = self.write.vio_mutex();
            let _g = m.lock();
            // Safety: holding the write coordinating mutex.
            unsafe {
                let vio = self.write.vio_mut();
                vio.buffer = None;
                vio.nbytes = 0;
                vio.op = VioOp::None;
                vio.cont = None;
            }
        }

        let nh = self.nh_ref();
        let close_inline = self.recursion.load(Ordering::Acquire) == 0
            && nh.as_ref().map_or(true, |nh| nh.mutex.is_held_by_current());

        // The disable above must be visible before anyone observes the
        // closed flag.
        fence(Ordering::SeqCst);
        if alerrno != 0 && alerrno != -1 {
            self.set_lerrno(alerrno);
        }
        self.set_closed(if alerrno == -1 { 1 } else { -1 });

        if close_inline {
            close_vc(&self.vc_ref(), nh.as_ref());
        }
    }

    /// Half-close one or both directions.
    pub fn do_io_shutdown(&self, howto: ShutdownHow) {
        let fd = self.fd();
        match howto {
            ShutdownHow::Read => {
                sock_shutdown(fd, 0);
                self.read.enabled.store(false, Ordering::Release);
                let m = self.read.vio_mutex();
                let _g = m.lock();
                // Safety: holding the read coordinating mutex.
                unsafe {
                    let vio = self.read.vio_mut();
                    vio.buffer = None;
                    vio.nbytes = 0;
                }
                self.shutdown.fetch_or(SHUTDOWN_READ, Ordering::AcqRel);
            }
            ShutdownHow::Write => {
                sock_shutdown(fd, 1);
                self.write.enabled.store(false, Ordering::Release);
                let m = self.write.vio_mutex();
                let _g = m.lock();
                // Safety: holding the write coordinating mutex.
                unsafe {
                    let vio = self.write.vio_mut();
                    vio.buffer = None;
                    vio.nbytes = 0;
                }
                self.shutdown.fetch_or(SHUTDOWN_WRITE, Ordering::AcqRel);
            }
            ShutdownHow::ReadWrite => {
                sock_shutdown(fd, 2);
                self.read.enabled.store(false, Ordering::Release);
                self.write.enabled.store(false, Ordering::Release);
                {
                    let m = self.read.vio_mutex();
                    let _g = m.lock();
                    // Safety: holding the read coordinating mutex.
                    unsafe {
                        let vio = self.read.vio_mut();
                        vio.buffer = None;
                        vio.nbytes = 0;
                    }
                }
                {
                    let m = self.write.vio_mutex();
                    let _g = m.lock();
                    // Safety: holding the write coordinating mutex.
                    unsafe {
                        let vio = self.write.vio_mut();
                        vio.buffer = None;
                        vio.nbytes = 0;
                    }
                }
                self.shutdown
                    .fetch_or(SHUTDOWN_READ | SHUTDOWN_WRITE, Ordering::AcqRel);
            }
        }
    }

    // ── Reenable ─────────────────────────────────────────────────────

    /// Mark a direction enabled and arm the inactivity deadline if
    /// configured but not running.
    pub(crate) fn set_enabled(&self, dir: Dir) {
        debug_assert!(self.closed() == 0);
        self.state(dir).enabled.store(true, Ordering::Release);
        let in_ns = self.inactivity_timeout_in.load(Ordering::Acquire);
        if in_ns != 0
            && self.next_inactivity_timeout_at.load(Ordering::Acquire) == 0
        {
            self.next_inactivity_timeout_at
                .store(now_ns() + in_ns, Ordering::Release);
        }
    }

    /// Signal that progress should resume in `dir`.
    ///
    /// Preconditions: the direction's coordinating mutex is held by the
    /// calling thread and the connection is open. On the reactor (or when
    /// its mutex can be taken) the ready list and poller registration are
    /// reconciled immediately; otherwise the connection lands on the
    /// enable queue exactly once and the reactor is woken.
    pub fn reenable(&self, dir: Dir) {
        let s = self.state(dir);
        if s.enabled() {
            return;
        }
        debug_assert!(s.vio_mutex().is_held_by_current());
        self.set_enabled(dir);
        let nh = match self.nh_ref() {
            Some(nh) => nh,
            None => return,
        };
        let flag = match dir {
            Dir::Read => EVENTIO_READ,
            Dir::Write => EVENTIO_WRITE,
        };
        let lock = nh.mutex.try_lock();
        match lock {
            Some(_g) => {
                // Safety: reactor mutex held.
                let ep = unsafe { self.ep_mut() };
                ep.modify_add(flag);
                ep.refresh();
                let lists = nh.lists();
                let ready = lists.ready(dir);
                if s.triggered() {
                    ready.in_or_enqueue(self as *const NetVc);
                } else {
                    ready.remove(self);
                }
            }
            None => {
                if !s.in_enabled_list.swap(true, Ordering::AcqRel) {
                    nh.enable_queue(dir).push(self.vc_ref());
                }
                nh.wake();
            }
        }
    }

    /// Re-enable and, when called on the reactor with readiness pending,
    /// drive the drain path synchronously. Falls back to [`reenable`]
    /// off-reactor.
    pub fn reenable_re(&self, dir: Dir) {
        let nh = match self.nh_ref() {
            Some(nh) => nh,
            None => return,
        };
        if nh.mutex.is_held_by_current() {
            self.set_enabled(dir);
            let flag = match dir {
                Dir::Read => EVENTIO_READ,
                Dir::Write => EVENTIO_WRITE,
            };
            // Safety: reactor mutex held.
            let ep = unsafe { self.ep_mut() };
            ep.modify_add(flag);
            ep.refresh();
            if self.state(dir).triggered() {
                let vc = self.vc_ref();
                match dir {
                    Dir::Read => io::net_read_io(&nh, &vc),
                    Dir::Write => io::write_to_net(&nh, &vc),
                }
            } else {
                nh.lists().ready(dir).remove(self);
            }
        } else {
            self.reenable(dir);
        }
    }

    // ── Timeouts ─────────────────────────────────────────────────────

    /// Arm (or with zero, disarm) the inactivity timeout.
    pub fn set_inactivity_timeout(&self, timeout: Duration) {
        let ns = timeout.as_nanos() as i64;
        self.inactivity_timeout_in.store(ns, Ordering::Release);
        self.next_inactivity_timeout_at
            .store(if ns != 0 { now_ns() + ns } else { 0 }, Ordering::Release);
    }

    /// Arm (or with zero, disarm) the absolute-lifetime timeout.
    pub fn set_active_timeout(&self, timeout: Duration) {
        let ns = timeout.as_nanos() as i64;
        self.active_timeout_in.store(ns, Ordering::Release);
        self.next_activity_timeout_at
            .store(if ns != 0 { now_ns() + ns } else { 0 }, Ordering::Release);
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_nanos(self.inactivity_timeout_in.load(Ordering::Acquire) as u64)
    }

    pub fn active_timeout(&self) -> Duration {
        Duration::from_nanos(self.active_timeout_in.load(Ordering::Acquire) as u64)
    }

    /// Push the inactivity deadline out after I/O progress.
    pub(crate) fn net_activity(&self) {
        let in_ns = self.inactivity_timeout_in.load(Ordering::Acquire);
        self.next_inactivity_timeout_at
            .store(if in_ns != 0 { now_ns() + in_ns } else { 0 }, Ordering::Release);
    }

    // ── OOB ──────────────────────────────────────────────────────────

    /// Single-shot urgent write. Complete sends deliver `OOB_COMPLETE`
    /// synchronously; a zero return delivers `EOS`; partial progress or a
    /// would-block schedules a retry with the remainder in 10 ms.
    ///
    /// The caller must hold `cont`'s mutex; at most one OOB send may be
    /// outstanding per connection.
    pub fn send_oob(&self, cont: ContRef, data: &[u8]) -> OobResult {
        debug_assert!(!data.is_empty());
        debug_assert!(self.oob.lock().is_none());
        debug_assert!(cont.mutex().is_held_by_current());
        let written = sock_send_oob(self.fd(), data);
        if written == data.len() as i64 {
            cont.handle_event(NetEvent::OobComplete, EventData::None);
            return OobResult::Done;
        }
        if written == 0 {
            cont.handle_event(NetEvent::Eos, EventData::None);
            return OobResult::Done;
        }
        let rest = if written > 0 {
            data[written as usize..].to_vec()
        } else {
            debug_assert!(
                written == -(libc::EAGAIN as i64) || written == -(libc::ENOTCONN as i64),
                "unexpected OOB send error {}",
                written
            );
            data.to_vec()
        };
        let nh = self.nh_ref().expect("send_oob before the connection joined a reactor");
        let cancel = nh.schedule_in(
            OOB_RETRY_MS,
            TimerAction::OobRetry {
                vc: self.vc_ref(),
            },
        );
        *self.oob.lock() = Some(OobPending {
            cont,
            data: rest,
            cancel,
        });
        OobResult::Pending
    }

    /// Cancel a pending OOB retry.
    pub fn cancel_oob(&self) {
        if let Some(p) = self.oob.lock().take() {
            p.cancel.store(true, Ordering::Release);
        }
    }

    /// Timer callback: re-issue the remainder. Lock misses re-arm the
    /// timer instead of blocking the reactor.
    pub(crate) fn retry_oob(&self, nh: &Arc<NetHandler>) {
        let pending = match self.oob.lock().take() {
            Some(p) => p,
            None => return,
        };
        let m = pending.cont.mutex();
        let lock = m.try_lock();
        match lock {
            Some(_g) => {
                self.send_oob(pending.cont.clone(), &pending.data);
            }
            None => {
                let cancel = nh.schedule_in(
                    OOB_RETRY_MS,
                    TimerAction::OobRetry {
                        vc: self.vc_ref(),
                    },
                );
                *self.oob.lock() = Some(OobPending {
                    cont: pending.cont,
                    data: pending.data,
                    cancel,
                });
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn get_data(&self, id: ApiDataId) -> Option<ApiData> {
        match id {
            ApiDataId::ReadVio => Some(ApiData::Vio(self.read.vio.get() as *const Vio)),
            ApiDataId::WriteVio => Some(ApiData::Vio(self.write.vio.get() as *const Vio)),
            ApiDataId::Closed => Some(ApiData::Closed(self.closed() as i32)),
        }
    }

    // ── Thread migration ─────────────────────────────────────────────

    /// Move this established connection to the calling reactor.
    ///
    /// Precondition: the caller is `target`'s reactor thread and holds its
    /// mutex. The descriptor and any TLS session are carried over; the
    /// source VC is closed (and freed on its own thread) without closing
    /// the fd, and the global open count is left unchanged.
    pub fn migrate_to_current_thread(
        &self,
        cont: &ContRef,
        target: &Arc<NetHandler>,
    ) -> NetResult<VcRef> {
        debug_assert!(target.mutex.is_held_by_current());
        if let Some(cur) = self.nh_ref() {
            if Arc::ptr_eq(&cur, target) {
                return Ok(self.vc_ref());
            }
        }
        // Safety: migration window; the caller is the only thread driving
        // this connection (it is not executing on its source reactor).
        let held_con = unsafe { self.con_mut() }.move_out();
        let tls = unsafe { self.tls_mut() }.take();
        // No further kernel events may reach the source reactor.
        unsafe { self.ep_mut() }.stop();
        // Frees the source VC on its own thread; the fd moved out above.
        self.do_io_close(-1);
        // That close decrements the open count, but the logical connection
        // persists.
        NET_STATS.connection_opened();

        let nvc = target.slab_alloc();
        if let Some(hooks) = tls {
            // Safety: fresh VC, not yet installed.
            unsafe { *nvc.tls_mut() = Some(hooks) };
        }
        match populate(&nvc, held_con, cont, target) {
            Ok(()) => Ok(nvc),
            Err(e) => {
                nvc.do_io_close(-1);
                NET_STATS.connection_closed();
                Err(e)
            }
        }
    }
}

// ── Lifecycle entry points ───────────────────────────────────────────

/// Install an accepted connection into `nh` and deliver `ACCEPT`.
///
/// Retries on a reactor-mutex miss after the configured delay. Seeds the
/// read direction as triggered so data that raced the registration is
/// drained on the first pass.
pub(crate) fn accept_event(vc: &VcRef, nh: &Arc<NetHandler>) {
    vc.thread.store(current_thread_id(), Ordering::Release);
    let guard = nh.mutex.try_lock();
    if guard.is_none() {
        nh.schedule_in(
            nh.config.net_retry_delay_ms,
            TimerAction::Accept { vc: vc.clone() },
        );
        return;
    }
    vc.set_nh(nh.clone());
    let tag = Arc::as_ptr(vc) as u64;
    // Safety: reactor mutex held.
    let r = unsafe { vc.ep_mut() }.start(&nh.poller, vc.fd(), tag, EVENTIO_READ | EVENTIO_WRITE);
    if r < 0 {
        kdebug!("accept_event: poller registration failed ({})", r);
        close_vc(vc, Some(nh));
        return;
    }
    let lists = nh.lists();
    lists.open.enqueue_owned(vc.clone());
    NET_STATS.connection_opened();

    vc.read.triggered.store(true, Ordering::Release);
    lists.read_ready.in_or_enqueue(Arc::as_ptr(vc));

    // Re-arm deadlines the acceptor may have configured before handing the
    // connection over.
    let in_ns = vc.inactivity_timeout_in.load(Ordering::Acquire);
    if in_ns != 0 {
        vc.next_inactivity_timeout_at
            .store(now_ns() + in_ns, Ordering::Release);
    }
    let act_ns = vc.active_timeout_in.load(Ordering::Acquire);
    if act_ns != 0 {
        vc.next_activity_timeout_at
            .store(now_ns() + act_ns, Ordering::Release);
    }

    let action = vc.action.lock().clone();
    if let Some(a) = action {
        let m = a.mutex();
        let _g = m.lock();
        a.handle_event(NetEvent::Accept, EventData::Vc(vc.clone()));
    }
}

/// Open (or adopt) an outbound connection and deliver `OPEN` or
/// `OPEN_FAILED`.
pub(crate) fn connect_up(
    vc: &VcRef,
    nh: &Arc<NetHandler>,
    target: Option<SocketAddr>,
    fd: Option<RawFd>,
) {
    vc.thread.store(current_thread_id(), Ordering::Release);
    let guard = nh.mutex.try_lock();
    if guard.is_none() {
        nh.schedule_in(
            nh.config.net_retry_delay_ms,
            TimerAction::Connect {
                vc: vc.clone(),
                target,
                fd,
            },
        );
        return;
    }

    let action = vc.action.lock().clone();
    let deliver_failed = |err: i32| {
        if let Some(a) = &action {
            let m = a.mutex();
            let _g = m.lock();
            a.handle_event(NetEvent::OpenFailed, EventData::Errno(err));
        }
    };

    if check_net_throttle(nh.config.max_connections) {
        check_throttle_warning(now_ns());
        deliver_failed(-ENET_THROTTLING);
        return;
    }

    // Safety: reactor mutex held; connection not yet shared.
    let con = unsafe { vc.con_mut() };
    match fd {
        Some(fd) => {
            if let Err(NetError::Os(e)) = con.adopt(fd) {
                vc.set_lerrno(e);
                deliver_failed(-e);
                return;
            }
        }
        None => {
            let target = match target {
                Some(t) => t,
                None => {
                    deliver_failed(-(libc::EINVAL));
                    return;
                }
            };
            if let Err(NetError::Os(e)) = con.open(&target) {
                vc.set_lerrno(e);
                deliver_failed(-e);
                return;
            }
        }
    }

    // Register before connecting: with edge triggering, a connect that
    // completes before registration would lose its only write edge.
    let tag = Arc::as_ptr(vc) as u64;
    let r = unsafe { vc.ep_mut() }.start(&nh.poller, con.fd, tag, EVENTIO_READ | EVENTIO_WRITE);
    if r < 0 {
        vc.set_lerrno((-r) as i32);
        kdebug!("connect_up: poller registration failed ({})", r);
        con.close();
        deliver_failed(r as i32);
        return;
    }

    if fd.is_none() {
        if let Err(NetError::Os(e)) = con.connect(&target.unwrap()) {
            vc.set_lerrno(e);
            unsafe { vc.ep_mut() }.stop();
            con.close();
            deliver_failed(-e);
            return;
        }
    }
    con.set_local_addr();

    vc.set_nh(nh.clone());
    let lists = nh.lists();
    lists.open.enqueue_owned(vc.clone());
    NET_STATS.connection_opened();

    if let Some(a) = &action {
        let m = a.mutex();
        let _g = m.lock();
        a.handle_event(NetEvent::Open, EventData::Vc(vc.clone()));
    }
}

/// Attach a moved connection to the calling reactor (migration tail).
pub(crate) fn populate(
    vc: &VcRef,
    con: Connection,
    cont: &ContRef,
    nh: &Arc<NetHandler>,
) -> NetResult<()> {
    // Safety: fresh VC, single owner until installed below.
    unsafe { *vc.con_mut() = con };
    vc.set_mutex(cont.mutex());
    vc.thread.store(current_thread_id(), Ordering::Release);

    let tag = Arc::as_ptr(vc) as u64;
    let r = unsafe { vc.ep_mut() }.start(&nh.poller, vc.fd(), tag, EVENTIO_READ | EVENTIO_WRITE);
    if r < 0 {
        kdebug!("populate: poller registration failed ({})", r);
        return Err(NetError::PollRegistration((-r) as i32));
    }
    let guard = nh.mutex.try_lock();
    if guard.is_none() {
        // Caller closes the new VC; nothing installed yet.
        return Err(NetError::HandlerBusy);
    }
    vc.set_nh(nh.clone());
    let lists = nh.lists();
    debug_assert!(!lists.open.contains(vc));
    lists.open.enqueue_owned(vc.clone());
    debug_assert!(vc.fd() != NO_FD);
    Ok(())
}

/// Timeout delivery. Takes, in order, the reactor mutex and both VIO
/// mutexes by try-lock; any miss (or a VIO mutex identity change since
/// arming) re-arms a retry and reports no progress.
pub(crate) fn main_event(vc: &VcRef, nh: &Arc<NetHandler>, kind: TimeoutKind) -> SignalResult {
    let retry = || {
        nh.schedule_in(
            nh.config.net_retry_delay_ms,
            TimerAction::MainEvent {
                vc: vc.clone(),
                kind,
            },
        );
    };

    let hlock = nh.mutex.try_lock();
    if hlock.is_none() {
        retry();
        return SignalResult::Continue;
    }
    let rm = vc.read.vio_mutex();
    let wm = vc.write.vio_mutex();
    let rlock = rm.try_lock();
    if rlock.is_none() {
        retry();
        return SignalResult::Continue;
    }
    let wlock = wm.try_lock();
    if wlock.is_none() {
        retry();
        return SignalResult::Continue;
    }
    if vc.read.vio_mutex_changed(&rm) || vc.write.vio_mutex_changed(&wm) {
        retry();
        return SignalResult::Continue;
    }

    let now = now_ns();
    let (event, deadline) = match kind {
        TimeoutKind::Inactivity => (
            NetEvent::InactivityTimeout,
            &vc.next_inactivity_timeout_at,
        ),
        TimeoutKind::Active => (NetEvent::ActiveTimeout, &vc.next_activity_timeout_at),
    };
    // The deadline may have been pushed out (or disarmed) since this fire
    // was decided; deliver nothing in that case.
    let at = deadline.load(Ordering::Acquire);
    if at == 0 || at > now {
        return SignalResult::Continue;
    }
    if kind == TimeoutKind::Inactivity && vc.inactivity_timeout_in.load(Ordering::Acquire) == 0 {
        return SignalResult::Continue;
    }
    deadline.store(0, Ordering::Release);

    let writer_cont = vc.vio_cont(Dir::Write);

    if vc.closed() != 0 {
        close_vc(vc, Some(nh));
        return SignalResult::Done;
    }

    let mut reader_cont: Option<ContRef> = None;
    if vc.vio_op(Dir::Read) == VioOp::Read && vc.shutdown_flags() & SHUTDOWN_READ == 0 {
        reader_cont = vc.vio_cont(Dir::Read);
        if io::read_signal_and_update(event, vc) == SignalResult::Done {
            return SignalResult::Done;
        }
    }

    // The reader's callback may have re-armed the timeout or rearranged
    // the write VIO; deliver to the writer only when neither happened and
    // the two continuations genuinely differ (one continuation must not
    // hear the same timeout twice).
    let rearmed = deadline.load(Ordering::Acquire) != 0;
    let wcont_now = vc.vio_cont(Dir::Write);
    if !rearmed
        && vc.closed() == 0
        && vc.vio_op(Dir::Write) == VioOp::Write
        && vc.shutdown_flags() & SHUTDOWN_WRITE == 0
        && !crate::cont::cont_eq(reader_cont.as_ref(), wcont_now.as_ref())
        && crate::cont::cont_eq(writer_cont.as_ref(), wcont_now.as_ref())
    {
        if io::write_signal_and_update(event, vc) == SignalResult::Done {
            return SignalResult::Done;
        }
    }
    SignalResult::Continue
}

/// Tear a connection down: cancel OOB, deregister, close the fd, delist
/// everywhere, park the reactor's strong reference in the graveyard.
pub(crate) fn close_vc(vc: &VcRef, nh: Option<&Arc<NetHandler>>) {
    vc.cancel_oob();
    // Safety: inline close runs under the reactor mutex or before install;
    // deferred close runs on the owning reactor.
    unsafe { vc.ep_mut() }.stop();
    unsafe { vc.con_mut() }.close();

    vc.next_inactivity_timeout_at.store(0, Ordering::Release);
    vc.next_activity_timeout_at.store(0, Ordering::Release);
    vc.inactivity_timeout_in.store(0, Ordering::Release);
    vc.active_timeout_in.store(0, Ordering::Release);

    if let Some(nh) = nh {
        debug_assert!(nh.mutex.is_held_by_current());
        let lists = nh.lists();
        lists.read_ready.remove(vc);
        lists.write_ready.remove(vc);
        vc.read.in_enabled_list.store(false, Ordering::Release);
        vc.write.in_enabled_list.store(false, Ordering::Release);
        if let Some(owned) = lists.open.remove_owned(vc) {
            NET_STATS.connection_closed();
            lists.graveyard.lock().push(owned);
        }
    }
    vc.clear_nh();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cont::Continuation;

    struct Sink {
        mutex: Arc<CoMutex>,
    }

    impl Sink {
        fn new() -> Arc<Sink> {
            Arc::new(Sink {
                mutex: CoMutex::new(),
            })
        }
    }

    impl Continuation for Sink {
        fn mutex(&self) -> Arc<CoMutex> {
            self.mutex.clone()
        }
        fn handle_event(&self, _event: NetEvent, _data: EventData) {}
    }

    #[test]
    fn test_close_on_fresh_vc() {
        // Closing a connection that never joined a reactor is a no-op
        // beyond marking it closed.
        let vc = NetVc::new();
        vc.do_io_close(-1);
        assert_eq!(vc.closed(), 1);
        assert_eq!(vc.fd(), NO_FD);
        assert_eq!(vc.lerrno(), 0);
    }

    #[test]
    fn test_close_with_error_records_lerrno() {
        let vc = NetVc::new();
        vc.do_io_close(libc::ECONNREFUSED);
        assert_eq!(vc.closed(), -1);
        assert_eq!(vc.lerrno(), libc::ECONNREFUSED);
    }

    #[test]
    fn test_do_io_on_closed_vc_fails() {
        let vc = NetVc::new();
        vc.do_io_close(-1);
        let cont: ContRef = Sink::new();
        assert!(matches!(
            vc.do_io_read(Some(cont.clone()), 10, Some(MioBuffer::new())),
            Err(NetError::Closed)
        ));
        assert!(matches!(
            vc.do_io_write(Some(cont), 10, Some(MioBuffer::new())),
            Err(NetError::Closed)
        ));
    }

    #[test]
    fn test_do_io_read_arms_direction() {
        let vc = NetVc::new();
        let cont: ContRef = Sink::new();
        vc.do_io_read(Some(cont.clone()), 100, Some(MioBuffer::new()))
            .unwrap();
        assert!(vc.read.enabled());
        assert_eq!(vc.vio_op(Dir::Read), VioOp::Read);
        let (ndone, nbytes) = vc.vio_progress(Dir::Read);
        assert_eq!((ndone, nbytes), (0, 100));
        // No buffer disables the direction.
        vc.do_io_read(Some(cont), 0, None).unwrap();
        assert!(!vc.read.enabled());
    }

    #[test]
    fn test_do_io_write_without_nbytes_stays_disabled() {
        let vc = NetVc::new();
        let cont: ContRef = Sink::new();
        vc.do_io_write(Some(cont), 0, Some(MioBuffer::new())).unwrap();
        assert!(!vc.write.enabled());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        // Two back-to-back read shutdowns leave the same state as one.
        let vc = NetVc::new();
        vc.do_io_shutdown(ShutdownHow::Read);
        let flags_once = vc.shutdown_flags();
        let enabled_once = vc.read.enabled();
        vc.do_io_shutdown(ShutdownHow::Read);
        assert_eq!(vc.shutdown_flags(), flags_once);
        assert_eq!(vc.read.enabled(), enabled_once);
        assert_eq!(flags_once, SHUTDOWN_READ);

        vc.do_io_shutdown(ShutdownHow::ReadWrite);
        assert_eq!(vc.shutdown_flags(), SHUTDOWN_READ | SHUTDOWN_WRITE);
    }

    #[test]
    fn test_timeout_arming() {
        let vc = NetVc::new();
        vc.set_inactivity_timeout(Duration::from_secs(2));
        assert_eq!(vc.inactivity_timeout(), Duration::from_secs(2));
        assert!(vc.next_inactivity_timeout_at.load(Ordering::Acquire) > 0);
        vc.set_inactivity_timeout(Duration::ZERO);
        assert_eq!(vc.next_inactivity_timeout_at.load(Ordering::Acquire), 0);

        vc.set_active_timeout(Duration::from_secs(5));
        assert!(vc.next_activity_timeout_at.load(Ordering::Acquire) > 0);
    }

    #[test]
    fn test_write_buffer_empty_trap() {
        let vc = NetVc::new();
        assert_eq!(vc.wbe_raw(), 0);
        vc.trap_write_buffer_empty(NetEvent::WriteComplete);
        assert_eq!(vc.wbe_raw(), NetEvent::WriteComplete as u8);
        vc.clear_wbe();
        assert_eq!(vc.wbe_raw(), 0);
    }

    #[test]
    fn test_get_data() {
        let vc = NetVc::new();
        match vc.get_data(ApiDataId::ReadVio) {
            Some(ApiData::Vio(p)) => assert!(!p.is_null()),
            _ => panic!("expected read vio handle"),
        }
        match vc.get_data(ApiDataId::Closed) {
            Some(ApiData::Closed(0)) => {}
            _ => panic!("expected open state"),
        }
        vc.do_io_close(-1);
        match vc.get_data(ApiDataId::Closed) {
            Some(ApiData::Closed(1)) => {}
            _ => panic!("expected closed state"),
        }
    }

    #[test]
    fn test_reset_restores_pristine_state() {
        let vc = NetVc::new();
        let cont: ContRef = Sink::new();
        vc.do_io_read(Some(cont), 100, Some(MioBuffer::new())).unwrap();
        vc.set_inactivity_timeout(Duration::from_secs(1));
        vc.trap_write_buffer_empty(NetEvent::WriteComplete);
        vc.do_io_close(-1);
        vc.reset();
        assert_eq!(vc.closed(), 0);
        assert_eq!(vc.vio_op(Dir::Read), VioOp::None);
        assert!(!vc.read.enabled());
        assert_eq!(vc.wbe_raw(), 0);
        assert_eq!(vc.inactivity_timeout(), Duration::ZERO);
    }
}
