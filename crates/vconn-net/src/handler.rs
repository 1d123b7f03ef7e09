//! The per-thread reactor
//!
//! One `NetHandler` owns one reactor thread's worth of connections: the
//! open list, the two ready lists, the two enable queues, a timer heap and
//! the poller. The thread loop runs the same pass forever:
//!
//! 1. install externally submitted connections (accept/connect handoff)
//! 2. drain the enable queues (off-thread reenables) under the mutex
//! 3. poll for readiness, mark `triggered`, enqueue onto ready lists
//! 4. drain the ready lists through the read/write paths
//! 5. fire due timers and run the inactivity cop
//! 6. recycle closed connections parked in the graveyard
//!
//! The reactor holds its own mutex for the whole pass (including the
//! bounded poll wait); off-thread reenables therefore land on the lock-free
//! enable queues and wake the poller through its eventfd. Connections
//! closed during a pass keep their allocation alive in the graveyard until
//! the pass ends, so raw pointers snapshotted earlier in the pass stay
//! valid.

use crate::config::ReactorConfig;
use crate::cont::ContRef;
use crate::cop;
use crate::io;
use crate::link::{VcList, VcLink};
use crate::poll::{PollEvent, Poller, EVENTIO_READ, EVENTIO_WRITE};
use crate::vc::{self, NetVc, TimeoutKind, VcRef};
use crossbeam_queue::SegQueue;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use vconn_core::{current_thread_id, kinfo, CoMutex, Dir, NetError, NetResult, SpinLock};

// ── Time ─────────────────────────────────────────────────────────────

static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since process start.
#[inline]
pub fn now_ns() -> i64 {
    START_INSTANT.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

// ── Timers ───────────────────────────────────────────────────────────

/// Work a timer can carry.
pub(crate) enum TimerAction {
    /// Timeout delivery retry (lock miss in `main_event`).
    MainEvent { vc: VcRef, kind: TimeoutKind },
    /// Re-issue a partial OOB send.
    OobRetry { vc: VcRef },
    /// Retry installing an accepted connection.
    Accept { vc: VcRef },
    /// Retry an outbound connect setup.
    Connect {
        vc: VcRef,
        target: Option<SocketAddr>,
        fd: Option<RawFd>,
    },
}

struct TimerEntry {
    fire_at: i64,
    seq: u64,
    cancel: Arc<AtomicBool>,
    action: TimerAction,
}

// Min-heap by fire time, FIFO within a tick.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerWheel {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

// ── External submission ──────────────────────────────────────────────

enum ExternalTask {
    Accept { fd: RawFd, action: ContRef },
    Connect {
        target: Option<SocketAddr>,
        fd: Option<RawFd>,
        action: ContRef,
    },
}

// ── Lists ────────────────────────────────────────────────────────────

pub(crate) struct NhLists {
    pub(crate) open: VcList,
    pub(crate) read_ready: VcList,
    pub(crate) write_ready: VcList,
    /// Strong references to connections closed during the current pass;
    /// drained (and recycled) at pass end.
    pub(crate) graveyard: SpinLock<Vec<VcRef>>,
}

fn open_link(vc: &NetVc) -> &VcLink {
    &vc.open_link
}

fn read_ready_link(vc: &NetVc) -> &VcLink {
    &vc.read.ready_link
}

fn write_ready_link(vc: &NetVc) -> &VcLink {
    &vc.write.ready_link
}

impl NhLists {
    fn new() -> NhLists {
        NhLists {
            open: VcList::new(open_link),
            read_ready: VcList::new(read_ready_link),
            write_ready: VcList::new(write_ready_link),
            graveyard: SpinLock::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn ready(&self, dir: Dir) -> &VcList {
        match dir {
            Dir::Read => &self.read_ready,
            Dir::Write => &self.write_ready,
        }
    }
}

// ── The handler ──────────────────────────────────────────────────────

pub struct NetHandler {
    /// The reactor mutex: guards the lists and per-connection reactor
    /// bookkeeping. Held by the reactor thread for each whole pass.
    pub(crate) mutex: Arc<CoMutex>,
    pub(crate) poller: Poller,
    lists: NhLists,
    read_enable: SegQueue<VcRef>,
    write_enable: SegQueue<VcRef>,
    external: SegQueue<ExternalTask>,
    timers: SpinLock<TimerWheel>,
    slab: SpinLock<Vec<VcRef>>,
    pub(crate) config: ReactorConfig,
    thread_id: AtomicU64,
    next_cop_at: AtomicI64,
}

// Safety: lists are guarded by `mutex`, queues and the timer wheel are
// internally synchronized, the poller is used per its own contract.
unsafe impl Send for NetHandler {}
unsafe impl Sync for NetHandler {}

impl NetHandler {
    pub fn new(config: ReactorConfig) -> NetResult<NetHandler> {
        config.validate().expect("invalid reactor configuration");
        Ok(NetHandler {
            mutex: CoMutex::new(),
            poller: Poller::new()?,
            lists: NhLists::new(),
            read_enable: SegQueue::new(),
            write_enable: SegQueue::new(),
            external: SegQueue::new(),
            timers: SpinLock::new(TimerWheel {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            slab: SpinLock::new(Vec::new()),
            config,
            thread_id: AtomicU64::new(0),
            next_cop_at: AtomicI64::new(0),
        })
    }

    #[inline]
    pub(crate) fn lists(&self) -> &NhLists {
        &self.lists
    }

    #[inline]
    pub(crate) fn enable_queue(&self, dir: Dir) -> &SegQueue<VcRef> {
        match dir {
            Dir::Read => &self.read_enable,
            Dir::Write => &self.write_enable,
        }
    }

    /// Interrupt the poll wait.
    #[inline]
    pub fn wake(&self) {
        self.poller.wake();
    }

    /// Is the calling thread this handler's reactor thread?
    #[inline]
    pub fn on_reactor_thread(&self) -> bool {
        self.thread_id.load(Ordering::Acquire) == current_thread_id()
    }

    /// Hand an accepted descriptor to this reactor. The connection is
    /// installed on the next pass and `action` hears `ACCEPT`.
    pub fn accept_fd(&self, fd: RawFd, action: ContRef) {
        self.external.push(ExternalTask::Accept { fd, action });
        self.wake();
    }

    /// Open an outbound connection to `target` on this reactor; `action`
    /// hears `OPEN` or `OPEN_FAILED`.
    pub fn connect_to(&self, target: SocketAddr, action: ContRef) {
        self.external.push(ExternalTask::Connect {
            target: Some(target),
            fd: None,
            action,
        });
        self.wake();
    }

    /// Adopt a descriptor the caller already connected.
    pub fn connect_fd(&self, fd: RawFd, action: ContRef) {
        self.external.push(ExternalTask::Connect {
            target: None,
            fd: Some(fd),
            action,
        });
        self.wake();
    }

    /// Schedule `action` after `delay_ms`. Returns a cancellation flag.
    pub(crate) fn schedule_in(&self, delay_ms: u64, action: TimerAction) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut wheel = self.timers.lock();
            wheel.seq += 1;
            let seq = wheel.seq;
            wheel.heap.push(TimerEntry {
                fire_at: now_ns() + (delay_ms as i64) * 1_000_000,
                seq,
                cancel: cancel.clone(),
                action,
            });
        }
        if !self.on_reactor_thread() {
            self.wake();
        }
        cancel
    }

    fn next_timer_at(&self) -> Option<i64> {
        self.timers.lock().heap.peek().map(|e| e.fire_at)
    }

    fn pop_due_timers(&self, now: i64) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        let mut wheel = self.timers.lock();
        while let Some(top) = wheel.heap.peek() {
            if top.fire_at > now {
                break;
            }
            due.push(wheel.heap.pop().unwrap());
        }
        due
    }

    // ── Slab ─────────────────────────────────────────────────────────

    /// A fresh (or recycled) connection.
    pub(crate) fn slab_alloc(&self) -> VcRef {
        if let Some(vc) = self.slab.lock().pop() {
            return vc;
        }
        NetVc::new()
    }

    /// Recycle a closed connection. Only resets (and keeps) it when the
    /// reactor holds the last strong reference; otherwise the allocation
    /// dies when the user drops theirs.
    fn slab_free(&self, vc: VcRef) {
        if Arc::strong_count(&vc) == 1 {
            vc.reset();
            let mut slab = self.slab.lock();
            if slab.len() < self.config.slab_capacity {
                slab.push(vc);
            }
        }
    }

    // ── The pass ─────────────────────────────────────────────────────

    fn drain_external(self: &Arc<Self>) {
        while let Some(task) = self.external.pop() {
            match task {
                ExternalTask::Accept { fd, action } => {
                    let nvc = self.slab_alloc();
                    // Safety: fresh VC, single owner.
                    if unsafe { nvc.con_mut() }.adopt(fd).is_err() {
                        unsafe { libc::close(fd) };
                        continue;
                    }
                    nvc.set_action(action);
                    vc::accept_event(&nvc, self);
                }
                ExternalTask::Connect { target, fd, action } => {
                    let nvc = self.slab_alloc();
                    nvc.set_action(action);
                    vc::connect_up(&nvc, self, target, fd);
                }
            }
        }
    }

    /// Reconcile connections whose `enabled` flag was set off-reactor.
    fn drain_enable_queues(self: &Arc<Self>) {
        for dir in [Dir::Read, Dir::Write] {
            let (queue, flag) = match dir {
                Dir::Read => (&self.read_enable, EVENTIO_READ),
                Dir::Write => (&self.write_enable, EVENTIO_WRITE),
            };
            while let Some(vc) = queue.pop() {
                if !vc.state(dir).in_enabled_list.swap(false, Ordering::AcqRel) {
                    continue;
                }
                if vc.closed() != 0 {
                    continue;
                }
                // Safety: reactor mutex held.
                let ep = unsafe { vc.ep_mut() };
                ep.modify_add(flag);
                ep.refresh();
                let ready = self.lists.ready(dir);
                let s = vc.state(dir);
                if s.triggered() && s.enabled() {
                    ready.in_or_enqueue(Arc::as_ptr(&vc));
                } else {
                    ready.remove(&vc);
                }
            }
        }
    }

    /// The poll wait runs without the reactor mutex so off-thread callers
    /// (reenable fast path, migration) can take it while the kernel sleeps.
    fn poll(&self, events: &mut Vec<PollEvent>) {
        let now = now_ns();
        let mut timeout = self.config.poll_timeout_ms;
        if let Some(at) = self.next_timer_at() {
            let ms = ((at - now).max(0) / 1_000_000) as i32;
            timeout = timeout.min(ms.max(0));
        }
        self.poller
            .wait(events, self.config.max_poll_events, timeout);
    }

    /// Fold fetched readiness into `triggered` flags and ready lists.
    /// Caller holds the reactor mutex.
    fn mark_events(&self, events: &[PollEvent]) {
        for ev in events.iter() {
            // Safety: the tag is the address of a connection the open list
            // (or this pass's graveyard) keeps alive; frees only happen on
            // this thread, after ep.stop has purged pending events.
            let vcp = ev.tag as *const NetVc;
            let vc = unsafe { &*vcp };
            if ev.flags & EVENTIO_READ != 0 {
                vc.read.triggered.store(true, Ordering::Release);
                self.lists.read_ready.in_or_enqueue(vcp);
            }
            if ev.flags & EVENTIO_WRITE != 0 {
                vc.write.triggered.store(true, Ordering::Release);
                self.lists.write_ready.in_or_enqueue(vcp);
            }
        }
    }

    /// Drain one ready list. Each member is processed once per pass;
    /// reschedules land on the (now empty) list for the next pass.
    fn drain_ready(self: &Arc<Self>, dir: Dir) {
        let ready = self.lists.ready(dir);
        let mut batch = Vec::with_capacity(ready.len());
        loop {
            let ptr = ready.pop_head();
            if ptr.is_null() {
                break;
            }
            batch.push(ptr);
        }
        for ptr in batch {
            // Safety: kept alive by the open list or the graveyard.
            let vc = unsafe { (*ptr).vc_ref() };
            match dir {
                Dir::Read => io::net_read_io(self, &vc),
                Dir::Write => io::write_to_net(self, &vc),
            }
        }
    }

    fn run_timers(self: &Arc<Self>) {
        for entry in self.pop_due_timers(now_ns()) {
            if entry.cancel.load(Ordering::Acquire) {
                continue;
            }
            match entry.action {
                TimerAction::MainEvent { vc, kind } => {
                    vc::main_event(&vc, self, kind);
                }
                TimerAction::OobRetry { vc } => {
                    vc.retry_oob(self);
                }
                TimerAction::Accept { vc } => {
                    vc::accept_event(&vc, self);
                }
                TimerAction::Connect { vc, target, fd } => {
                    vc::connect_up(&vc, self, target, fd);
                }
            }
        }
    }

    fn run_pass(self: &Arc<Self>, events: &mut Vec<PollEvent>) {
        {
            let _guard = self.mutex.lock();
            self.drain_external();
            self.drain_enable_queues();
        }

        self.poll(events);

        let _guard = self.mutex.lock();
        self.mark_events(events);
        self.drain_ready(Dir::Read);
        self.drain_ready(Dir::Write);
        self.run_timers();

        let now = now_ns();
        if now >= self.next_cop_at.load(Ordering::Acquire) {
            cop::scan(self);
            self.next_cop_at.store(
                now + (self.config.cop_interval_ms as i64) * 1_000_000,
                Ordering::Release,
            );
        }

        let dead = std::mem::take(&mut *self.lists.graveyard.lock());
        for vc in dead {
            self.slab_free(vc);
        }
    }

    /// Close everything still open. Runs at reactor shutdown.
    fn drain_open(self: &Arc<Self>) {
        let _guard = self.mutex.lock();
        for ptr in self.lists.open.collect() {
            // Safety: open-list members are alive.
            let vc = unsafe { (*ptr).vc_ref() };
            vc::close_vc(&vc, Some(self));
        }
        self.lists.graveyard.lock().clear();
    }
}

// ── The reactor thread ───────────────────────────────────────────────

/// Owns one reactor thread running a [`NetHandler`].
pub struct NetThread {
    nh: Arc<NetHandler>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NetThread {
    pub fn start(config: ReactorConfig) -> NetResult<NetThread> {
        let nh = Arc::new(NetHandler::new(config)?);
        let shutdown = Arc::new(AtomicBool::new(false));
        let nh2 = nh.clone();
        let shutdown2 = shutdown.clone();
        let handle = thread::Builder::new()
            .name("vconn-net".into())
            .spawn(move || {
                nh2.thread_id
                    .store(current_thread_id(), Ordering::Release);
                kinfo!("reactor started");
                let mut events = Vec::with_capacity(nh2.config.max_poll_events);
                while !shutdown2.load(Ordering::Acquire) {
                    nh2.run_pass(&mut events);
                }
                nh2.drain_open();
                kinfo!("reactor stopped");
            })
            .map_err(|_| NetError::NotRunning)?;
        Ok(NetThread {
            nh,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn handler(&self) -> Arc<NetHandler> {
        self.nh.clone()
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.nh.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NetThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cont::{ContRef, Continuation, EventData};
    use crate::sock::{accept_on, bind_listener, listener_addr, Connection};
    use crate::vc::NetVc;
    use std::net::SocketAddr;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;
    use vconn_core::{MioBuffer, NetEvent};

    enum Msg {
        Ev(NetEvent, i64),
        Conn(NetEvent, VcRef),
        Failed(i32),
    }

    struct Recorder {
        mutex: Arc<CoMutex>,
        tx: Mutex<Sender<Msg>>,
    }

    impl Recorder {
        fn new() -> (Arc<Recorder>, Receiver<Msg>) {
            let (tx, rx) = channel();
            (
                Arc::new(Recorder {
                    mutex: CoMutex::new(),
                    tx: Mutex::new(tx),
                }),
                rx,
            )
        }
    }

    impl Continuation for Recorder {
        fn mutex(&self) -> Arc<CoMutex> {
            self.mutex.clone()
        }
        fn handle_event(&self, event: NetEvent, data: EventData) {
            let msg = match data {
                EventData::Vio(vc, dir) => {
                    let (ndone, _) = vc.vio_progress(dir);
                    Msg::Ev(event, ndone)
                }
                EventData::Vc(vc) => Msg::Conn(event, vc),
                EventData::Errno(e) => Msg::Failed(e),
                EventData::None => Msg::Ev(event, 0),
            };
            let _ = self.tx.lock().unwrap().send(msg);
        }
    }

    fn test_config() -> ReactorConfig {
        ReactorConfig {
            poll_timeout_ms: 5,
            cop_interval_ms: 50,
            ..Default::default()
        }
    }

    fn recv_ev(rx: &Receiver<Msg>) -> (NetEvent, i64) {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Msg::Ev(e, n)) => (e, n),
            Ok(_) => panic!("expected a VIO event"),
            Err(e) => panic!("no event within deadline: {:?}", e),
        }
    }

    /// Accept one loopback connection through the reactor.
    fn accept_one(
        nh: &Arc<NetHandler>,
        rec: &Arc<Recorder>,
        rx: &Receiver<Msg>,
    ) -> (VcRef, Connection) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let lfd = bind_listener(&addr).unwrap();
        let bound = listener_addr(lfd).unwrap();
        let mut client = Connection::closed();
        client.open(&bound).unwrap();
        client.connect(&bound).unwrap();
        let afd = loop {
            let fd = accept_on(lfd);
            if fd > 0 {
                break fd as i32;
            }
            assert_eq!(fd, -(libc::EAGAIN as i64));
            std::thread::sleep(Duration::from_millis(5));
        };
        unsafe { libc::close(lfd) };
        nh.accept_fd(afd, rec.clone());
        let vc = match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Msg::Conn(NetEvent::Accept, vc)) => vc,
            _ => panic!("expected ACCEPT"),
        };
        (vc, client)
    }

    fn client_write(client: &Connection, data: &[u8]) {
        let mut off = 0;
        while off < data.len() {
            let r = unsafe {
                libc::write(
                    client.fd,
                    data[off..].as_ptr() as *const libc::c_void,
                    data.len() - off,
                )
            };
            if r > 0 {
                off += r as usize;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_happy_read() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();
        let (vc, client) = accept_one(&nh, &rec, &rx);

        client_write(&client, b"HELLO");
        let buf = MioBuffer::new();
        vc.do_io_read(Some(rec.clone() as ContRef), 5, Some(buf.clone()))
            .unwrap();

        // Five buffered bytes against a five-byte goal complete in one
        // drain; no READ_READY required.
        let (ev, ndone) = recv_ev(&rx);
        assert_eq!(ev, NetEvent::ReadComplete);
        assert_eq!(ndone, 5);
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out[..5], b"HELLO");

        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_partial_read_then_refill() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();
        let (vc, client) = accept_one(&nh, &rec, &rx);

        let buf = MioBuffer::new();
        vc.do_io_read(Some(rec.clone() as ContRef), 10, Some(buf.clone()))
            .unwrap();

        client_write(&client, b"abc");
        std::thread::sleep(Duration::from_millis(50));
        client_write(&client, b"defghij");

        let mut saw_ready = false;
        let mut last_ndone = 0;
        loop {
            let (ev, ndone) = recv_ev(&rx);
            assert!(ndone >= last_ndone, "progress must be monotonic");
            last_ndone = ndone;
            match ev {
                NetEvent::ReadReady => saw_ready = true,
                NetEvent::ReadComplete => {
                    assert_eq!(ndone, 10);
                    break;
                }
                other => panic!("unexpected event {}", other),
            }
        }
        assert!(saw_ready, "a partial arrival must surface READ_READY");

        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_peer_reset_mid_write_surfaces_eos() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let lfd = bind_listener(&addr).unwrap();
        let bound = listener_addr(lfd).unwrap();
        let mut client = Connection::closed();
        client.open(&bound).unwrap();
        // Small client receive window keeps most of the payload queued on
        // the server.
        unsafe {
            let sz: i32 = 4096;
            libc::setsockopt(
                client.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &sz as *const _ as *const libc::c_void,
                4,
            );
        }
        client.connect(&bound).unwrap();
        let afd = loop {
            let fd = accept_on(lfd);
            if fd > 0 {
                break fd as i32;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        unsafe {
            libc::close(lfd);
            let sz: i32 = 4096;
            libc::setsockopt(
                afd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &sz as *const _ as *const libc::c_void,
                4,
            );
        }
        nh.accept_fd(afd, rec.clone());
        let vc = match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Msg::Conn(NetEvent::Accept, vc)) => vc,
            _ => panic!("expected ACCEPT"),
        };

        let payload = vec![0x42u8; 4 * 1024 * 1024];
        let buf = MioBuffer::with_sizes(64 * 1024, 8 * 1024 * 1024);
        assert_eq!(buf.write(&payload), payload.len() as i64);
        vc.do_io_write(
            Some(rec.clone() as ContRef),
            payload.len() as i64,
            Some(buf),
        )
        .unwrap();

        // Let the writer fill the in-flight windows and stall.
        std::thread::sleep(Duration::from_millis(200));

        // Reset from the peer: linger(0) close sends RST.
        unsafe {
            let lg = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            libc::setsockopt(
                client.fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &lg as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as u32,
            );
        }
        client.close();

        let mut eos = 0;
        let mut errors = 0;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Msg::Ev(NetEvent::Eos, _)) => eos += 1,
                Ok(Msg::Ev(NetEvent::Error, _)) => errors += 1,
                Ok(Msg::Ev(NetEvent::WriteComplete, _)) => {
                    panic!("write must not complete after a reset")
                }
                Ok(_) => {}
                Err(_) => {
                    if eos > 0 {
                        break;
                    }
                }
            }
        }
        assert_eq!(eos, 1, "peer reset must surface exactly one EOS");
        assert_eq!(errors, 0, "a reset is EOS, not ERROR");

        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_inactivity_timeout_fires_and_activity_postpones() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();
        let (vc, client) = accept_one(&nh, &rec, &rx);

        vc.set_inactivity_timeout(Duration::from_millis(200));
        let buf = MioBuffer::new();
        vc.do_io_read(Some(rec.clone() as ContRef), 100, Some(buf))
            .unwrap();

        // A byte halfway through the window must postpone the deadline.
        std::thread::sleep(Duration::from_millis(100));
        client_write(&client, b"x");
        let (ev, ndone) = recv_ev(&rx);
        assert_eq!(ev, NetEvent::ReadReady, "the byte must arrive before any timeout");
        assert_eq!(ndone, 1);
        let byte_at = std::time::Instant::now();

        let (ev, _) = recv_ev(&rx);
        assert_eq!(ev, NetEvent::InactivityTimeout);
        let since_byte = byte_at.elapsed();
        assert!(
            since_byte >= Duration::from_millis(140),
            "timeout fired only {:?} after activity",
            since_byte
        );

        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_write_buffer_empty_trap() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();
        let (vc, _client) = accept_one(&nh, &rec, &rx);

        let buf = MioBuffer::new();
        buf.write(b"DRAIN");
        vc.trap_write_buffer_empty(NetEvent::OobComplete);
        vc.do_io_write(Some(rec.clone() as ContRef), 1000, Some(buf))
            .unwrap();

        // The short buffer forces the refill signal first; the exact drain
        // then fires the trap, once.
        let (ev, _) = recv_ev(&rx);
        assert_eq!(ev, NetEvent::WriteReady);
        let (ev, ndone) = recv_ev(&rx);
        assert_eq!(ev, NetEvent::OobComplete);
        assert_eq!(ndone, 5);
        assert_eq!(vc.wbe_raw(), 0, "the trap must be cleared");

        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "the trap fires exactly once"
        );

        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_write_complete() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();
        let (vc, client) = accept_one(&nh, &rec, &rx);

        let buf = MioBuffer::new();
        buf.write(b"PONG");
        vc.do_io_write(Some(rec.clone() as ContRef), 4, Some(buf))
            .unwrap();
        let (ev, ndone) = recv_ev(&rx);
        assert_eq!(ev, NetEvent::WriteComplete);
        assert_eq!(ndone, 4);

        let mut out = [0u8; 8];
        let mut got = 0;
        while got < 4 {
            let r = unsafe {
                libc::read(
                    client.fd,
                    out[got..].as_mut_ptr() as *mut libc::c_void,
                    out.len() - got,
                )
            };
            if r > 0 {
                got += r as usize;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(&out[..4], b"PONG");

        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_offthread_reenable_queues_once() {
        // No reactor thread: another thread pins the handler mutex so the
        // reenable must take the enable-queue path.
        let nh = Arc::new(NetHandler::new(test_config()).unwrap());
        let vc = NetVc::new();
        vc.set_nh(nh.clone());

        let nh2 = nh.clone();
        let (ready_tx, ready_rx) = channel();
        let (done_tx, done_rx) = channel::<()>();
        let holder = std::thread::spawn(move || {
            let _g = nh2.mutex.lock();
            ready_tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });
        ready_rx.recv().unwrap();

        let m = vc.read.vio_mutex();
        let _g = m.lock();
        vc.reenable(Dir::Read);
        assert!(vc.read.in_enabled_list.load(Ordering::Acquire));
        assert_eq!(nh.enable_queue(Dir::Read).len(), 1);

        // Re-issuing while enabled is a no-op.
        vc.reenable(Dir::Read);
        assert_eq!(nh.enable_queue(Dir::Read).len(), 1);

        // Even a fresh transition queues at most once while undrained.
        vc.read.enabled.store(false, Ordering::Release);
        vc.reenable(Dir::Read);
        assert_eq!(nh.enable_queue(Dir::Read).len(), 1);

        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_connect_to_delivers_open() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let lfd = bind_listener(&addr).unwrap();
        let bound = listener_addr(lfd).unwrap();

        nh.connect_to(bound, rec.clone());
        let vc = match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Msg::Conn(NetEvent::Open, vc)) => vc,
            Ok(Msg::Failed(e)) => panic!("unexpected OPEN_FAILED({})", e),
            _ => panic!("expected OPEN"),
        };
        let afd = loop {
            let fd = accept_on(lfd);
            if fd > 0 {
                break fd;
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        unsafe {
            libc::close(afd as i32);
            libc::close(lfd);
        }
        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_connect_throttled() {
        let cfg = ReactorConfig {
            max_connections: 1,
            ..test_config()
        };
        let mut nt = NetThread::start(cfg).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();
        // One open connection puts us at the cap.
        let (vc, _client) = accept_one(&nh, &rec, &rx);

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let lfd = bind_listener(&addr).unwrap();
        let bound = listener_addr(lfd).unwrap();
        nh.connect_to(bound, rec.clone());
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Msg::Failed(e)) => {
                assert_eq!(e, -vconn_core::ENET_THROTTLING);
            }
            _ => panic!("expected OPEN_FAILED with the throttling code"),
        }

        unsafe { libc::close(lfd) };
        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_send_oob_complete() {
        let mut nt = NetThread::start(test_config()).unwrap();
        let nh = nt.handler();
        let (rec, rx) = Recorder::new();
        let (vc, _client) = accept_one(&nh, &rec, &rx);

        let m = rec.mutex();
        let g = m.lock();
        let result = vc.send_oob(rec.clone() as ContRef, b"!");
        drop(g);
        assert_eq!(result, crate::vc::OobResult::Done);
        let (ev, _) = recv_ev(&rx);
        assert_eq!(ev, NetEvent::OobComplete);

        vc.do_io_close(-1);
        nt.shutdown();
    }

    #[test]
    fn test_migration_moves_connection() {
        let mut nt_a = NetThread::start(test_config()).unwrap();
        let mut nt_b = NetThread::start(test_config()).unwrap();
        let nh_a = nt_a.handler();
        let nh_b = nt_b.handler();

        let (rec, rx) = Recorder::new();
        let (vc, client) = accept_one(&nh_a, &rec, &rx);

        let (rec2, rx2) = Recorder::new();
        let nvc = {
            let _g = nh_b.mutex.lock();
            vc.migrate_to_current_thread(&(rec2.clone() as ContRef), &nh_b)
                .unwrap()
        };
        assert!(!Arc::ptr_eq(&vc, &nvc));
        assert_eq!(vc.closed(), 1, "the source VC closes");
        assert_ne!(nvc.fd(), crate::sock::NO_FD, "the descriptor survives");

        // The source reactor must relinquish the old VC.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let gone = {
                let _g = nh_a.mutex.lock();
                !nh_a.lists().open.contains(&vc)
            };
            if gone {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "source reactor never finalized the migrated VC"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        // Data keeps flowing, now on reactor B.
        client_write(&client, b"PING");
        let buf = MioBuffer::new();
        nvc.do_io_read(Some(rec2.clone() as ContRef), 4, Some(buf.clone()))
            .unwrap();
        let (ev, ndone) = match rx2.recv_timeout(Duration::from_secs(5)) {
            Ok(Msg::Ev(e, n)) => (e, n),
            _ => panic!("expected a read event on the target reactor"),
        };
        assert_eq!(ev, NetEvent::ReadComplete);
        assert_eq!(ndone, 4);
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out[..4], b"PING");

        nvc.do_io_close(-1);
        nt_a.shutdown();
        nt_b.shutdown();
    }
}
