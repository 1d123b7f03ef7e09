//! The drain paths
//!
//! `net_read_io` and `write_to_net` are what the reactor calls for each
//! connection it pulls off a ready list. They move bytes between the
//! socket and the VIO's buffer with scatter/gather syscalls, deliver
//! progress events, and reconcile ready-list membership against the
//! `triggered && enabled` predicate.
//!
//! Edge-trigger discipline: a single readiness notification is drained
//! until the kernel refuses (`EAGAIN`), at which point `triggered` is
//! cleared and the next kernel edge re-asserts it. The scatter/gather loop
//! keeps issuing rounds while the previous round transferred everything it
//! attempted and the target amount is not reached; the final `r` folds the
//! rounds together so one value carries either the total transferred or
//! the terminal errno.

use crate::cont::EventData;
use crate::handler::NetHandler;
use crate::poll::{EVENTIO_READ, EVENTIO_WRITE};
use crate::sock::{sock_read, sock_write};
use crate::stats::{NetStats, NET_STATS};
use crate::tls::{HandshakeOutcome, TlsSide};
use crate::vc::{close_vc, NetVc, VcRef};
use crate::vio::VioOp;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vconn_core::{kdebug, Dir, NetEvent, SignalResult};

// ── Reschedule / disable ─────────────────────────────────────────────

/// Reconcile read-direction ready-list membership and re-arm the poller.
/// Caller holds the reactor mutex.
pub(crate) fn read_reschedule(nh: &Arc<NetHandler>, vc: &VcRef) {
    // Safety: reactor mutex held.
    unsafe { vc.ep_mut() }.refresh();
    let lists = nh.lists();
    if vc.read.triggered() && vc.read.enabled() {
        lists.read_ready.in_or_enqueue(Arc::as_ptr(vc));
    } else {
        lists.read_ready.remove(vc);
    }
}

pub(crate) fn write_reschedule(nh: &Arc<NetHandler>, vc: &VcRef) {
    // Safety: reactor mutex held.
    unsafe { vc.ep_mut() }.refresh();
    let lists = nh.lists();
    if vc.write.triggered() && vc.write.enabled() {
        lists.write_ready.in_or_enqueue(Arc::as_ptr(vc));
    } else {
        lists.write_ready.remove(vc);
    }
}

/// Stop reading: clear `enabled`, drop poller interest in the direction,
/// and (when the other direction is idle too) disarm the inactivity
/// deadline.
pub(crate) fn read_disable(nh: &Arc<NetHandler>, vc: &VcRef) {
    if !vc.write.enabled() {
        vc.next_inactivity_timeout_at.store(0, Ordering::Release);
    }
    vc.read.enabled.store(false, Ordering::Release);
    nh.lists().read_ready.remove(vc);
    // Safety: reactor mutex held.
    unsafe { vc.ep_mut() }.modify_remove(EVENTIO_READ);
}

pub(crate) fn write_disable(nh: &Arc<NetHandler>, vc: &VcRef) {
    if !vc.read.enabled() {
        vc.next_inactivity_timeout_at.store(0, Ordering::Release);
    }
    vc.write.enabled.store(false, Ordering::Release);
    nh.lists().write_ready.remove(vc);
    // Safety: reactor mutex held.
    unsafe { vc.ep_mut() }.modify_remove(EVENTIO_WRITE);
}

// ── Event delivery ───────────────────────────────────────────────────

/// Deliver one event through the read VIO under the recursion latch.
/// A terminal event with no continuation silently marks the connection
/// closed (a late timeout after the user tore the VIO down); a non-terminal
/// one is an invariant violation.
pub(crate) fn read_signal_and_update(event: NetEvent, vc: &VcRef) -> SignalResult {
    vc.recursion.fetch_add(1, Ordering::AcqRel);
    match vc.vio_cont(Dir::Read) {
        Some(cont) => cont.handle_event(event, EventData::Vio(vc.clone(), Dir::Read)),
        None => {
            if event.is_terminal() {
                kdebug!("event {}: no read continuation, closing vc {:p}", event, &**vc);
                vc.set_closed(1);
            } else {
                panic!("unexpected event {} for vc with no read continuation", event);
            }
        }
    }
    if vc.recursion.fetch_sub(1, Ordering::AcqRel) == 1 && vc.closed() != 0 {
        let nh = vc.nh_ref();
        close_vc(vc, nh.as_ref());
        SignalResult::Done
    } else {
        SignalResult::Continue
    }
}

pub(crate) fn write_signal_and_update(event: NetEvent, vc: &VcRef) -> SignalResult {
    vc.recursion.fetch_add(1, Ordering::AcqRel);
    match vc.vio_cont(Dir::Write) {
        Some(cont) => cont.handle_event(event, EventData::Vio(vc.clone(), Dir::Write)),
        None => {
            if event.is_terminal() {
                kdebug!("event {}: no write continuation, closing vc {:p}", event, &**vc);
                vc.set_closed(1);
            } else {
                panic!("unexpected event {} for vc with no write continuation", event);
            }
        }
    }
    if vc.recursion.fetch_sub(1, Ordering::AcqRel) == 1 && vc.closed() != 0 {
        let nh = vc.nh_ref();
        close_vc(vc, nh.as_ref());
        SignalResult::Done
    } else {
        SignalResult::Continue
    }
}

/// Terminal delivery: the direction is disabled first so the continuation
/// cannot implicitly resume a finished VIO.
pub(crate) fn read_signal_done(event: NetEvent, nh: &Arc<NetHandler>, vc: &VcRef) -> SignalResult {
    vc.read.enabled.store(false, Ordering::Release);
    if read_signal_and_update(event, vc) == SignalResult::Done {
        SignalResult::Done
    } else {
        read_reschedule(nh, vc);
        SignalResult::Continue
    }
}

pub(crate) fn write_signal_done(event: NetEvent, nh: &Arc<NetHandler>, vc: &VcRef) -> SignalResult {
    vc.write.enabled.store(false, Ordering::Release);
    if write_signal_and_update(event, vc) == SignalResult::Done {
        SignalResult::Done
    } else {
        write_reschedule(nh, vc);
        SignalResult::Continue
    }
}

pub(crate) fn read_signal_error(nh: &Arc<NetHandler>, vc: &VcRef, lerrno: i32) -> SignalResult {
    vc.set_lerrno(lerrno);
    read_signal_done(NetEvent::Error, nh, vc)
}

pub(crate) fn write_signal_error(nh: &Arc<NetHandler>, vc: &VcRef, lerrno: i32) -> SignalResult {
    vc.set_lerrno(lerrno);
    write_signal_done(NetEvent::Error, nh, vc)
}

// ── Read path ────────────────────────────────────────────────────────

/// Drain one read-readiness notification for `vc`.
///
/// Preconditions: called by the owning reactor with its mutex held, with
/// `vc` freshly pulled off the read ready list.
pub(crate) fn net_read_io(nh: &Arc<NetHandler>, vc: &VcRef) {
    let s = &vc.read;
    let m = s.vio_mutex();
    let lock = m.try_lock();
    if lock.is_none() {
        read_reschedule(nh, vc);
        return;
    }
    let _lock = lock.unwrap();

    // The closed flag may have been set by another holder of this VIO's
    // mutex; it is stable now that we hold it.
    if vc.closed() != 0 {
        close_vc(vc, Some(nh));
        return;
    }
    if !s.enabled() || vc.vio_op(Dir::Read) != VioOp::Read {
        read_disable(nh, vc);
        return;
    }

    // Safety: read VIO mutex held for this whole pass (identity re-checked
    // after any callback).
    let (ntodo, buf) = {
        let vio = unsafe { s.vio_mut() };
        (vio.ntodo(), vio.buffer.clone())
    };
    if ntodo <= 0 {
        read_disable(nh, vc);
        return;
    }
    let buf = buf.expect("read VIO armed without a buffer");
    let mut toread = buf.write_avail();
    if toread > ntodo {
        toread = ntodo;
    }

    let mut r: i64 = 0;
    if toread > 0 {
        let fd = vc.fd();
        let mut total_read: i64 = 0;
        let mut rattempted: i64;
        loop {
            let (rr, attempted) =
                buf.with_write_spans(total_read, toread - total_read, |spans| sock_read(fd, spans));
            r = rr;
            rattempted = attempted;
            NetStats::bump(&NET_STATS.calls_to_read);
            total_read += rattempted;
            if !(rattempted > 0 && r == rattempted && total_read < toread) {
                break;
            }
        }
        // Fold the rounds into one result: bytes moved before the first
        // short round, plus that round's count when positive; its errno
        // otherwise.
        if total_read != rattempted {
            if r <= 0 {
                r = total_read - rattempted;
            } else {
                r = total_read - rattempted + r;
            }
        }

        if r <= 0 {
            if r == -(libc::EAGAIN as i64) || r == -(libc::ENOTCONN as i64) {
                NetStats::bump(&NET_STATS.calls_to_read_nodata);
                s.triggered.store(false, Ordering::Release);
                nh.lists().read_ready.remove(vc);
                return;
            }
            if r == 0 || r == -(libc::ECONNRESET as i64) {
                s.triggered.store(false, Ordering::Release);
                nh.lists().read_ready.remove(vc);
                read_signal_done(NetEvent::Eos, nh, vc);
                return;
            }
            s.triggered.store(false, Ordering::Release);
            read_signal_error(nh, vc, (-r) as i32);
            return;
        }
        NetStats::add(&NET_STATS.read_bytes, r);
        buf.fill(r);
        // Safety: still under the VIO mutex, no callback yet this pass.
        unsafe { s.vio_mut() }.ndone += r;
        vc.net_activity();
    }

    if r > 0 {
        if unsafe { s.vio_mut() }.ntodo() <= 0 {
            read_signal_done(NetEvent::ReadComplete, nh, vc);
            return;
        }
        if read_signal_and_update(NetEvent::ReadReady, vc) != SignalResult::Continue {
            return;
        }
        // Lock changed hands inside the callback: the VIO is no longer
        // ours to inspect.
        if s.vio_mutex_changed(&m) {
            read_reschedule(nh, vc);
            return;
        }
    }

    // Safety: identity verified above (or no callback ran).
    let (ntodo_now, buf_now) = {
        let vio = unsafe { s.vio_mut() };
        (vio.ntodo(), vio.buffer.clone())
    };
    let room = buf_now.map_or(0, |b| b.write_avail());
    if ntodo_now <= 0 || !s.enabled() || room == 0 {
        read_disable(nh, vc);
        return;
    }
    read_reschedule(nh, vc);
}

// ── Write path ───────────────────────────────────────────────────────

pub(crate) fn write_to_net(nh: &Arc<NetHandler>, vc: &VcRef) {
    NetStats::bump(&NET_STATS.calls_to_write);
    write_to_net_io(nh, vc);
}

/// Drain one write-readiness notification: finish the TLS handshake if one
/// is pending, otherwise gather from the reader buffer and write.
pub(crate) fn write_to_net_io(nh: &Arc<NetHandler>, vc: &VcRef) {
    let s = &vc.write;
    let m = s.vio_mutex();
    let lock = m.try_lock();
    if lock.is_none() || s.vio_mutex_changed(&m) {
        write_reschedule(nh, vc);
        return;
    }
    let _lock = lock.unwrap();

    if !vc.handshake_complete() {
        let side = if vc.tls_is_client() {
            TlsSide::Client
        } else {
            TlsSide::Server
        };
        match vc.tls_start_handshake(side) {
            HandshakeOutcome::Error(err) => {
                s.triggered.store(false, Ordering::Release);
                write_signal_error(nh, vc, err);
            }
            HandshakeOutcome::WantRead | HandshakeOutcome::WantAccept => {
                vc.read.triggered.store(false, Ordering::Release);
                nh.lists().read_ready.remove(vc);
                read_reschedule(nh, vc);
            }
            HandshakeOutcome::WantConnect | HandshakeOutcome::WantWrite => {
                s.triggered.store(false, Ordering::Release);
                nh.lists().write_ready.remove(vc);
                write_reschedule(nh, vc);
            }
            HandshakeOutcome::Done => {
                s.triggered.store(true, Ordering::Release);
                if s.enabled() {
                    nh.lists().write_ready.in_or_enqueue(Arc::as_ptr(vc));
                }
            }
        }
        return;
    }

    if !s.enabled() || vc.vio_op(Dir::Write) != VioOp::Write {
        write_disable(nh, vc);
        return;
    }
    // Safety: write VIO mutex held.
    let (mut ntodo, buf) = {
        let vio = unsafe { s.vio_mut() };
        (vio.ntodo(), vio.buffer.clone())
    };
    if ntodo <= 0 {
        write_disable(nh, vc);
        return;
    }
    let buf = buf.expect("write VIO armed without a reader");

    let mut towrite = buf.read_avail();
    if towrite > ntodo {
        towrite = ntodo;
    }
    let mut signalled = false;

    // The buffered bytes fall short of the goal and there is room to add
    // more: give the user a chance to top the buffer up first.
    if towrite != ntodo && buf.write_avail() > 0 {
        if write_signal_and_update(NetEvent::WriteReady, vc) != SignalResult::Continue {
            return;
        }
        ntodo = unsafe { s.vio_mut() }.ntodo();
        if ntodo <= 0 {
            write_disable(nh, vc);
            return;
        }
        signalled = true;
        towrite = buf.read_avail();
        if towrite > ntodo {
            towrite = ntodo;
        }
    }
    if towrite <= 0 {
        write_disable(nh, vc);
        return;
    }

    let (mut r, total_written, wattempted, needs) = load_buffer_and_write(vc, towrite, &buf);
    if total_written != wattempted {
        if r <= 0 {
            r = total_written - wattempted;
        } else {
            r = total_written - wattempted + r;
        }
    }

    if r <= 0 {
        if r == -(libc::EAGAIN as i64) || r == -(libc::ENOTCONN as i64) {
            NetStats::bump(&NET_STATS.calls_to_write_nodata);
            if needs & EVENTIO_WRITE != 0 {
                s.triggered.store(false, Ordering::Release);
                nh.lists().write_ready.remove(vc);
                write_reschedule(nh, vc);
            }
            if needs & EVENTIO_READ != 0 {
                vc.read.triggered.store(false, Ordering::Release);
                nh.lists().read_ready.remove(vc);
                read_reschedule(nh, vc);
            }
            return;
        }
        if r == 0 || r == -(libc::ECONNRESET as i64) {
            s.triggered.store(false, Ordering::Release);
            write_signal_done(NetEvent::Eos, nh, vc);
            return;
        }
        s.triggered.store(false, Ordering::Release);
        write_signal_error(nh, vc, (-r) as i32);
        return;
    }

    // Save the armed trap value so a clearing below is detectable.
    let wbe_event = vc.wbe_raw();

    NetStats::add(&NET_STATS.write_bytes, r);
    debug_assert!(buf.read_avail() >= r);
    buf.consume(r);
    // Safety: write VIO mutex held; no callback since the last check.
    unsafe { s.vio_mut() }.ndone += r;

    // Trap fires on exact drain.
    if !buf.is_read_avail_more_than(0) {
        vc.clear_wbe();
    }
    vc.net_activity();

    if unsafe { s.vio_mut() }.ntodo() <= 0 {
        write_signal_done(NetEvent::WriteComplete, nh, vc);
        return;
    } else if signalled && wbe_event != vc.wbe_raw() {
        // We already delivered WRITE_READY this pass, and the trap cleared
        // in between: deliver the trapped event now.
        if let Some(ev) = NetEvent::from_u8(wbe_event) {
            if write_signal_and_update(ev, vc) != SignalResult::Continue {
                return;
            }
        }
    } else if !signalled {
        if write_signal_and_update(NetEvent::WriteReady, vc) != SignalResult::Continue {
            return;
        }
        if s.vio_mutex_changed(&m) {
            write_reschedule(nh, vc);
            return;
        }
    }

    if buf.read_avail() == 0 {
        write_disable(nh, vc);
        return;
    }
    if needs & EVENTIO_WRITE != 0 {
        write_reschedule(nh, vc);
    }
    if needs & EVENTIO_READ != 0 {
        read_reschedule(nh, vc);
    }
}

/// Gather from the reader's chain and write, looping while the kernel
/// accepts full rounds. Returns `(last_r, total_written, last_attempted,
/// needs)`; the caller folds these into the single summarized result and
/// consumes it from the buffer.
pub(crate) fn load_buffer_and_write(
    vc: &VcRef,
    towrite: i64,
    buf: &Arc<vconn_core::MioBuffer>,
) -> (i64, i64, i64, u32) {
    let fd = vc.fd();
    let mut total_written: i64 = 0;
    let mut wattempted: i64;
    let mut r: i64;
    loop {
        let (rr, attempted) = buf.with_read_spans(total_written, towrite - total_written, |spans| {
            sock_write(fd, spans)
        });
        r = rr;
        wattempted = attempted;
        total_written += wattempted;
        if !(wattempted > 0 && r == wattempted && total_written < towrite) {
            break;
        }
    }
    (r, total_written, wattempted, EVENTIO_WRITE)
}

impl NetVc {
    /// Public wrapper for the read drain path, used by TLS-style wrappers
    /// that must drive a read synchronously.
    pub fn net_read_io_now(&self, nh: &Arc<NetHandler>) {
        debug_assert!(nh.mutex.is_held_by_current());
        let vc = self.vc_ref();
        net_read_io(nh, &vc);
    }

    /// Public wrapper for the write drain path.
    pub fn write_to_net_now(&self, nh: &Arc<NetHandler>) {
        debug_assert!(nh.mutex.is_held_by_current());
        let vc = self.vc_ref();
        write_to_net(nh, &vc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vc::NetVc;

    #[test]
    fn test_terminal_event_without_continuation_closes_silently() {
        // A late timeout can land on a VIO whose user already walked away;
        // the connection closes instead of asserting.
        let vc = NetVc::new();
        assert_eq!(
            read_signal_and_update(NetEvent::Eos, &vc),
            SignalResult::Done
        );
        assert_eq!(vc.closed(), 1);
    }

    #[test]
    #[should_panic(expected = "no read continuation")]
    fn test_nonterminal_event_without_continuation_panics() {
        let vc = NetVc::new();
        let _ = read_signal_and_update(NetEvent::ReadReady, &vc);
    }

    #[test]
    fn test_write_terminal_event_without_continuation() {
        let vc = NetVc::new();
        assert_eq!(
            write_signal_and_update(NetEvent::InactivityTimeout, &vc),
            SignalResult::Done
        );
        assert_eq!(vc.closed(), 1);
    }
}
