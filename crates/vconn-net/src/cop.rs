//! The inactivity cop
//!
//! A periodic scan over the reactor's open list. Two jobs:
//!
//! - finalize connections whose `closed` flag was set by a party that
//!   could not close inline (off-reactor `do_io_close`, thread migration,
//!   a null-continuation terminal event)
//! - fire `INACTIVITY_TIMEOUT` / `ACTIVE_TIMEOUT` for connections whose
//!   absolute deadline has passed
//!
//! This is the deadline-polling flavor of timeout bookkeeping: connections
//! carry `next_*_timeout_at` timestamps and nothing is scheduled per VC.
//! I/O progress pushes the inactivity deadline out, so an armed deadline
//! observed in the past is authoritative modulo the re-check `main_event`
//! performs under the proper locks.

use crate::handler::{now_ns, NetHandler};
use crate::vc::{self, TimeoutKind};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vconn_core::kdebug;

/// One scan. Caller holds the reactor mutex.
pub(crate) fn scan(nh: &Arc<NetHandler>) {
    debug_assert!(nh.mutex.is_held_by_current());
    let now = now_ns();
    for ptr in nh.lists().open.collect() {
        // Safety: open-list members are kept alive by the list itself.
        let vc = unsafe { (*ptr).vc_ref() };

        if vc.closed() != 0 {
            if vc.recursion.load(Ordering::Acquire) == 0 {
                kdebug!("cop: finalizing deferred close of vc {:p}", ptr);
                vc::close_vc(&vc, Some(nh));
            }
            continue;
        }

        let inact_at = vc.next_inactivity_timeout_at.load(Ordering::Acquire);
        if inact_at != 0 && inact_at <= now {
            vc::main_event(&vc, nh, TimeoutKind::Inactivity);
            continue;
        }
        let act_at = vc.next_activity_timeout_at.load(Ordering::Acquire);
        if act_at != 0 && act_at <= now {
            vc::main_event(&vc, nh, TimeoutKind::Active);
        }
    }
}
