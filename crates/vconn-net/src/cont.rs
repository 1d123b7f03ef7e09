//! Continuations: where events go
//!
//! A continuation is the user-side half of a virtual connection: it names
//! the coordinating mutex that serializes its callbacks, and it receives
//! every lifecycle event. Callbacks run on the reactor thread with the
//! continuation's mutex held; the continuation is free to re-enter the
//! connection from inside a callback (`reenable`, `do_io_*`, even
//! `do_io_close` - the recursion latch defers the teardown).

use crate::vc::VcRef;
use std::sync::Arc;
use vconn_core::{CoMutex, Dir, NetEvent};

pub type ContRef = Arc<dyn Continuation>;

/// Payload delivered alongside an event.
pub enum EventData {
    /// A VIO event; names the connection and the direction it concerns.
    Vio(VcRef, Dir),
    /// A connection-level event (ACCEPT, OPEN).
    Vc(VcRef),
    /// OPEN_FAILED: a negative errno (or -ENET_THROTTLING).
    Errno(i32),
    /// No payload (OOB_COMPLETE, or EOS from the OOB path).
    None,
}

pub trait Continuation: Send + Sync {
    /// The mutex that must be held to deliver events to this continuation.
    fn mutex(&self) -> Arc<CoMutex>;

    /// Handle one event. Runs on the reactor thread with `mutex()` held.
    fn handle_event(&self, event: NetEvent, data: EventData);
}

/// Compare continuation identity (the same object, not the same type).
#[inline]
pub fn cont_eq(a: Option<&ContRef>, b: Option<&ContRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            Arc::as_ptr(a) as *const () as usize == Arc::as_ptr(b) as *const () as usize
        }
        (None, None) => true,
        _ => false,
    }
}
