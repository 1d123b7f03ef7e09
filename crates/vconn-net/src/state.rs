//! One direction's state
//!
//! `NetState` bundles what a single direction of a connection needs: the
//! active VIO, the slot holding its coordinating mutex, the `enabled` and
//! `triggered` flags whose conjunction is the ready-list membership
//! predicate, the enable-queue presence bit, and the ready-list link.
//!
//! Locking map:
//! - `vio` cell: the coordinating mutex currently in `vio_mutex` (or sole
//!   ownership during setup/teardown).
//! - `vio_mutex` slot: its own spinlock; read to discover which mutex to
//!   take, re-read after callbacks to detect replacement.
//! - flags: plain atomics, readable anywhere.
//! - `ready_link`: the owning reactor's mutex.

use crate::link::VcLink;
use crate::vio::Vio;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vconn_core::{CoMutex, SpinLock};

pub struct NetState {
    pub(crate) vio: UnsafeCell<Vio>,
    pub(crate) vio_mutex: SpinLock<Arc<CoMutex>>,
    pub(crate) enabled: AtomicBool,
    pub(crate) triggered: AtomicBool,
    pub(crate) in_enabled_list: AtomicBool,
    pub(crate) ready_link: VcLink,
}

impl NetState {
    pub fn new(default_mutex: Arc<CoMutex>) -> NetState {
        NetState {
            vio: UnsafeCell::new(Vio::idle()),
            vio_mutex: SpinLock::new(default_mutex),
            enabled: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
            in_enabled_list: AtomicBool::new(false),
            ready_link: VcLink::new(),
        }
    }

    /// The coordinating mutex currently installed for this direction.
    #[inline]
    pub fn vio_mutex(&self) -> Arc<CoMutex> {
        self.vio_mutex.lock().clone()
    }

    /// Has the installed mutex changed identity since `held` was taken?
    #[inline]
    pub fn vio_mutex_changed(&self, held: &Arc<CoMutex>) -> bool {
        !CoMutex::same(&self.vio_mutex.lock(), held)
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// The VIO cell. Callers must hold the direction's coordinating mutex
    /// or otherwise have exclusive access (setup, slab reset).
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn vio_mut(&self) -> &mut Vio {
        &mut *self.vio.get()
    }
}
