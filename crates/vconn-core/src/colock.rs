//! Coordinating mutex for callback delivery
//!
//! `CoMutex` is the lock object shared by a connection, its VIOs and the
//! user continuation. The whole locking discipline of the I/O core is
//! built on three of its properties:
//!
//! - **try-lock first**: the reactor never blocks; a failed acquisition
//!   defers work instead.
//! - **thread-recursive**: a thread that already holds the mutex can take
//!   it again (the reactor holds its own mutex for a whole pass and still
//!   re-acquires it inside nested paths).
//! - **identity-comparable**: a continuation may swap the mutex out of a
//!   VIO mid-callback, so callers re-check `CoMutex::same` after every
//!   dispatch before touching VIO-scoped state.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// A small dense id for the calling thread. Never 0.
#[inline]
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// A thread-recursive try-lock mutex with holder tracking.
///
/// Carries no data; it coordinates access to state whose location it does
/// not know about (VIO fields, reactor lists). Shared by `Arc`, and two
/// `Arc<CoMutex>` are "the same lock" iff they point at the same allocation.
pub struct CoMutex {
    /// Thread id of the holder, 0 when free.
    holder: AtomicU64,
    /// Recursion depth; only the holder mutates it.
    depth: AtomicU32,
}

impl CoMutex {
    pub fn new() -> Arc<CoMutex> {
        Arc::new(CoMutex {
            holder: AtomicU64::new(0),
            depth: AtomicU32::new(0),
        })
    }

    /// Try to acquire. Succeeds immediately if this thread already holds
    /// the lock.
    pub fn try_lock(&self) -> Option<CoGuard<'_>> {
        let tid = current_thread_id();
        if self.holder.load(Ordering::Acquire) == tid {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Some(CoGuard { m: self });
        }
        if self
            .holder
            .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.store(1, Ordering::Relaxed);
            return Some(CoGuard { m: self });
        }
        None
    }

    /// Acquire, spinning until available. User-side helper; the reactor
    /// itself only ever uses `try_lock`.
    pub fn lock(&self) -> CoGuard<'_> {
        loop {
            if let Some(g) = self.try_lock() {
                return g;
            }
            std::thread::yield_now();
            core::hint::spin_loop();
        }
    }

    /// Does the calling thread hold this mutex?
    #[inline]
    pub fn is_held_by_current(&self) -> bool {
        self.holder.load(Ordering::Acquire) == current_thread_id()
    }

    /// Lock identity: two handles name the same lock.
    #[inline]
    pub fn same(a: &Arc<CoMutex>, b: &Arc<CoMutex>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

/// Guard that releases one level of the recursive lock when dropped.
pub struct CoGuard<'a> {
    m: &'a CoMutex,
}

impl<'a> Drop for CoGuard<'a> {
    fn drop(&mut self) {
        if self.m.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.m.holder.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_try_lock_exclusion() {
        let m = CoMutex::new();
        let g = m.try_lock();
        assert!(g.is_some());

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || m2.try_lock().is_some());
        assert!(!handle.join().unwrap());

        drop(g);
        let m3 = Arc::clone(&m);
        let handle = thread::spawn(move || m3.try_lock().is_some());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_recursive_acquire() {
        let m = CoMutex::new();
        let g1 = m.try_lock().unwrap();
        let g2 = m.try_lock().unwrap();
        assert!(m.is_held_by_current());
        drop(g2);
        // Still held after releasing the inner level.
        assert!(m.is_held_by_current());
        drop(g1);
        assert!(!m.is_held_by_current());
    }

    #[test]
    fn test_identity() {
        let a = CoMutex::new();
        let b = CoMutex::new();
        let a2 = Arc::clone(&a);
        assert!(CoMutex::same(&a, &a2));
        assert!(!CoMutex::same(&a, &b));
    }

    #[test]
    fn test_contended_handoff() {
        let m = CoMutex::new();
        let mut handles = vec![];
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..4 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _g = m.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }
}
