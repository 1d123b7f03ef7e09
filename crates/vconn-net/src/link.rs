//! Intrusive connection lists
//!
//! The reactor's open list and the two ready lists are intrusive doubly
//! linked lists threaded through the connections themselves, with an
//! `in_list` bit per link so `remove` is O(1) and idempotent. That matters
//! because reschedule reconciles list membership on every reactor pass.
//!
//! All list manipulation happens while holding the owning reactor's mutex;
//! the `Cell`s never see concurrent access. Elements are raw pointers; the
//! open list is the one that keeps its members alive (it holds one strong
//! reference per member, taken with `Arc::into_raw`), and closed
//! connections park in the pass-local graveyard until no raw pointer from
//! the current pass can still name them.

use crate::vc::NetVc;
use std::cell::Cell;
use std::ptr;
use std::sync::Arc;

/// The per-connection hook one list threads through.
pub struct VcLink {
    prev: Cell<*const NetVc>,
    next: Cell<*const NetVc>,
    in_list: Cell<bool>,
}

// Safety: links are only touched under the owning reactor's mutex.
unsafe impl Send for VcLink {}
unsafe impl Sync for VcLink {}

impl VcLink {
    pub fn new() -> VcLink {
        VcLink {
            prev: Cell::new(ptr::null()),
            next: Cell::new(ptr::null()),
            in_list: Cell::new(false),
        }
    }

    #[inline]
    pub fn in_list(&self) -> bool {
        self.in_list.get()
    }
}

/// A doubly linked list over connections, parameterized by which link hook
/// it threads through.
pub struct VcList {
    head: Cell<*const NetVc>,
    tail: Cell<*const NetVc>,
    len: Cell<usize>,
    link_of: fn(&NetVc) -> &VcLink,
}

// Safety: see VcLink.
unsafe impl Send for VcList {}
unsafe impl Sync for VcList {}

impl VcList {
    pub fn new(link_of: fn(&NetVc) -> &VcLink) -> VcList {
        VcList {
            head: Cell::new(ptr::null()),
            tail: Cell::new(ptr::null()),
            len: Cell::new(0),
            link_of,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.get()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    #[inline]
    pub fn contains(&self, vc: &NetVc) -> bool {
        (self.link_of)(vc).in_list()
    }

    /// Append; a no-op when already a member.
    pub fn in_or_enqueue(&self, vc: *const NetVc) {
        // Safety: caller guarantees `vc` is alive and the reactor mutex is
        // held.
        let link = (self.link_of)(unsafe { &*vc });
        if link.in_list() {
            return;
        }
        self.enqueue(vc);
    }

    /// Append to the tail. The element must not already be a member.
    pub fn enqueue(&self, vc: *const NetVc) {
        let link = (self.link_of)(unsafe { &*vc });
        debug_assert!(!link.in_list());
        link.prev.set(self.tail.get());
        link.next.set(ptr::null());
        link.in_list.set(true);
        if self.tail.get().is_null() {
            self.head.set(vc);
        } else {
            let tail_link = (self.link_of)(unsafe { &*self.tail.get() });
            tail_link.next.set(vc);
        }
        self.tail.set(vc);
        self.len.set(self.len.get() + 1);
    }

    /// Unlink; a no-op when not a member. Returns whether it was one.
    pub fn remove(&self, vc: &NetVc) -> bool {
        let link = (self.link_of)(vc);
        if !link.in_list() {
            return false;
        }
        let prev = link.prev.get();
        let next = link.next.get();
        if prev.is_null() {
            self.head.set(next);
        } else {
            (self.link_of)(unsafe { &*prev }).next.set(next);
        }
        if next.is_null() {
            self.tail.set(prev);
        } else {
            (self.link_of)(unsafe { &*next }).prev.set(prev);
        }
        link.prev.set(ptr::null());
        link.next.set(ptr::null());
        link.in_list.set(false);
        self.len.set(self.len.get() - 1);
        true
    }

    /// Detach and return the head, or null.
    pub fn pop_head(&self) -> *const NetVc {
        let head = self.head.get();
        if head.is_null() {
            return head;
        }
        self.remove(unsafe { &*head });
        head
    }

    /// Snapshot the members in order. Used by scans that may unlink
    /// elements (or close them outright) while iterating.
    pub fn collect(&self) -> Vec<*const NetVc> {
        let mut out = Vec::with_capacity(self.len.get());
        let mut cur = self.head.get();
        while !cur.is_null() {
            out.push(cur);
            cur = (self.link_of)(unsafe { &*cur }).next.get();
        }
        out
    }
}

/// Strong-reference helpers for the open list, which owns its members.
impl VcList {
    /// Append `vc`, keeping one strong reference inside the list.
    pub fn enqueue_owned(&self, vc: Arc<NetVc>) {
        let ptr = Arc::into_raw(vc);
        self.enqueue(ptr);
    }

    /// Unlink `vc` and recover the strong reference the list held.
    pub fn remove_owned(&self, vc: &NetVc) -> Option<Arc<NetVc>> {
        if self.remove(vc) {
            // Safety: enqueue_owned leaked exactly one strong reference for
            // this pointer.
            Some(unsafe { Arc::from_raw(vc as *const NetVc) })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vc::NetVc;

    fn olink(vc: &NetVc) -> &VcLink {
        &vc.open_link
    }

    #[test]
    fn test_enqueue_pop_order() {
        let list = VcList::new(olink);
        let a = NetVc::new();
        let b = NetVc::new();
        let c = NetVc::new();
        list.enqueue(Arc::as_ptr(&a));
        list.enqueue(Arc::as_ptr(&b));
        list.enqueue(Arc::as_ptr(&c));
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_head(), Arc::as_ptr(&a));
        assert_eq!(list.pop_head(), Arc::as_ptr(&b));
        assert_eq!(list.pop_head(), Arc::as_ptr(&c));
        assert!(list.pop_head().is_null());
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let list = VcList::new(olink);
        let a = NetVc::new();
        list.enqueue(Arc::as_ptr(&a));
        assert!(list.remove(&a));
        assert!(!list.remove(&a));
        assert!(list.is_empty());
        assert!(!a.open_link.in_list());
    }

    #[test]
    fn test_in_or_enqueue_is_idempotent() {
        let list = VcList::new(olink);
        let a = NetVc::new();
        list.in_or_enqueue(Arc::as_ptr(&a));
        list.in_or_enqueue(Arc::as_ptr(&a));
        assert_eq!(list.len(), 1);
        assert!(list.contains(&a));
    }

    #[test]
    fn test_remove_middle_keeps_order() {
        let list = VcList::new(olink);
        let a = NetVc::new();
        let b = NetVc::new();
        let c = NetVc::new();
        list.enqueue(Arc::as_ptr(&a));
        list.enqueue(Arc::as_ptr(&b));
        list.enqueue(Arc::as_ptr(&c));
        assert!(list.remove(&b));
        let order = list.collect();
        assert_eq!(order, vec![Arc::as_ptr(&a), Arc::as_ptr(&c)]);
    }

    #[test]
    fn test_owned_membership_holds_a_reference() {
        let list = VcList::new(olink);
        let a = NetVc::new();
        let before = Arc::strong_count(&a);
        list.enqueue_owned(a.clone());
        assert_eq!(Arc::strong_count(&a), before + 1);
        let back = list.remove_owned(&a).unwrap();
        assert_eq!(Arc::strong_count(&a), before + 1);
        drop(back);
        assert_eq!(Arc::strong_count(&a), before);
        assert!(list.remove_owned(&a).is_none());
    }
}
