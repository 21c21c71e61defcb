use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::qsbr::Qsbr;

struct Node<T> {
    value: ManuallyDrop<T>,
    next: *mut Node<T>,
}

/// Node shell whose value has already been moved out by `pop`.
struct RetiredNode<T>(*mut Node<T>);

// SAFETY: the node is unlinked and its value was moved out; only the
// allocation itself travels to the reclaiming thread.
unsafe impl<T: Send> Send for RetiredNode<T> {}

impl<T> Drop for RetiredNode<T> {
    fn drop(&mut self) {
        // SAFETY: produced by `Box::into_raw` in `push`, unlinked by exactly one
        // successful pop, and reclaimed once.
        unsafe { drop(Box::from_raw(self.0)) };
    }
}

/// Lock-free LIFO stack.
///
/// `pop` reads the head node's `next` pointer inside a QSBR critical section,
/// so a concurrently popped node cannot be freed (and its address reused)
/// before the read completes.
pub struct LocklessStack<T: Send + 'static> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    len: AtomicUsize,
    qsbr: Qsbr,
}

// SAFETY: values are moved in and out whole; nodes are shared only through
// atomics and reclaimed through QSBR.
unsafe impl<T: Send + 'static> Send for LocklessStack<T> {}
unsafe impl<T: Send + 'static> Sync for LocklessStack<T> {}

impl<T: Send + 'static> LocklessStack<T> {
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
            qsbr: Qsbr::new(),
        }
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value: ManuallyDrop::new(value),
            next: ptr::null_mut(),
        }));
        // Counted before publishing so a racing pop never drives `len` below zero.
        self.len.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `node` is still private to this thread.
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            backoff.spin();
        }
    }

    pub fn pop(&self) -> Option<T> {
        let _guard = self.qsbr.pin();
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: pinned, so `head` stays allocated even if another thread
            // pops it first; `next` is immutable once the node is published.
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: the successful CAS makes this thread the sole owner
                // of the node's value.
                let value = unsafe { ManuallyDrop::take(&mut (*head).value) };
                self.qsbr.defer(RetiredNode(head));
                return Some(value);
            }
            backoff.spin();
        }
    }

    /// Approximate while pushes and pops are in flight, exact once they settle.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Pops and drops every element.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl<T: Send + 'static> Default for LocklessStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for LocklessStack<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: `&mut self` excludes every other accessor; each remaining
            // node is owned by the stack and still holds its value.
            let mut boxed = unsafe { Box::from_raw(node) };
            unsafe { ManuallyDrop::drop(&mut boxed.value) };
            node = boxed.next;
        }
    }
}

impl<T: Send + 'static> fmt::Debug for LocklessStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocklessStack")
            .field("len", &self.len())
            .finish()
    }
}
