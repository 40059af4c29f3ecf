//! Unbounded MPMC linked queue over the linked-epoch proxy.
//!
//! The producer side is the intrusive MPSC enqueue (swap `head`, link
//! `prev.next`); the consumer side races a CAS on `tail`. A losing consumer
//! may have already followed a `tail` that the winner just retired, so
//! dequeued stubs cannot be freed in place: the winner hands them to the
//! proxy, and every dequeue runs inside an acquired epoch.
//!
//! Cross-producer ordering is whatever the `head` swaps linearize to; only
//! per-producer order is guaranteed. Values are `Clone` because two racing
//! consumers both copy a candidate value before exactly one CAS wins.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::pad::CacheAligned;
use crate::proxy::linked::Proxy;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
    /// False only for the construction-time stub, which never held a value.
    has_value: bool,
}

impl<T> Node<T> {
    fn boxed(value: MaybeUninit<T>, has_value: bool) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(value),
            has_value,
        }))
    }
}

/// Owner token for a retired node, movable into the proxy's thunk.
struct Retired<T>(*mut Node<T>);

// Safety: the retired node is unlinked and the thunk is its sole owner.
unsafe impl<T: Send> Send for Retired<T> {}

impl<T> Retired<T> {
    unsafe fn reclaim(self) {
        let node = Box::from_raw(self.0);
        if node.has_value {
            (*node.value.get()).assume_init_drop();
        }
    }
}

/// Unbounded multi-producer multi-consumer queue.
///
/// Every queue is constructed over a [`Proxy`]; several queues may share
/// one. All operations take `&self` and are safe from any thread.
pub struct Queue<T> {
    proxy: Arc<Proxy>,
    head: CacheAligned<AtomicPtr<Node<T>>>,
    tail: CacheAligned<AtomicPtr<Node<T>>>,
}

// Safety: node handover follows the MPSC argument; stub retirement is
// fenced through the proxy.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T: Send + Clone + 'static> Queue<T> {
    /// Creates an empty queue routing retired nodes through `proxy`.
    pub fn new(proxy: Arc<Proxy>) -> Self {
        let stub = Node::boxed(MaybeUninit::uninit(), false);
        Self {
            proxy,
            head: CacheAligned::new(AtomicPtr::new(stub)),
            tail: CacheAligned::new(AtomicPtr::new(stub)),
        }
    }

    /// Appends `value`. Never blocks on queue state.
    pub fn push(&self, value: T) {
        let n = Node::boxed(MaybeUninit::new(value), true);
        let prev = self.head.swap(n, Ordering::AcqRel);
        // Same two-write window as the MPSC enqueue; producers must not die
        // between the swap and this store.
        unsafe { (*prev).next.store(n, Ordering::Release) };
    }

    /// Removes the oldest visible element, or returns `None`.
    ///
    /// The value is copied out before the claiming CAS, so a racing
    /// consumer may clone the same value and then lose; only the winner
    /// returns it.
    pub fn try_pop(&self) -> Option<T> {
        let guard = self.proxy.acquire();

        let result = unsafe {
            let mut t = self.tail.load(Ordering::Acquire);
            loop {
                let n = (*t).next.load(Ordering::Acquire);
                if n.is_null() {
                    break None;
                }
                let value = (*(*n).value.get()).assume_init_ref().clone();
                match self
                    .tail
                    .compare_exchange_weak(t, n, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        // Winner retires the outgoing stub; readers that
                        // already followed it stay safe until they release.
                        let retired = Retired(t);
                        self.proxy
                            .defer_recycle(move || unsafe { retired.reclaim() });
                        break Some(value);
                    }
                    Err(current) => t = current,
                }
            }
        };

        self.proxy.release(guard);
        result
    }

    /// True if no element is currently published. Advisory under
    /// concurrency.
    pub fn is_empty(&self) -> bool {
        let guard = self.proxy.acquire();
        let empty = unsafe {
            let t = self.tail.load(Ordering::Acquire);
            (*t).next.load(Ordering::Acquire).is_null()
        };
        self.proxy.release(guard);
        empty
    }

    /// The proxy this queue retires nodes through.
    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Nodes still linked from `tail` belong to the queue alone now;
        // already-retired stubs are the proxy's business.
        unsafe {
            let mut n = self.tail.load(Ordering::Relaxed);
            while !n.is_null() {
                let next = (*n).next.load(Ordering::Relaxed);
                let node = Box::from_raw(n);
                if node.has_value {
                    (*node.value.get()).assume_init_drop();
                }
                n = next;
            }
        }
    }
}
