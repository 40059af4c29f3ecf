//! Unbounded intrusive MPSC queue.
//!
//! Producers serialize themselves on a single atomic swap of `head`; the
//! lone consumer walks the `next` chain from `tail` and frees nodes as it
//! advances. A persistent stub node keeps `head` and `tail` non-null, so the
//! empty state is `tail.next == null`.
//!
//! A producer that dies between its `head` swap and the `prev.next` store
//! strands every later element behind the broken link. This is a property of
//! the algorithm, not repaired here; producers must not abort between the
//! two writes.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::pad::CacheAligned;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn boxed(value: MaybeUninit<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(value),
        }))
    }
}

struct Inner<T> {
    head: CacheAligned<AtomicPtr<Node<T>>>,
    tail: CacheAligned<AtomicPtr<Node<T>>>,
}

// Safety: the `head` swap orders producers among themselves (AcqRel) and the
// `prev.next` store / `tail.next` acquire load hands each node to the
// consumer.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new() -> Self {
        let stub = Node::boxed(MaybeUninit::uninit());
        Self {
            head: CacheAligned::new(AtomicPtr::new(stub)),
            tail: CacheAligned::new(AtomicPtr::new(stub)),
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        unsafe {
            // The node at `tail` is the consumed stub; every node after it
            // still owns its value.
            let tail = self.tail.load(Ordering::Relaxed);
            let mut n = (*tail).next.load(Ordering::Relaxed);
            drop(Box::from_raw(tail));
            while !n.is_null() {
                let next = (*n).next.load(Ordering::Relaxed);
                (*(*n).value.get()).assume_init_drop();
                drop(Box::from_raw(n));
                n = next;
            }
        }
    }
}

/// Producing endpoint. Clone freely; any number of threads may push.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Consuming endpoint. `Send` but neither `Clone` nor `Sync`: the dequeue
/// path and node reclamation assume a single designated consumer.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Creates an unbounded MPSC queue and returns its endpoints.
pub fn channel<T: Send>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner::new());
    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver {
            inner,
            _not_sync: PhantomData,
        },
    )
}

impl<T: Send> Sender<T> {
    /// Appends `value`. Safe from any thread; per-sender order is preserved
    /// for the consumer.
    pub fn push(&self, value: T) {
        let n = Node::boxed(MaybeUninit::new(value));
        // The swap is the linearization point among producers.
        let prev = self.inner.head.swap(n, Ordering::AcqRel);
        // Danger zone: a producer dying here leaves `prev.next` null and
        // strands everything enqueued after it.
        unsafe { (*prev).next.store(n, Ordering::SeqCst) };
    }
}

impl<T: Send> Receiver<T> {
    /// Removes the oldest element, or returns `None`.
    ///
    /// `None` can also be reported while a producer sits inside its two-write
    /// window; the element becomes visible once the producer finishes, so
    /// callers poll or park on an [`EventCount`](crate::EventCount).
    pub fn try_pop(&self) -> Option<T> {
        let inner = &*self.inner;
        unsafe {
            let tail = inner.tail.load(Ordering::Relaxed);
            let next = (*tail).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            inner.tail.store(next, Ordering::Relaxed);
            let value = (*(*next).value.get()).assume_init_read();
            // The old stub is unreachable by every producer; free it here.
            drop(Box::from_raw(tail));
            Some(value)
        }
    }

    /// True if no element is currently published.
    pub fn is_empty(&self) -> bool {
        let inner = &*self.inner;
        unsafe {
            let tail = inner.tail.load(Ordering::Relaxed);
            (*tail).next.load(Ordering::Acquire).is_null()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    #[test]
    fn test_fifo_single_producer() {
        let (tx, rx) = channel();
        for i in 0..1000 {
            tx.push(i);
        }
        for i in 0..1000 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_per_producer_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let (tx, rx) = channel();
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        tx.push((id, seq));
                    }
                })
            })
            .collect();
        drop(tx);

        let mut last_seq: HashMap<usize, usize> = HashMap::new();
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            if let Some((id, seq)) = rx.try_pop() {
                match last_seq.get(&id) {
                    Some(&prev) => assert_eq!(seq, prev + 1, "producer {id} out of order"),
                    None => assert_eq!(seq, 0, "producer {id} must start at 0"),
                }
                last_seq.insert(id, seq);
                received += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        for h in handles {
            h.join().unwrap();
        }
        for id in 0..PRODUCERS {
            assert_eq!(last_seq[&id], PER_PRODUCER - 1);
        }
    }

    #[test]
    fn test_drop_releases_queued_values() {
        let (tx, rx) = channel();
        for i in 0..32 {
            tx.push(vec![i; 8]);
        }
        rx.try_pop().unwrap();
        drop((tx, rx));
    }
}
