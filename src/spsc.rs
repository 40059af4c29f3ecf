//! Unbounded SPSC queue with a producer-private node cache.
//!
//! The queue is a singly linked list bracketed by four cursors that the
//! producer sees in ring order `first -> tail_copy -> tail -> head`. Nodes
//! between `tail` and `head` are in flight; nodes between `first` and
//! `tail_copy` are known-recyclable, so most pushes reuse a node instead of
//! hitting the allocator. A persistent stub node keeps every cursor non-null.
//!
//! Use [`channel`] to obtain the two endpoint handles. Each handle can move
//! to another thread but cannot be cloned or shared, which pins the
//! queue to exactly one producer and one consumer at compile time.

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

/// Cursors touched only by the producer. `head` is the most recently
/// published node, `first` the oldest node of the cache ring, and
/// `tail_copy` the producer's stale view of the consumer's `tail`.
struct ProducerSide<T> {
    head: AtomicPtr<Node<T>>,
    first: AtomicPtr<Node<T>>,
    tail_copy: AtomicPtr<Node<T>>,
}

struct Inner<T> {
    producer: CacheAligned<ProducerSide<T>>,
    tail: CacheAligned<AtomicPtr<Node<T>>>,
}

// Safety: node handover rides on the release store of `head.next` and the
// acquire load of `tail.next`; recycling rides on the release store of
// `tail` and the acquire reload in `alloc_node`.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new() -> Self {
        let stub = Node::boxed(MaybeUninit::uninit());
        Self {
            producer: CacheAligned::new(ProducerSide {
                head: AtomicPtr::new(stub),
                first: AtomicPtr::new(stub),
                tail_copy: AtomicPtr::new(stub),
            }),
            tail: CacheAligned::new(AtomicPtr::new(stub)),
        }
    }

    /// Obtains a node holding `value`, preferring the cache over the
    /// allocator. Producer-only.
    unsafe fn alloc_node(&self, value: T) -> *mut Node<T> {
        let first = self.producer.first.load(Ordering::Relaxed);

        let cached = self.producer.tail_copy.load(Ordering::Relaxed);
        if first != cached {
            (*(*first).value.get()).write(value);
            self.producer
                .first
                .store((*first).next.load(Ordering::Relaxed), Ordering::Relaxed);
            return first;
        }

        // Cache looks empty; refresh the view of the consumer's tail and
        // retry. Acquire stands in for the consume ordering the algorithm
        // actually needs.
        let cached = self.tail.load(Ordering::Acquire);
        self.producer.tail_copy.store(cached, Ordering::Relaxed);
        if first != cached {
            (*(*first).value.get()).write(value);
            self.producer
                .first
                .store((*first).next.load(Ordering::Relaxed), Ordering::Relaxed);
            return first;
        }

        Node::boxed(MaybeUninit::new(value))
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        unsafe {
            // Values still queued live strictly after `tail`; everything
            // from `first` up to and including `tail` has been consumed or
            // recycled and holds no live value.
            let tail = self.tail.load(Ordering::Relaxed);
            let mut n = (*tail).next.load(Ordering::Relaxed);
            while !n.is_null() {
                (*(*n).value.get()).assume_init_drop();
                n = (*n).next.load(Ordering::Relaxed);
            }

            let mut n = self.producer.first.load(Ordering::Relaxed);
            while !n.is_null() {
                let next = (*n).next.load(Ordering::Relaxed);
                drop(Box::from_raw(n));
                n = next;
            }
        }
    }
}

/// Producing endpoint. `Send` but deliberately neither `Clone` nor `Sync`:
/// a second producer would corrupt the node cache.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Consuming endpoint. `Send` but neither `Clone` nor `Sync`.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Creates an unbounded SPSC queue and returns its two endpoints.
pub fn channel<T: Send>() -> (Producer<T>, Consumer<T>) {
    let inner = Arc::new(Inner::new());
    (
        Producer {
            inner: Arc::clone(&inner),
            _not_sync: PhantomData,
        },
        Consumer {
            inner,
            _not_sync: PhantomData,
        },
    )
}

impl<T: Send> Producer<T> {
    /// Appends `value`. Never fails; allocates only when the node cache is
    /// empty.
    pub fn push(&self, value: T) {
        let inner = &*self.inner;
        unsafe {
            let n = inner.alloc_node(value);
            (*n).next.store(ptr::null_mut(), Ordering::Relaxed);

            let head = inner.producer.head.load(Ordering::Relaxed);
            // Publish the node; pairs with the acquire load in `try_pop`.
            (*head).next.store(n, Ordering::Release);
            inner.producer.head.store(n, Ordering::Relaxed);
        }
    }
}

impl<T: Send> Consumer<T> {
    /// Removes the oldest element, or returns `None` if nothing is
    /// published yet.
    pub fn try_pop(&self) -> Option<T> {
        let inner = &*self.inner;
        unsafe {
            let tail = inner.tail.load(Ordering::Relaxed);
            let next = (*tail).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            let value = (*(*next).value.get()).assume_init_read();
            // Hands the old tail node back to the producer's cache; pairs
            // with the acquire reload in `alloc_node`.
            inner.tail.store(next, Ordering::Release);
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
    use std::thread;

    #[test]
    fn test_fifo_single_thread() {
        let (tx, rx) = channel();
        assert!(rx.is_empty());

        for i in 0..100 {
            tx.push(i);
        }
        for i in 0..100 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_nodes_are_recycled() {
        let (tx, rx) = channel();

        // Interleaved push/pop keeps the live set at one node, so the cache
        // must absorb most of the traffic. Just exercise it heavily.
        for round in 0..10_000u64 {
            tx.push(round);
            assert_eq!(rx.try_pop(), Some(round));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_cross_thread_stream() {
        const COUNT: u64 = 100_000;
        let (tx, rx) = channel();

        let producer = thread::spawn(move || {
            for i in 1..=COUNT {
                tx.push(i);
            }
        });

        let mut sum = 0u64;
        let mut received = 0u64;
        while received < COUNT {
            if let Some(v) = rx.try_pop() {
                sum += v;
                received += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        producer.join().unwrap();
        assert_eq!(sum, COUNT * (COUNT + 1) / 2);
    }

    #[test]
    fn test_drop_releases_in_flight_values() {
        let (tx, rx) = channel();
        for i in 0..16 {
            tx.push(Box::new(i));
        }
        rx.try_pop().unwrap();
        drop((tx, rx)); // remaining boxes freed by the queue
    }
}
