//! Bounded MPMC queue over a sequence-numbered ring.
//!
//! Every slot carries its own sequence counter. The counter's distance from
//! the enqueue (resp. dequeue) position classifies the slot as writable,
//! readable, or still occupied by the previous lap, so full/empty detection
//! needs no shared occupancy counter. Producers and consumers claim a
//! position with a relaxed CAS and hand the slot over with a release store
//! of the slot sequence; the matching acquire load on the other side is the
//! only cross-thread synchronization edge.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::pad::CacheAligned;

/// Error returned by [`Queue::try_push`] when the chosen slot still holds an
/// unread element from the previous lap. Hands the rejected value back.
#[derive(Error)]
#[error("queue is full")]
pub struct Full<T>(pub T);

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer multi-consumer queue with `N` slots.
///
/// `N` must be a power of two and at least 2; this is enforced at compile
/// time. Capacity is fixed for the queue's lifetime.
pub struct Queue<T, const N: usize> {
    buffer: CacheAligned<Box<[Slot<T>]>>,
    enqueue_pos: CacheAligned<AtomicUsize>,
    dequeue_pos: CacheAligned<AtomicUsize>,
}

// Safety: slot handover is mediated by the per-slot sequence (release store
// by the writer, acquire load by the reader), so values move between threads
// with the necessary ordering.
unsafe impl<T: Send, const N: usize> Send for Queue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Queue<T, N> {}

impl<T, const N: usize> Queue<T, N> {
    const CAPACITY_OK: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "queue capacity must be a power of two >= 2"
    );

    const MASK: usize = N - 1;

    pub fn new() -> Self {
        let () = Self::CAPACITY_OK;

        let buffer = (0..N)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer: CacheAligned::new(buffer),
            enqueue_pos: CacheAligned::new(AtomicUsize::new(0)),
            dequeue_pos: CacheAligned::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the fixed capacity.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of elements currently queued. Advisory: concurrent operations
    /// may change the answer before it is returned.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(N)
    }

    /// True if the queue appears empty. Advisory, like [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.enqueue_pos.load(Ordering::Relaxed) == self.dequeue_pos.load(Ordering::Relaxed)
    }

    /// Attempts to enqueue `value`.
    ///
    /// Fails fast with [`Full`] when the slot at the current enqueue position
    /// is still one lap behind; never blocks and never spins on a full queue.
    pub fn try_push(&self, value: T) -> Result<(), Full<T>> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & Self::MASK];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;

            if dif == 0 {
                // Slot is writable at `pos`; claim the position.
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                // The slot still holds an element from the previous lap.
                return Err(Full(value));
            } else {
                // Another producer claimed `pos`; chase the counter.
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue an element. Returns `None` when no element is
    /// currently published.
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & Self::MASK];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as isize - pos.wrapping_add(1) as isize;

            if dif == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        // Mark the slot writable for the next lap.
                        slot.sequence.store(pos.wrapping_add(N), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T, const N: usize> Default for Queue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Queue<T, N> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}
