//! Linked-epoch proxy collector with pooled collectors.
//!
//! Collectors form a singly linked lifecycle list. The `tail` cursor is the
//! current collector; new readers attach to it. `free_head..free_tail`
//! brackets the recyclable span of the same list, so a retirement usually
//! reuses a drained collector instead of allocating.
//!
//! # Count layout
//!
//! A collector's `count` packs reader references with one flag bit:
//!
//! ```text
//! bit 0    GUARD     set while the collector is (or may still be) the tail
//! bits 1.. references, in units of REFERENCE = 2
//! ```
//!
//! The global `tail` is a `(sequence, pointer)` pair updated as one atomic
//! unit; `sequence` accumulates one `REFERENCE` per acquire and doubles as
//! the ABA counter for the pointer. When a retirement swaps the tail, the
//! accumulated external references are transferred into the old collector's
//! `count`, and the drop-to-zero cascade (`release_adjust`) runs each
//! drained collector's deferred thunk and feeds the collector back to the
//! free span.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

use crossbeam_utils::atomic::AtomicCell;

const GUARD: i32 = 1;
const REFERENCE: i32 = 2;

type Thunk = Box<dyn FnOnce() + Send>;

/// A `(sequence, pointer)` pair moved through [`AtomicCell`] as one unit.
///
/// Stable Rust has no 16-byte scalar atomic, and pointer-low-bit tagging
/// cannot hold the unbounded acquire accumulator, so the pair goes through
/// `AtomicCell`'s strongest available implementation instead. Every ordering
/// this strengthens is permitted by the algorithm.
#[derive(Clone, Copy, PartialEq, Eq)]
struct SeqPtr {
    seq: i32,
    ptr: *mut Collector,
}

// Safety: the pointer is only dereferenced by proxy code under the counting
// protocol; the pair itself is plain data.
unsafe impl Send for SeqPtr {}

impl SeqPtr {
    fn new(seq: i32, ptr: *mut Collector) -> Self {
        Self { seq, ptr }
    }
}

/// One epoch of the lifecycle list.
pub struct Collector {
    count: AtomicI32,
    next: AtomicPtr<Collector>,
    defer: UnsafeCell<Option<Thunk>>,
}

impl Collector {
    fn with_count(count: i32) -> Self {
        Self {
            count: AtomicI32::new(count),
            next: AtomicPtr::new(ptr::null_mut()),
            defer: UnsafeCell::new(None),
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
        // The previous thunk was consumed when this collector drained.
        unsafe { *self.defer.get() = None };
    }
}

/// Opaque reader token returned by [`Proxy::acquire`]; give it back with
/// [`Proxy::release`]. Dropping it without releasing pins the epoch forever.
#[must_use = "an unreleased handle pins its epoch and every deferred node behind it"]
pub struct Handle {
    c: NonNull<Collector>,
}

/// Linked-epoch proxy collector.
pub struct Proxy {
    tail: AtomicCell<SeqPtr>,
    free_head: AtomicCell<SeqPtr>,
    free_tail: AtomicCell<SeqPtr>,
}

// Safety: collectors are shared under the packed-count protocol above;
// thunks are required to be Send.
unsafe impl Send for Proxy {}
unsafe impl Sync for Proxy {}

impl Proxy {
    pub fn new() -> Self {
        // The initial collector is born as the tail: guarded, plus the one
        // reference the lifecycle cascade will consume when it drains.
        let c = Box::into_raw(Box::new(Collector::with_count(GUARD + REFERENCE)));
        let sp = SeqPtr::new(0, c);
        Self {
            tail: AtomicCell::new(sp),
            free_head: AtomicCell::new(sp),
            free_tail: AtomicCell::new(sp),
        }
    }

    /// Registers the caller as a reader of the current epoch.
    pub fn acquire(&self) -> Handle {
        let mut old = self.tail.load();
        loop {
            let new = SeqPtr::new(old.seq.wrapping_add(REFERENCE), old.ptr);
            match self.tail.compare_exchange(old, new) {
                Ok(_) => {
                    // Safety: the tail pointer is never null.
                    return Handle {
                        c: unsafe { NonNull::new_unchecked(old.ptr) },
                    };
                }
                Err(current) => old = current,
            }
        }
    }

    /// Leaves the epoch referenced by `handle`. The last reader out of a
    /// retired epoch runs its deferred work.
    pub fn release(&self, handle: Handle) {
        unsafe { self.release_adjust(handle.c.as_ptr(), 0) };
    }

    /// Retires `f`: it runs once every reader that acquired before this call
    /// has released.
    pub fn defer_recycle(&self, f: impl FnOnce() + Send + 'static) {
        unsafe {
            let c = self.alloc_collector();
            // Guarded, one reference for the predecessor's cascade to
            // consume, one for the accumulated-reference transfer below.
            (*c).count.store(GUARD + 2 * REFERENCE, Ordering::Relaxed);
            *(*c).defer.get() = Some(Box::new(f));

            let new_tail = SeqPtr::new(0, c);
            let mut old_tail = self.tail.load();
            while let Err(current) = self.tail.compare_exchange(old_tail, new_tail) {
                old_tail = current;
            }
            (*old_tail.ptr).next.store(c, Ordering::Release);

            // Transfer the external references accumulated while `old_tail`
            // was current, clearing its GUARD along the way.
            self.release_adjust(old_tail.ptr, old_tail.seq.wrapping_sub(GUARD));
        }
    }

    /// Pops a collector from the free span, or allocates a fresh one.
    fn alloc_collector(&self) -> *mut Collector {
        let mut old_free = self.free_head.load();
        while old_free.ptr != self.free_tail.load().ptr {
            unsafe {
                let next = (*old_free.ptr).next.load(Ordering::Relaxed);
                let new_free = SeqPtr::new(old_free.seq.wrapping_add(GUARD), next);
                match self.free_head.compare_exchange(old_free, new_free) {
                    Ok(_) => {
                        let c = old_free.ptr;
                        (*c).reset();
                        return c;
                    }
                    Err(current) => old_free = current,
                }
            }
        }
        Box::into_raw(Box::new(Collector::with_count(0)))
    }

    /// Drop-to-zero cascade.
    ///
    /// Subtracts `REFERENCE - adjust` from `c.count`; while that empties a
    /// collector, pushes it onto the free span, steps to its successor, runs
    /// the successor's deferred thunk, and keeps walking with the plain
    /// `REFERENCE` target. A non-zero `adjust` is only passed by
    /// [`defer_recycle`](Self::defer_recycle), which folds the accumulated
    /// external references and the GUARD clear into one subtraction.
    ///
    /// # Safety
    ///
    /// `c` must come from this proxy's lifecycle list, with either a live
    /// reader reference or the tail's GUARD keeping it alive.
    unsafe fn release_adjust(&self, c: *mut Collector, adjust: i32) {
        let mut current = c;
        let mut target = REFERENCE.wrapping_sub(adjust);
        loop {
            // Either the count already sits at the exact amount we are about
            // to remove, or removing it gets there; both mean `current` is
            // drained and this caller is the unique winner.
            let drained = (*current).count.load(Ordering::Acquire) == target
                || (*current).count.fetch_sub(target, Ordering::AcqRel) == target;
            if !drained {
                return;
            }

            let next = (*current).next.load(Ordering::Acquire);
            debug_assert!(!next.is_null(), "a drained collector always has a successor");

            // Feed the drained collector back to the recyclable span by
            // advancing free_tail one step along the list.
            let mut free_tail = self.free_tail.load();
            loop {
                let free_next = (*free_tail.ptr).next.load(Ordering::Relaxed);
                match self
                    .free_tail
                    .compare_exchange(free_tail, SeqPtr::new(0, free_next))
                {
                    Ok(_) => break,
                    Err(current_tail) => free_tail = current_tail,
                }
            }

            current = next;

            // The predecessor of `current` has fully drained: every reader
            // that predates the retirement recorded in `current` is gone.
            if let Some(f) = (*(*current).defer.get()).take() {
                f();
            }

            target = REFERENCE;
        }
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        // With `&mut self` there are no readers left; run whatever deferred
        // work is still parked and free the whole lifecycle list.
        unsafe {
            let mut c = self.free_head.load().ptr;
            while !c.is_null() {
                let next = (*c).next.load(Ordering::Relaxed);
                if let Some(f) = (*(*c).defer.get()).take() {
                    f();
                }
                drop(Box::from_raw(c));
                c = next;
            }
        }
    }
}
