//! Indexed fixed-fanout proxy collector.
//!
//! A fixed power-of-two array of collectors; one of them is "current" and
//! all new readers attach to it. Retired nodes pile up on the current
//! collector's deferred list until the defer limit trips a quiescence: the
//! current index rotates and the old collector's deferred list becomes
//! eligible for destruction once its last reader leaves. Destruction is
//! additionally held back one epoch through the proxy's back-link list, so a
//! node retired during epoch E dies no earlier than the completion of epoch
//! E+1.
//!
//! # Word layout
//!
//! The single `current` word packs the active index with a global reference
//! accumulator; per-collector `count` words use the same scale plus a
//! quiesce marker:
//!
//! ```text
//! current: bits 0..4  index of the active collector
//!          bits 5..   references, in units of 0x20
//! count:   bit 4      0x10, set while the collector is quiescing
//!          bits 5..   references (wrapping; releases may run ahead of the
//!                     transfer and drive the word negative)
//! ```
//!
//! Allocation-free after construction, at the price of bounding the fanout
//! by `N` and serializing epoch advancement behind the `quiesce` flag.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, Ordering};

const INDEX_MASK: u32 = 0xF;
const QUIESCE_BIT: u32 = 0x10;
const REF_UNIT: u32 = 0x20;
const REF_MASK: u32 = !(INDEX_MASK | QUIESCE_BIT);

/// Intrusive node understood by the proxy.
///
/// Client structures link nodes through `next`; the proxy threads retired
/// nodes through its private `defer_next`. A node handed to
/// [`Proxy::collect`] must have been allocated with [`Node::alloc`] and is
/// destroyed by the proxy via `Box::from_raw`.
pub struct Node {
    pub next: AtomicPtr<Node>,
    defer_next: UnsafeCell<*mut Node>,
}

// Safety: `defer_next` is written once while the node is being retired and
// read only after the epoch transition that fences retirement off from
// destruction.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub fn alloc() -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            defer_next: UnsafeCell::new(ptr::null_mut()),
        }))
    }
}

struct Collector {
    defer: AtomicPtr<Node>,
    defer_count: AtomicU32,
    count: AtomicU32,
}

impl Collector {
    fn new() -> Self {
        Self {
            defer: AtomicPtr::new(ptr::null_mut()),
            defer_count: AtomicU32::new(0),
            count: AtomicU32::new(0),
        }
    }
}

/// Reader token borrowed from a [`Proxy`]; give it back with
/// [`Proxy::release`] or trade it in with [`Proxy::sync`].
#[must_use = "an unreleased handle stalls the quiescence of its epoch"]
pub struct Handle<'a> {
    c: &'a Collector,
}

/// Indexed proxy collector with `N` pooled epochs.
///
/// Quiescence begins once a collector's deferred list reaches
/// `DEFER_LIMIT / 2` nodes, or eagerly via [`quiesce`](Self::quiesce).
pub struct Proxy<const DEFER_LIMIT: usize, const N: usize = 4> {
    current: AtomicU32,
    quiesce: AtomicBool,
    /// Back-link list: the previous epoch's nodes, destroyed at the end of
    /// the next one. Guarded by the `quiesce` flag.
    defer: UnsafeCell<*mut Node>,
    collectors: [Collector; N],
}

// Safety: `defer` is only touched by the thread holding the quiesce flag;
// everything else is atomics.
unsafe impl<const D: usize, const N: usize> Send for Proxy<D, N> {}
unsafe impl<const D: usize, const N: usize> Sync for Proxy<D, N> {}

fn destroy(mut n: *mut Node) {
    while !n.is_null() {
        unsafe {
            let next = *(*n).defer_next.get();
            drop(Box::from_raw(n));
            n = next;
        }
    }
}

impl<const DEFER_LIMIT: usize, const N: usize> Proxy<DEFER_LIMIT, N> {
    const FANOUT_OK: () = assert!(
        N >= 2 && N <= 16 && N.is_power_of_two(),
        "collector fanout must be a power of two in 2..=16"
    );

    pub fn new() -> Self {
        let () = Self::FANOUT_OK;
        Self {
            current: AtomicU32::new(0),
            quiesce: AtomicBool::new(false),
            defer: UnsafeCell::new(ptr::null_mut()),
            collectors: std::array::from_fn(|_| Collector::new()),
        }
    }

    /// Registers the caller as a reader of the current epoch.
    pub fn acquire(&self) -> Handle<'_> {
        let current = self.current.fetch_add(REF_UNIT, Ordering::Acquire);
        Handle {
            c: &self.collectors[(current & INDEX_MASK) as usize],
        }
    }

    /// Leaves the epoch. The last reader out of a quiescing epoch completes
    /// the transition and destroys the previous epoch's nodes.
    pub fn release(&self, handle: Handle<'_>) {
        let c = handle.c;
        let count = c.count.fetch_sub(REF_UNIT, Ordering::Release);
        // Quiesce marker plus exactly the reference we just removed: the
        // epoch is ours to finish.
        if (count & !INDEX_MASK) == QUIESCE_BIT + REF_UNIT {
            unsafe { self.quiesce_complete(c) };
        }
    }

    /// Re-arms `handle` if its epoch is in the middle of quiescing:
    /// releases it and acquires the now-current epoch. Long-running readers
    /// call this between traversals so an epoch can always drain.
    pub fn sync<'a>(&'a self, handle: Handle<'a>) -> Handle<'a> {
        if handle.c.count.load(Ordering::Relaxed) & QUIESCE_BIT != 0 {
            self.release(handle);
            return self.acquire();
        }
        handle
    }

    /// Retires `node` into `handle`'s epoch. Its memory is reclaimed after
    /// every reader that acquired before this call has released, at the
    /// earliest one full epoch later.
    pub fn collect(&self, handle: &Handle<'_>, node: *mut Node) {
        if node.is_null() {
            return;
        }
        let c = handle.c;
        unsafe {
            let prev = c.defer.swap(node, Ordering::Relaxed);
            *(*node).defer_next.get() = prev;
        }

        let count = c.defer_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count as usize >= DEFER_LIMIT / 2 {
            self.quiesce_begin();
        }
    }

    /// Eagerly starts an epoch rotation; reaper threads call this in a loop.
    pub fn quiesce(&self) {
        self.quiesce_begin();
    }

    fn quiesce_begin(&self) {
        if self.quiesce.swap(true, Ordering::Acquire) {
            return;
        }

        // Rotate the index and capture the accumulated reference count in
        // the same exchange.
        let index = self.current.load(Ordering::Relaxed) & INDEX_MASK;
        let old = self
            .current
            .swap(index.wrapping_add(1) & (N as u32 - 1), Ordering::AcqRel);
        let c = &self.collectors[(old & INDEX_MASK) as usize];
        let refs = old & REF_MASK;
        debug_assert_eq!(old & QUIESCE_BIT, 0);

        // Transfer the accumulated references and set the quiesce marker in
        // one add. Releases that already went through drove `count`
        // negative; landing on exactly `-refs` means they all have.
        if c.count.fetch_add(refs.wrapping_add(QUIESCE_BIT), Ordering::Release) == refs.wrapping_neg()
        {
            unsafe { self.quiesce_complete(c) };
        }
    }

    /// # Safety
    ///
    /// Caller must be the unique finisher of `c`'s quiescence: either the
    /// transfer in `quiesce_begin` observed all readers gone, or a release
    /// observed the final reference leave.
    unsafe fn quiesce_complete(&self, c: &Collector) {
        fence(Ordering::Acquire);

        // Keep the back link: destroy the previous epoch's nodes, park this
        // epoch's list until the next completion.
        let previous = *self.defer.get();
        *self.defer.get() = c.defer.load(Ordering::Relaxed);
        c.defer.store(ptr::null_mut(), Ordering::Relaxed);

        debug_assert_eq!(c.count.load(Ordering::Relaxed), QUIESCE_BIT);
        c.count.store(0, Ordering::Relaxed);
        c.defer_count.store(0, Ordering::Relaxed);

        self.quiesce.store(false, Ordering::Release);

        destroy(previous);
    }
}

impl<const DEFER_LIMIT: usize, const N: usize> Default for Proxy<DEFER_LIMIT, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DEFER_LIMIT: usize, const N: usize> Drop for Proxy<DEFER_LIMIT, N> {
    fn drop(&mut self) {
        destroy(unsafe { *self.defer.get() });
        for c in &self.collectors {
            destroy(c.defer.load(Ordering::Relaxed));
        }
    }
}
