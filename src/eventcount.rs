//! Event-count: a waiter/notifier adapter over a counting semaphore.
//!
//! Lets a consumer block on an arbitrary predicate without lost wakeups.
//! The waiter brackets its predicate check with `prepare_wait` /
//! `commit_wait`; any notifier that runs after `prepare_wait` either sees
//! the `waiting` flag and posts the semaphore, or its state change is
//! already visible to the waiter's second predicate check. [`wait_until`]
//! packages the protocol.
//!
//! The semaphore is a futex-style counter (`atomic-wait`), standing in for
//! the POSIX semaphore this construction is classically built on.
//!
//! [`wait_until`]: EventCount::wait_until

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use atomic_wait::{wait, wake_one};

/// Counting semaphore over a 32-bit futex word.
struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
        wake_one(&self.count);
    }

    fn wait(&self) {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                // Sleeps only if the word is still 0; wakes may be spurious.
                wait(&self.count, 0);
                current = self.count.load(Ordering::Relaxed);
                continue;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Blocking adapter for consumers of the non-blocking queues.
pub struct EventCount {
    waiting: AtomicBool,
    semaphore: Semaphore,
}

impl EventCount {
    pub const fn new() -> Self {
        Self {
            waiting: AtomicBool::new(false),
            semaphore: Semaphore::new(),
        }
    }

    /// Announces intent to block. Must be followed by a predicate re-check
    /// and then either [`cancel_wait`](Self::cancel_wait) or
    /// [`commit_wait`](Self::commit_wait).
    pub fn prepare_wait(&self) {
        self.waiting.store(true, Ordering::SeqCst);
    }

    /// Withdraws a prepared wait after the re-check succeeded.
    pub fn cancel_wait(&self) {
        self.waiting.store(false, Ordering::Release);
    }

    /// Blocks until a notifier posts. The caller must have prepared and
    /// re-checked first; this is what closes the lost-wakeup window.
    pub fn commit_wait(&self) {
        self.semaphore.wait();
    }

    /// Wakes the waiter if one has announced itself. Call after publishing
    /// the state change the waiter's predicate looks for.
    ///
    /// The flag load is sequentially consistent: with a weaker load this
    /// check and the waiter's predicate re-check can both read stale values
    /// (the store-buffering outcome), which is exactly a lost wakeup.
    pub fn notify(&self) {
        if self.waiting.load(Ordering::SeqCst) {
            self.waiting.store(false, Ordering::Release);
            self.semaphore.post();
        }
    }

    /// Runs the full protocol around `predicate` until it yields a value.
    ///
    /// The predicate is evaluated once optimistically; after `prepare_wait`
    /// it is evaluated again before committing, so a notification delivered
    /// between the two checks is never lost.
    pub fn wait_until<F, R>(&self, mut predicate: F) -> R
    where
        F: FnMut() -> Option<R>,
    {
        loop {
            if let Some(value) = predicate() {
                return value;
            }
            self.prepare_wait();
            if let Some(value) = predicate() {
                self.cancel_wait();
                return value;
            }
            self.commit_wait();
        }
    }
}

impl Default for EventCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ready_predicate_returns_without_blocking() {
        let ec = EventCount::new();
        assert_eq!(ec.wait_until(|| Some(42)), 42);
    }

    #[test]
    fn test_cancel_path() {
        let ec = EventCount::new();
        let mut calls = 0;
        let v = ec.wait_until(|| {
            calls += 1;
            // Fail the optimistic check, succeed the re-check.
            (calls == 2).then_some(7)
        });
        assert_eq!(v, 7);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_notify_wakes_committed_waiter() {
        let ec = Arc::new(EventCount::new());
        let state = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let ec = Arc::clone(&ec);
            let state = Arc::clone(&state);
            thread::spawn(move || ec.wait_until(|| {
                let v = state.load(Ordering::SeqCst);
                (v != 0).then_some(v)
            }))
        };

        // Give the waiter time to park.
        thread::sleep(Duration::from_millis(50));
        state.store(9, Ordering::SeqCst);
        ec.notify();

        assert_eq!(waiter.join().unwrap(), 9);
    }

    #[test]
    fn test_notify_without_waiter_is_lost() {
        // A notify with nobody prepared must not leave a stale token that
        // lets a later waiter skip its commit with a stale predicate.
        let ec = EventCount::new();
        ec.notify();
        assert!(!ec.waiting.load(Ordering::SeqCst));
    }
}
