//! proxyq - lock-free queue flavors with proxy-collector memory reclamation.
//!
//! A study collection of classic lock-free building blocks:
//!
//! - [`bounded::Queue`] - MPMC bounded array queue with per-slot sequence
//!   numbers. Fails fast on full/empty, no reclamation needed.
//! - [`spsc`] - unbounded SPSC queue whose producer recycles nodes through a
//!   private cache instead of the allocator.
//! - [`mpsc`] - unbounded intrusive MPSC queue; the single consumer owns
//!   reclamation.
//! - [`mpmc::Queue`] - unbounded MPMC linked queue, composed with the
//!   [`proxy::linked`] collector so retired nodes outlive every reader that
//!   could still touch them.
//! - [`proxy`] - the proxy-collector reclamation scheme itself, in a pooled
//!   linked-epoch flavor and an allocation-free indexed flavor.
//! - [`EventCount`] - semaphore-backed waiter/notifier adapter that lets a
//!   consumer block on an arbitrary predicate without losing wakeups.
//!
//! The queues never block on queue state: `try_pop` reports empty and the
//! bounded `try_push` reports full by return value, and callers decide
//! whether to spin ([`Backoff`]) or park ([`EventCount`]).
//!
//! # Example
//!
//! ```
//! use proxyq::bounded;
//!
//! let q: bounded::Queue<u32, 4> = bounded::Queue::new();
//! assert!(q.try_push(1).is_ok());
//! assert!(q.try_push(2).is_ok());
//! assert_eq!(q.try_pop(), Some(1));
//! assert_eq!(q.try_pop(), Some(2));
//! assert_eq!(q.try_pop(), None);
//! ```

mod backoff;
mod pad;

pub mod bounded;
pub mod eventcount;
pub mod mpmc;
pub mod mpsc;
pub mod proxy;
pub mod spsc;

pub use backoff::Backoff;
pub use bounded::Full;
pub use eventcount::EventCount;
pub use pad::CacheAligned;
