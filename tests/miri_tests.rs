//! Small exercises of every unsafe kernel, sized for miri.
//!
//! Run with: `cargo +nightly miri test --test miri_tests`
//!
//! Miri interprets the MIR and flags uninitialized reads, use-after-free,
//! double frees, and leaks in the raw-pointer plumbing these structures are
//! built on. Thread counts and iteration counts are deliberately tiny.

use std::sync::Arc;
use std::thread;

use proxyq::{bounded, mpmc, mpsc, proxy, spsc};

#[test]
fn miri_bounded_push_pop_drop() {
    let q: bounded::Queue<Box<u32>, 4> = bounded::Queue::new();
    for i in 0..3 {
        q.try_push(Box::new(i)).unwrap();
    }
    assert_eq!(q.try_pop().as_deref(), Some(&0));
    // Two boxes left in the ring; Drop must free them exactly once.
}

#[test]
fn miri_bounded_wraps_laps() {
    let q: bounded::Queue<u8, 2> = bounded::Queue::new();
    for lap in 0..5 {
        q.try_push(lap).unwrap();
        q.try_push(lap + 100).unwrap();
        assert!(q.try_push(0).is_err());
        assert_eq!(q.try_pop(), Some(lap));
        assert_eq!(q.try_pop(), Some(lap + 100));
    }
}

#[test]
fn miri_spsc_recycles_without_ub() {
    let (tx, rx) = spsc::channel();
    // Enough traffic to cycle nodes through the cache several times.
    for i in 0..64u32 {
        tx.push(Box::new(i));
        if i % 3 == 0 {
            let _ = rx.try_pop();
        }
    }
    drop((tx, rx)); // in-flight values freed by the queue
}

#[test]
fn miri_spsc_two_threads() {
    let (tx, rx) = spsc::channel();
    let producer = thread::spawn(move || {
        for i in 0..32u32 {
            tx.push(i);
        }
    });
    let mut got = 0;
    while got < 32 {
        if rx.try_pop().is_some() {
            got += 1;
        } else {
            thread::yield_now();
        }
    }
    producer.join().unwrap();
}

#[test]
fn miri_mpsc_two_producers() {
    let (tx, rx) = mpsc::channel();
    let handles: Vec<_> = (0..2)
        .map(|id| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..16 {
                    tx.push((id, Box::new(i)));
                }
            })
        })
        .collect();
    drop(tx);

    let mut got = 0;
    while got < 32 {
        if rx.try_pop().is_some() {
            got += 1;
        } else {
            thread::yield_now();
        }
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(rx.try_pop().is_none());
}

#[test]
fn miri_mpsc_drop_mid_stream() {
    let (tx, rx) = mpsc::channel();
    for i in 0..8 {
        tx.push(vec![i]);
    }
    rx.try_pop().unwrap();
    drop((tx, rx)); // stub + 7 live nodes freed exactly once
}

#[test]
fn miri_linked_proxy_reclaims_once() {
    let proxy = proxy::linked::Proxy::new();
    let h = proxy.acquire();
    for i in 0..8 {
        let payload = Box::new(i);
        proxy.defer_recycle(move || drop(payload));
    }
    proxy.release(h);
    // Remaining collectors and any parked thunk freed on proxy drop.
}

#[test]
fn miri_indexed_proxy_epoch_rotation() {
    let proxy: proxy::indexed::Proxy<4, 2> = proxy::indexed::Proxy::new();
    let h = proxy.acquire();
    for _ in 0..6 {
        proxy.collect(&h, proxy::indexed::Node::alloc());
    }
    let h = proxy.sync(h);
    proxy.release(h);
    proxy.quiesce();
    proxy.quiesce();
    // Drop destroys whatever is still parked.
}

#[test]
fn miri_mpmc_retires_through_proxy() {
    let q = mpmc::Queue::new(Arc::new(proxy::linked::Proxy::new()));
    for i in 0..8u32 {
        q.push(i);
    }
    for i in 0..5u32 {
        assert_eq!(q.try_pop(), Some(i));
    }
    drop(q); // three queued values plus the live stub freed by the queue
}

#[test]
fn miri_mpmc_two_consumers() {
    let q = Arc::new(mpmc::Queue::new(Arc::new(proxy::linked::Proxy::new())));
    for i in 0..16u32 {
        q.push(i);
    }
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(v) = q.try_pop() {
                    got.push(v);
                }
                got
            })
        })
        .collect();

    let mut all: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 16);
}
