//! Bounded MPMC round-trip driver: every thread alternates one enqueue with
//! one dequeue against a shared 1024-slot queue and the run is timed wall
//! clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proxyq::{bounded, Backoff, Full};
use rand::Rng;

const THREADS: usize = 4;
const ITERS: usize = 200_000;

fn main() {
    println!("bounded MPMC round-trip");
    println!("  threads: {THREADS}");
    println!("  iterations per thread: {ITERS}\n");

    let queue: Arc<bounded::Queue<usize, 1024>> = Arc::new(bounded::Queue::new());
    let start = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let queue = Arc::clone(&queue);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                // Stagger the threads a little so they do not march in
                // lockstep out of the gate.
                let pause = rand::thread_rng().gen_range(0..1000);

                while !start.load(Ordering::Relaxed) {
                    thread::yield_now();
                }
                for _ in 0..pause {
                    std::hint::spin_loop();
                }

                for i in 0..ITERS {
                    let mut v = tid * ITERS + i;
                    let mut backoff = Backoff::new();
                    while let Err(Full(back)) = queue.try_push(v) {
                        v = back;
                        backoff.snooze();
                    }
                    backoff.reset();
                    while queue.try_pop().is_none() {
                        backoff.snooze();
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(100));
    let begin = Instant::now();
    start.store(true, Ordering::Relaxed);

    for h in handles {
        h.join().unwrap();
    }

    let elapsed = begin.elapsed();
    let ops = (THREADS * ITERS * 2) as u128;
    println!("elapsed: {elapsed:?}");
    println!("ns/op:   {}", elapsed.as_nanos() / ops);
    assert!(queue.is_empty());
}
