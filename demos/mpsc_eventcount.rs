//! MPSC fan-in driver with a blocking consumer: producers push and notify,
//! the consumer parks on the event-count instead of spinning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proxyq::{mpsc, Backoff, EventCount};
use rand::Rng;

const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 600_000;

fn main() {
    println!("MPSC fan-in through an event-count");
    println!("  producers: {PRODUCERS}");
    println!("  items per producer: {PER_PRODUCER}\n");

    let (tx, rx) = mpsc::channel::<usize>();
    let ec = Arc::new(EventCount::new());
    let start = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let tx = tx.clone();
            let ec = Arc::clone(&ec);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let pause = rand::thread_rng().gen_range(0..1000);
                while !start.load(Ordering::Relaxed) {
                    thread::yield_now();
                }
                for _ in 0..pause {
                    std::hint::spin_loop();
                }

                for i in 0..PER_PRODUCER {
                    tx.push(id * PER_PRODUCER + i);
                    ec.notify();
                }
            })
        })
        .collect();
    drop(tx);

    let consumer = {
        let ec = Arc::clone(&ec);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            while !start.load(Ordering::Relaxed) {
                thread::yield_now();
            }

            // Spin through the short producer publish windows; park on the
            // event-count once the backoff reports the queue genuinely dry.
            let mut sum = 0usize;
            let mut backoff = Backoff::new();
            for _ in 0..PRODUCERS * PER_PRODUCER {
                let v = loop {
                    if let Some(v) = rx.try_pop() {
                        break v;
                    }
                    if backoff.is_completed() {
                        break ec.wait_until(|| rx.try_pop());
                    }
                    backoff.snooze();
                };
                backoff.reset();
                sum += v;
            }
            sum
        })
    };

    thread::sleep(Duration::from_millis(100));
    let begin = Instant::now();
    start.store(true, Ordering::Relaxed);

    for p in producers {
        p.join().unwrap();
    }
    let sum = consumer.join().unwrap();

    let elapsed = begin.elapsed();
    let total = PRODUCERS * PER_PRODUCER;
    println!("received: {total}, checksum: {sum}");
    println!("elapsed:  {elapsed:?}");
    println!("ns/op:    {}", elapsed.as_nanos() / total as u128);

    let expected = total * (total - 1) / 2;
    assert_eq!(sum, expected);
}
