use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use proxyq::{bounded, mpmc, mpsc, proxy, spsc, Full};

const STREAM_LEN: u64 = 1_000_000;

fn bench_spsc_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc");
    group.throughput(Throughput::Elements(STREAM_LEN));

    group.bench_function("stream", |b| {
        b.iter(|| {
            let (tx, rx) = spsc::channel::<u64>();

            let producer = thread::spawn(move || {
                for i in 0..STREAM_LEN {
                    tx.push(i);
                }
            });

            let mut received = 0;
            while received < STREAM_LEN {
                if let Some(v) = rx.try_pop() {
                    black_box(v);
                    received += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
            producer.join().unwrap();
        });
    });

    group.finish();
}

fn bench_bounded_roundtrip(c: &mut Criterion) {
    const THREADS: usize = 4;
    const ITERS: usize = 100_000;

    let mut group = c.benchmark_group("bounded");
    group.throughput(Throughput::Elements((THREADS * ITERS * 2) as u64));

    group.bench_function("mpmc_roundtrip_4_threads", |b| {
        b.iter(|| {
            let q: Arc<bounded::Queue<usize, 1024>> = Arc::new(bounded::Queue::new());

            let handles: Vec<_> = (0..THREADS)
                .map(|tid| {
                    let q = Arc::clone(&q);
                    thread::spawn(move || {
                        for i in 0..ITERS {
                            let mut v = tid * ITERS + i;
                            while let Err(Full(back)) = q.try_push(v) {
                                v = back;
                                thread::yield_now();
                            }
                            loop {
                                if let Some(out) = q.try_pop() {
                                    black_box(out);
                                    break;
                                }
                                thread::yield_now();
                            }
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_mpsc_fan_in(c: &mut Criterion) {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250_000;

    let mut group = c.benchmark_group("mpsc");
    group.throughput(Throughput::Elements((PRODUCERS * PER_PRODUCER) as u64));

    group.bench_function("fan_in_4_producers", |b| {
        b.iter(|| {
            let (tx, rx) = mpsc::channel::<usize>();

            let handles: Vec<_> = (0..PRODUCERS)
                .map(|id| {
                    let tx = tx.clone();
                    thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            tx.push(id * PER_PRODUCER + i);
                        }
                    })
                })
                .collect();
            drop(tx);

            let mut received = 0;
            while received < PRODUCERS * PER_PRODUCER {
                if let Some(v) = rx.try_pop() {
                    black_box(v);
                    received += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_mpmc_unbounded(c: &mut Criterion) {
    const PRODUCERS: usize = 2;
    const CONSUMERS: usize = 2;
    const PER_PRODUCER: usize = 100_000;

    let mut group = c.benchmark_group("mpmc_unbounded");
    group.throughput(Throughput::Elements((PRODUCERS * PER_PRODUCER) as u64));

    group.bench_function("proxied_2p2c", |b| {
        b.iter(|| {
            let q = Arc::new(mpmc::Queue::new(Arc::new(proxy::linked::Proxy::new())));
            let remaining = Arc::new(AtomicUsize::new(PRODUCERS * PER_PRODUCER));

            let producers: Vec<_> = (0..PRODUCERS)
                .map(|id| {
                    let q = Arc::clone(&q);
                    thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            q.push(id * PER_PRODUCER + i);
                        }
                    })
                })
                .collect();

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let q = Arc::clone(&q);
                    let remaining = Arc::clone(&remaining);
                    thread::spawn(move || {
                        while remaining.load(Ordering::Relaxed) != 0 {
                            match q.try_pop() {
                                Some(v) => {
                                    black_box(v);
                                    remaining.fetch_sub(1, Ordering::Relaxed);
                                }
                                None => thread::yield_now(),
                            }
                        }
                    })
                })
                .collect();

            for p in producers {
                p.join().unwrap();
            }
            for c in consumers {
                c.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_spsc_stream,
    bench_bounded_roundtrip,
    bench_mpsc_fan_in,
    bench_mpmc_unbounded
);
criterion_main!(benches);
