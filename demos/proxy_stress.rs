//! Indexed proxy-collector stress driver: writers churn a Treiber stack and
//! retire popped nodes, readers traverse under acquired epochs, reapers
//! force rotations.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use proxyq::proxy::indexed::{Node, Proxy};

const ITERS: usize = 150_000;
const WRITERS: usize = 3;
const READERS: usize = 5;
const REAPERS: usize = 2;

type StressProxy = Proxy<6, 4>;

/// Minimal Treiber stack over the proxy's intrusive nodes.
struct Stack {
    head: AtomicPtr<Node>,
}

impl Stack {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn push(&self, n: *mut Node) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*n).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, n, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    fn pop(&self) -> *mut Node {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return head;
            }
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return head,
                Err(observed) => head = observed,
            }
        }
    }

    fn get_head(&self) -> *mut Node {
        self.head.load(Ordering::Acquire)
    }
}

fn main() {
    println!("indexed proxy collector stress");
    println!("  writers: {WRITERS}, readers: {READERS}, reapers: {REAPERS}");
    println!("  iterations per writer: {ITERS}\n");

    let proxy: Arc<StressProxy> = Arc::new(Proxy::new());
    let stack = Arc::new(Stack::new());
    let writers_left = Arc::new(AtomicUsize::new(WRITERS));

    let mut handles = Vec::new();

    for _ in 0..READERS {
        let proxy = Arc::clone(&proxy);
        let stack = Arc::clone(&stack);
        let writers_left = Arc::clone(&writers_left);
        handles.push(thread::spawn(move || {
            let mut c = proxy.acquire();
            while writers_left.load(Ordering::SeqCst) != 0 {
                let mut n = stack.get_head();
                while !n.is_null() {
                    n = unsafe { (*n).next.load(Ordering::Relaxed) };
                }
                c = proxy.sync(c);
                thread::yield_now();
            }
            proxy.release(c);
        }));
    }

    for _ in 0..WRITERS {
        let proxy = Arc::clone(&proxy);
        let stack = Arc::clone(&stack);
        let writers_left = Arc::clone(&writers_left);
        handles.push(thread::spawn(move || {
            for i in 0..ITERS {
                stack.push(Node::alloc());
                if i % 2 == 0 {
                    let c = proxy.acquire();
                    proxy.collect(&c, stack.pop());
                    proxy.release(c);
                    thread::yield_now();
                }
            }
            for _ in 0..ITERS {
                let c = proxy.acquire();
                proxy.collect(&c, stack.pop());
                proxy.release(c);
            }
            writers_left.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    for _ in 0..REAPERS {
        let proxy = Arc::clone(&proxy);
        let writers_left = Arc::clone(&writers_left);
        handles.push(thread::spawn(move || {
            while writers_left.load(Ordering::SeqCst) != 0 {
                proxy.quiesce();
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    // Retire anything the interleaving left on the stack, then rotate the
    // remaining epochs out.
    let c = proxy.acquire();
    loop {
        let n = stack.pop();
        if n.is_null() {
            break;
        }
        proxy.collect(&c, n);
    }
    proxy.release(c);
    for _ in 0..8 {
        proxy.quiesce();
    }

    println!("done; stack drained and all epochs rotated out");
}
