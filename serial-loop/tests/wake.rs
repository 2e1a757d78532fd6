#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serial_loop::{EventLoop, ParkMode};

fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

/// Many producers racing the loop's park/wake handshake must never leave
/// the loop asleep with completions queued.
#[test]
fn concurrent_producers() {
    init_logging();
    const THREADS: usize = 8;
    const PER_THREAD: usize = 250;

    let ev: EventLoop<(usize, usize)> = EventLoop::new().unwrap();
    for _ in 0..THREADS * PER_THREAD {
        ev.ref_work();
    }

    let mut threads = vec![];
    for t in 0..THREADS {
        let poster = ev.poster();
        threads.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                poster.post((t, i));
                if i % 17 == 0 {
                    thread::yield_now();
                }
            }
        }));
    }

    let mut last = [None::<usize>; THREADS];
    ev.run(|(t, i)| {
        // Items from one producer arrive in the order they were posted.
        if let Some(prev) = last[t] {
            assert!(i > prev, "producer {t} delivered {i} after {prev}");
        }
        last[t] = Some(i);
        ev.unref_work();
    })
    .unwrap();

    for thread in threads {
        thread.join().unwrap();
    }
    assert!(last.iter().all(|l| *l == Some(PER_THREAD - 1)));
}

#[test]
fn park_timeout_without_posts() {
    init_logging();
    let ev: EventLoop<()> = EventLoop::new().unwrap();
    ev.ref_work();
    ev.park(ParkMode::Timeout(Duration::from_millis(10))).unwrap();
    assert_eq!(ev.drain().count(), 0);
    ev.unref_work();
}

#[test]
fn delayed_post_wakes_parked_loop() {
    init_logging();
    let ev: EventLoop<u8> = EventLoop::new().unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    ev.ref_work();
    let poster = ev.poster();
    let thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        poster.post(7);
    });
    let seen = Arc::clone(&delivered);
    ev.run(|item| {
        assert_eq!(item, 7);
        seen.fetch_add(1, Ordering::Relaxed);
        ev.unref_work();
    })
    .unwrap();
    thread.join().unwrap();
    assert_eq!(delivered.load(Ordering::Relaxed), 1);
}
