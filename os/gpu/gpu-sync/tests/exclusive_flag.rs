use gpu_sync::ExclusiveFlag;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn only_one_thread_wins_the_flag() {
    let threads = 8;
    let flag = Arc::new(ExclusiveFlag::new());
    let winners = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));
    let done = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let flag = Arc::clone(&flag);
            let winners = Arc::clone(&winners);
            let start = Arc::clone(&start);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                start.wait();
                let guard = flag.try_acquire();
                if guard.is_some() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // Keep the guard alive until everyone has tried.
                done.wait();
                drop(guard);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert!(!flag.is_set());
}

/// Two flags checked crosswise never let both sides proceed.
#[test]
fn crosswise_interlock_admits_at_most_one_side() {
    for _ in 0..2_000 {
        let a = Arc::new(ExclusiveFlag::new());
        let b = Arc::new(ExclusiveFlag::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(2));

        let side = |mine: Arc<ExclusiveFlag>, other: Arc<ExclusiveFlag>| {
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let Some(guard) = mine.try_acquire() else {
                    return;
                };
                if other.is_set() {
                    drop(guard);
                    return;
                }
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                thread::yield_now();
                inside.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            })
        };

        let h1 = side(Arc::clone(&a), Arc::clone(&b));
        let h2 = side(Arc::clone(&b), Arc::clone(&a));
        h1.join().unwrap();
        h2.join().unwrap();

        assert!(max_inside.load(Ordering::SeqCst) <= 1);
    }
}
