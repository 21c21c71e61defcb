//! Conservation under contention: whatever the interleaving, the surviving
//! state must match a sequential replay of the same operations.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use bop_lockfree::{ConcurrentMap, LocklessStack};
use rand::{Rng, SeedableRng, rngs::StdRng};

const THREADS: usize = 10;
const OPS_PER_THREAD: usize = 500_000;

#[test]
fn stack_balanced_push_pop_leaves_nothing_behind() {
    let stack = Arc::new(LocklessStack::<u64>::new());
    let pushed = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let stack = stack.clone();
            let pushed = pushed.clone();
            let popped = popped.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(thread_id as u64);
                let mut owed = 0usize;
                for i in 0..OPS_PER_THREAD {
                    // A thread only pops what it has pushed, so every thread
                    // ends balanced once it drains what it still owes.
                    if owed == 0 || rng.gen_bool(0.5) {
                        stack.push((thread_id * OPS_PER_THREAD + i) as u64);
                        pushed.fetch_add(1, Ordering::Relaxed);
                        owed += 1;
                    } else if stack.pop().is_some() {
                        popped.fetch_add(1, Ordering::Relaxed);
                        owed -= 1;
                    }
                }
                while owed > 0 {
                    if stack.pop().is_some() {
                        popped.fetch_add(1, Ordering::Relaxed);
                        owed -= 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("stack worker panicked");
    }

    let pushed = pushed.load(Ordering::Relaxed);
    let popped = popped.load(Ordering::Relaxed);
    assert_eq!(pushed - popped, stack.len());
    assert_eq!(stack.len(), 0);
    assert!(stack.is_empty());
    assert!(stack.pop().is_none());
}

#[test]
fn stack_values_are_conserved() {
    let stack = Arc::new(LocklessStack::<u64>::new());
    let per_thread = 20_000u64;

    let producers: Vec<_> = (0..4u64)
        .map(|t| {
            let stack = stack.clone();
            thread::spawn(move || {
                for i in 0..per_thread {
                    stack.push(t * per_thread + i);
                }
            })
        })
        .collect();
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let stack = stack.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..per_thread {
                    if let Some(value) = stack.pop() {
                        seen.push(value);
                    }
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer panicked");
    }
    let mut all: Vec<u64> = consumers
        .into_iter()
        .flat_map(|c| c.join().expect("consumer panicked"))
        .collect();
    while let Some(value) = stack.pop() {
        all.push(value);
    }

    assert_eq!(all.len() as u64, 4 * per_thread);
    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "a value was popped twice");
}

#[test]
fn map_disjoint_inserts_and_erases_survive_migrations() {
    let map = Arc::new(ConcurrentMap::<u64>::new());
    let per_thread = 20_000u64;

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                let base = t * per_thread + 1;
                for key in base..base + per_thread {
                    assert!(map.assign(key, Arc::new(key)).is_none());
                }
                // Erase every odd key again.
                for key in (base..base + per_thread).filter(|k| k % 2 == 1) {
                    assert_eq!(map.erase(key).map(|v| *v), Some(key));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("map worker panicked");
    }

    let expected = (THREADS as u64 * per_thread) / 2;
    assert_eq!(map.len() as u64, expected);
    for key in 1..=THREADS as u64 * per_thread {
        let value = map.get(key);
        if key % 2 == 0 {
            assert_eq!(value.map(|v| *v), Some(key), "key {key} lost");
        } else {
            assert!(value.is_none(), "key {key} resurrected");
        }
    }
    assert_eq!(map.snapshot().len() as u64, expected);
}

#[test]
fn map_contended_keys_keep_one_winner() {
    let map = Arc::new(ConcurrentMap::<u64>::new());
    let inserted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let map = map.clone();
            let inserted = inserted.clone();
            thread::spawn(move || {
                for key in 1..=5_000u64 {
                    let (value, fresh) = map.get_or_insert_with(key, || key * 100 + t);
                    if fresh {
                        inserted.fetch_add(1, Ordering::Relaxed);
                    }
                    assert_eq!(*value / 100, key);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("map worker panicked");
    }

    assert_eq!(inserted.load(Ordering::Relaxed), 5_000);
    assert_eq!(map.len(), 5_000);
}

#[test]
fn map_mixed_random_operations_match_final_accounting() {
    let map = Arc::new(ConcurrentMap::<u64>::new());
    let live = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let map = map.clone();
            let live = live.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0x5eed + t);
                for _ in 0..50_000 {
                    let key = rng.gen_range(1..2_048u64);
                    if rng.gen_bool(0.5) {
                        if map.assign(key, Arc::new(key)).is_none() {
                            live.fetch_add(1, Ordering::Relaxed);
                        }
                    } else if map.erase(key).is_some() {
                        live.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("map worker panicked");
    }

    let snapshot = map.snapshot();
    assert_eq!(snapshot.len(), live.load(Ordering::Relaxed));
    assert_eq!(map.len(), snapshot.len());
    for (key, value) in snapshot {
        assert_eq!(key, *value);
    }
}
