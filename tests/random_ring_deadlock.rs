use lockwatch::{DeadlockKind, thread};
use rand::Rng;
use std::sync::{Arc, Barrier};
use std::time::Duration;
mod common;
use common::{DEADLOCK_TIMEOUT, expect_report, start_detector};

#[test]
fn test_random_ring_deadlock() {
    let harness = start_detector();

    // Pick a random ring size between 3 and 8
    let mut rng = rand::rng();
    let n = rng.random_range(3..=8);

    let locks: Vec<_> = (0..n)
        .map(|i| Arc::new(harness.scheduler.create_tracked_lock(&format!("L{i}"), i, false)))
        .collect();

    let barrier = Arc::new(Barrier::new(n));
    for i in 0..n {
        let first = Arc::clone(&locks[i]);
        let second = Arc::clone(&locks[(i + 1) % n]);
        let bar = Arc::clone(&barrier);

        thread::spawn(move || {
            let mut rng = rand::rng();

            thread::sleep(Duration::from_millis(rng.random_range(0..30)));
            let _a = first.lock();

            // Everyone holds their first lock before anyone reaches for the second
            bar.wait();
            thread::sleep(Duration::from_millis(rng.random_range(0..30)));
            let _b = second.lock();
        });
    }

    let report = expect_report(&harness, DeadlockKind::ExplicitLockCycle, DEADLOCK_TIMEOUT);
    assert_eq!(report.cycles.len(), 1);
    assert_eq!(
        report.cycles[0].len(),
        n,
        "Expected a cycle of length {n}, got {:?}",
        report.cycles
    );
    assert_eq!(report.threads.len(), n);
    assert!(report.threads.iter().all(|t| t.held_locks.len() == 1 && t.waiting_for.is_some()));
}
