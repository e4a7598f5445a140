use lockwatch::{DeadlockKind, DeadlockReport, DetectorConfig, LockWatch, thread};
use std::sync::{Arc, Barrier, mpsc};
mod common;
use common::{DEADLOCK_TIMEOUT, test_config};

#[test]
fn test_reports_are_appended_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("lockwatch_{timestamp}.jsonl");

    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let scheduler = LockWatch::new(DetectorConfig {
        detect_implicit_locks: false,
        ..test_config()
    })
    .with_log(&path)
    .callback(move |report| {
        let _ = tx.lock().unwrap().send(report.clone());
    })
    .start()
    .unwrap();

    let a = Arc::new(scheduler.create_tracked_lock("A", (), false));
    let b = Arc::new(scheduler.create_tracked_lock("B", (), false));
    let barrier = Arc::new(Barrier::new(2));
    for (first, second) in [(Arc::clone(&a), Arc::clone(&b)), (b, a)] {
        let bar = Arc::clone(&barrier);
        thread::spawn(move || {
            let _first = first.lock();
            bar.wait();
            let _second = second.lock();
        });
    }

    let delivered = rx.recv_timeout(DEADLOCK_TIMEOUT).expect("report");
    // Stopping drains the dispatcher, so the file is complete afterwards
    scheduler.stop();

    let logs: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(logs.len(), 1);
    let name = logs[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("lockwatch_") && !name.contains("{timestamp}"));

    let text = std::fs::read_to_string(&logs[0]).unwrap();
    let first: DeadlockReport = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(first.kind, DeadlockKind::ExplicitLockCycle);
    assert_eq!(first, delivered);

    let raw: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(raw["kind"], "explicit_lock_cycle");
    assert!(raw["threads"].as_array().unwrap().iter().all(|t| t["state"].is_string()));
}
