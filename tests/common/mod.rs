use lockwatch::{CriticalThread, DeadlockKind, DeadlockReport, DetectionScheduler, DetectorConfig, LockWatch};
use std::sync::{Arc, Mutex as StdMutex, mpsc};
use std::time::{Duration, Instant};

#[allow(dead_code)]
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(3);
#[allow(dead_code)]
pub const NO_DEADLOCK_TIMEOUT: Duration = Duration::from_millis(500);

pub struct DetectorHarness {
    pub scheduler: DetectionScheduler,
    pub rx: mpsc::Receiver<DeadlockReport>,
    pub reports: Arc<StdMutex<Vec<DeadlockReport>>>,
}

/// Fast ticking config for tests
#[allow(dead_code)]
pub fn test_config() -> DetectorConfig {
    DetectorConfig {
        detection_interval_ms: 50,
        initial_delay_ms: 0,
        stall_threshold_ms: 200,
        shutdown_timeout_ms: 1000,
        ..Default::default()
    }
}

fn harness(watch: LockWatch) -> DetectorHarness {
    let (tx, rx) = mpsc::channel::<DeadlockReport>();
    let reports = Arc::new(StdMutex::new(Vec::new()));
    let seen = Arc::clone(&reports);
    let tx = StdMutex::new(tx);

    let scheduler = watch
        .callback(move |report| {
            seen.lock().unwrap().push(report.clone());
            let _ = tx.lock().unwrap().send(report.clone());
        })
        .start()
        .expect("Failed to start detector");

    DetectorHarness {
        scheduler,
        rx,
        reports,
    }
}

#[allow(dead_code)]
pub fn start_detector() -> DetectorHarness {
    start_detector_with(test_config())
}

#[allow(dead_code)]
pub fn start_detector_with(config: DetectorConfig) -> DetectorHarness {
    harness(LockWatch::new(config))
}

#[allow(dead_code)]
pub fn start_stall_detector(critical: impl CriticalThread + 'static) -> DetectorHarness {
    let config = DetectorConfig {
        detect_explicit_locks: false,
        detect_implicit_locks: false,
        ..test_config()
    };
    harness(LockWatch::new(config).critical_thread(critical))
}

/// Wait for the next report of `kind`, skipping other kinds
#[allow(dead_code)]
pub fn expect_report(h: &DetectorHarness, kind: DeadlockKind, timeout: Duration) -> DeadlockReport {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match h.rx.recv_timeout(left) {
            Ok(report) if report.kind == kind => return report,
            Ok(_) => continue,
            Err(_) => panic!("No {kind:?} report within {timeout:?}"),
        }
    }
}

#[allow(dead_code)]
pub fn assert_no_report(h: &DetectorHarness, timeout: Duration) {
    if let Ok(report) = h.rx.recv_timeout(timeout) {
        panic!("Unexpected report: {report}");
    }
}

/// Number of reports of `kind` seen so far
#[allow(dead_code)]
pub fn count_reports(h: &DetectorHarness, kind: DeadlockKind) -> usize {
    h.reports
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.kind == kind)
        .count()
}
