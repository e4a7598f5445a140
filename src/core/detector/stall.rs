//! Critical thread stall detection
//!
//! A worker thread wakes every `threshold`. Each wake it checks whether the
//! heartbeat posted on the previous wake has run on the critical thread, then
//! posts a new one. A heartbeat that has not run for a full threshold means
//! the critical thread is stuck. One report is emitted per stall; the latch
//! clears once a heartbeat gets through again.

use crate::core::detector::deadlock_handling::{
    ReportSender, detail_from_snapshot, detail_without_snapshot, new_report,
};
use crate::core::introspect::{ThreadInspector, ThreadSnapshot};
use crate::core::types::{DeadlockKind, ThreadDetail, ThreadId};
use crate::core::utils::{duration_ms, join_with_timeout};
use anyhow::Result;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Zero-argument unit of work run on a critical thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread whose responsiveness is watched, with a queue to post work to
pub trait CriticalThread: Send + Sync {
    /// Identifier of the thread running posted tasks, once known
    fn thread_id(&self) -> Option<ThreadId>;

    /// Queue `task` to run on the thread, in order
    ///
    /// Returns `false` if the thread no longer accepts tasks.
    fn post(&self, task: Task) -> bool;
}

/// Heartbeat bookkeeping shared by the worker and posted heartbeats
#[derive(Debug)]
pub(crate) struct StallState {
    response_received: AtomicBool,
    last_check_ms: AtomicU64,
    monitoring: AtomicBool,
    reported: AtomicBool,
}

impl StallState {
    pub(crate) fn new() -> Self {
        StallState {
            response_received: AtomicBool::new(true),
            last_check_ms: AtomicU64::new(0),
            monitoring: AtomicBool::new(false),
            reported: AtomicBool::new(false),
        }
    }

    /// Record that the last heartbeat ran
    pub(crate) fn heartbeat(&self) {
        self.response_received.store(true, Ordering::Release);
    }

    /// Evaluate the previous heartbeat and arm the next one
    ///
    /// Returns how long the critical thread has been blocked if this check
    /// found a new stall. An ongoing stall that was already reported yields
    /// `None`, and a successful heartbeat clears the latch.
    pub(crate) fn evaluate(&self, now_ms: u64) -> Option<u64> {
        let stalled = if !self.response_received.load(Ordering::Acquire) {
            let blocked_ms = now_ms.saturating_sub(self.last_check_ms.load(Ordering::Acquire));
            self.reported
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| blocked_ms)
        } else {
            self.reported.store(false, Ordering::Release);
            None
        };

        self.response_received.store(false, Ordering::Release);
        self.last_check_ms.store(now_ms, Ordering::Release);
        stalled
    }

    pub(crate) fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }
}

/// Everything one heartbeat check needs; cloned into the worker thread
#[derive(Clone)]
struct Watch {
    state: Arc<StallState>,
    critical: Arc<dyn CriticalThread>,
    inspector: Arc<dyn ThreadInspector>,
    reports: ReportSender,
    threshold: Duration,
    origin: Instant,
}

impl Watch {
    fn now_ms(&self) -> u64 {
        duration_ms(self.origin.elapsed())
    }

    fn check(&self) {
        if !self.state.is_monitoring() {
            return;
        }

        if let Some(blocked_ms) = self.state.evaluate(self.now_ms())
            && let Err(e) = self.report(blocked_ms)
        {
            tracing::error!(target: "lockwatch", "failed to report stall: {e:#}");
        }

        let state = Arc::clone(&self.state);
        if !self.critical.post(Box::new(move || state.heartbeat())) {
            tracing::warn!(target: "lockwatch", "critical thread rejected heartbeat");
        }
    }

    fn report(&self, blocked_ms: u64) -> Result<()> {
        let critical_id = self.critical.thread_id();
        let threads = self.inspector.snapshot_all().unwrap_or_else(|e| {
            tracing::warn!(target: "lockwatch", "thread snapshot failed: {e:#}");
            Vec::new()
        });

        let mut critical = critical_detail(critical_id, &threads);
        critical.blocked_for_ms = Some(blocked_ms);

        let others = threads
            .iter()
            .filter(|t| Some(t.id) != critical_id)
            .map(detail_from_snapshot)
            .collect();

        let report = new_report(
            DeadlockKind::MainThreadStall,
            format!(
                "Critical thread blocked for {blocked_ms} ms (threshold: {} ms)",
                duration_ms(self.threshold)
            ),
            Vec::new(),
            vec![critical],
            others,
        );
        self.reports.send(report)
    }
}

fn critical_detail(critical_id: Option<ThreadId>, threads: &[ThreadSnapshot]) -> ThreadDetail {
    let Some(id) = critical_id else {
        let mut detail = detail_without_snapshot(0);
        detail.thread_name = "critical".into();
        return detail;
    };
    threads
        .iter()
        .find(|t| t.id == id)
        .map(detail_from_snapshot)
        .unwrap_or_else(|| detail_without_snapshot(id))
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Heartbeat-based detector for a blocked critical thread
pub struct StallDetector {
    watch: Watch,
    shutdown_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl StallDetector {
    pub fn new(
        critical: Arc<dyn CriticalThread>,
        inspector: Arc<dyn ThreadInspector>,
        reports: ReportSender,
        threshold: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        StallDetector {
            watch: Watch {
                state: Arc::new(StallState::new()),
                critical,
                inspector,
                reports,
                threshold,
                origin: Instant::now(),
            },
            shutdown_timeout,
            worker: Mutex::new(None),
        }
    }

    /// Start the heartbeat worker if it is not running yet
    ///
    /// The worker runs its own schedule, so later calls do nothing.
    pub fn detect(&self) -> Result<()> {
        let state = &self.watch.state;
        if state
            .monitoring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let (stop, stop_rx) = bounded::<()>(1);
        let watch = self.watch.clone();
        let spawned = std::thread::Builder::new()
            .name("lockwatch-stall-worker".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(watch.threshold) {
                        Err(RecvTimeoutError::Timeout) => watch.check(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                state.monitoring.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        tracing::debug!(
            target: "lockwatch",
            threshold_ms = duration_ms(self.watch.threshold),
            "stall worker started"
        );
        *self.worker.lock() = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stop the worker, waiting at most the shutdown timeout
    pub fn teardown(&self) {
        self.watch.state.monitoring.store(false, Ordering::Release);
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop.try_send(());
        if !join_with_timeout(worker.handle, self.shutdown_timeout) {
            tracing::warn!(target: "lockwatch", "stall worker did not stop in time, detaching it");
        }
    }
}

impl Drop for StallDetector {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DeadlockReport, ThreadState};

    /// Critical thread that only runs tasks when told to
    #[derive(Default)]
    struct ManualThread {
        queue: Mutex<Vec<Task>>,
    }

    impl ManualThread {
        fn run_pending(&self) {
            let tasks: Vec<Task> = self.queue.lock().drain(..).collect();
            for task in tasks {
                task();
            }
        }
    }

    impl CriticalThread for ManualThread {
        fn thread_id(&self) -> Option<ThreadId> {
            Some(1)
        }

        fn post(&self, task: Task) -> bool {
            self.queue.lock().push(task);
            true
        }
    }

    struct FixedInspector;

    impl ThreadInspector for FixedInspector {
        fn snapshot_all(&self) -> Result<Vec<ThreadSnapshot>> {
            Ok((1..=3)
                .map(|id| ThreadSnapshot {
                    id,
                    name: if id == 1 { "ui".into() } else { format!("bg-{id}") },
                    state: ThreadState::Runnable,
                    stack: vec![format!("frame-{id}")],
                })
                .collect())
        }
    }

    fn watch(
        critical: Arc<ManualThread>,
    ) -> (Watch, crossbeam_channel::Receiver<DeadlockReport>) {
        let (reports, rx) = ReportSender::channel();
        let state = Arc::new(StallState::new());
        state.monitoring.store(true, Ordering::Release);
        let watch = Watch {
            state,
            critical,
            inspector: Arc::new(FixedInspector),
            reports,
            threshold: Duration::from_millis(100),
            origin: Instant::now(),
        };
        (watch, rx)
    }

    #[test]
    fn test_latch_reports_each_stall_once() {
        let state = StallState::new();
        // First check: nothing posted yet, counts as responsive
        assert_eq!(state.evaluate(100), None);
        assert_eq!(state.evaluate(200), Some(100));
        // Still stalled, already reported
        assert_eq!(state.evaluate(300), None);
        assert_eq!(state.evaluate(400), None);
        // Recovery clears the latch without reporting
        state.heartbeat();
        assert_eq!(state.evaluate(500), None);
        // A fresh stall is reported again
        assert_eq!(state.evaluate(650), Some(150));
    }

    #[test]
    fn test_responsive_thread_never_reports() {
        let state = StallState::new();
        for tick in 1..10 {
            assert_eq!(state.evaluate(tick * 100), None);
            state.heartbeat();
        }
    }

    #[test]
    fn test_check_reports_stalled_critical_thread() {
        let critical = Arc::new(ManualThread::default());
        let (watch, rx) = watch(Arc::clone(&critical));

        watch.check();
        assert!(rx.try_recv().is_err());
        assert_eq!(critical.queue.lock().len(), 1);

        // Heartbeat never runs
        watch.check();
        let report = rx.try_recv().expect("stall report");
        assert_eq!(report.kind, DeadlockKind::MainThreadStall);
        assert_eq!(report.threads.len(), 1);
        let ui = &report.threads[0];
        assert_eq!(ui.thread_name, "ui");
        assert!(ui.blocked_for_ms.is_some());
        assert_eq!(report.other_threads.len(), 2);
        assert!(report.other_threads.iter().all(|t| t.thread_id != 1));
        assert!(report.summary.contains("(threshold: 100 ms)"));

        watch.check();
        assert!(rx.try_recv().is_err());

        // Recover, then stall again
        critical.run_pending();
        watch.check();
        assert!(rx.try_recv().is_err());
        watch.check();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_check_is_inert_after_monitoring_stops() {
        let critical = Arc::new(ManualThread::default());
        let (watch, rx) = watch(Arc::clone(&critical));
        watch.state.monitoring.store(false, Ordering::Release);
        watch.check();
        watch.check();
        assert!(rx.try_recv().is_err());
        assert!(critical.queue.lock().is_empty());
    }

    #[test]
    fn test_worker_detects_and_stops() {
        let critical = Arc::new(ManualThread::default());
        let (reports, rx) = ReportSender::channel();
        let detector = StallDetector::new(
            critical,
            Arc::new(FixedInspector),
            reports,
            Duration::from_millis(20),
            Duration::from_secs(2),
        );

        detector.detect().unwrap();
        detector.detect().unwrap();
        let report = rx.recv_timeout(Duration::from_secs(2)).expect("stall report");
        assert_eq!(report.kind, DeadlockKind::MainThreadStall);

        detector.teardown();
        assert!(detector.worker.lock().is_none());
        assert!(!detector.watch.state.is_monitoring());
    }
}
