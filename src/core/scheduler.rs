//! Detection lifecycle
//!
//! A [`DetectionScheduler`] owns the enabled detectors and a background thread
//! that runs them: first after the initial delay, then once per interval.
//! Each detector runs isolated; an error or a panic is logged and the tick
//! moves on to the next detector.

use crate::core::config::DetectorConfig;
use crate::core::detector::deadlock_handling::{Dispatcher, ReportSender};
use crate::core::detector::{
    CriticalThread, Detector, ExplicitLockDetector, ImplicitLockDetector, LockTracker,
    StallDetector,
};
use crate::core::introspect::ThreadInspector;
use crate::core::locks::mutex::TrackedMutex;
use crate::core::reporter::Reporter;
use crate::core::utils::join_with_timeout;
use anyhow::{Result, bail};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use parking_lot::lock_api::{self, RawMutexFair};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

enum SchedulerState {
    Stopped,
    Running(Running),
}

/// Everything that exists only while the scheduler runs
struct Running {
    detectors: Arc<Vec<Detector>>,
    tracker: Option<Arc<LockTracker>>,
    dispatcher: Dispatcher,
    stop: Sender<()>,
    cancelled: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

/// Owner of the detectors and of the periodic detection thread
pub struct DetectionScheduler {
    config: DetectorConfig,
    sink: Arc<dyn Reporter>,
    inspector: Arc<dyn ThreadInspector>,
    critical: Option<Arc<dyn CriticalThread>>,
    state: Mutex<SchedulerState>,
}

impl DetectionScheduler {
    pub fn new(
        config: DetectorConfig,
        sink: Arc<dyn Reporter>,
        inspector: Arc<dyn ThreadInspector>,
        critical: Option<Arc<dyn CriticalThread>>,
    ) -> Self {
        DetectionScheduler {
            config,
            sink,
            inspector,
            critical,
            state: Mutex::new(SchedulerState::Stopped),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), SchedulerState::Running(_))
    }

    /// Names of the detectors a start builds
    ///
    /// Stall detection only counts when a critical thread was supplied.
    pub fn enabled_detectors(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.config.detect_explicit_locks {
            names.push("explicit-lock");
        }
        if self.config.detect_implicit_locks {
            names.push("implicit-lock");
        }
        if self.config.detect_stalls && self.critical.is_some() {
            names.push("stall");
        }
        names
    }

    /// Build a fresh detector set and start the detection thread
    ///
    /// Starting a running scheduler does nothing.
    pub fn start(&self) -> Result<()> {
        self.config.validate()?;
        let mut state = self.state.lock();
        if matches!(*state, SchedulerState::Running(_)) {
            tracing::debug!(target: "lockwatch", "scheduler already running");
            return Ok(());
        }

        let dispatcher = Dispatcher::new(Arc::clone(&self.sink))?;
        let detectors = Arc::new(self.build_detectors(&dispatcher.sender()));
        let tracker = detectors.iter().find_map(|d| d.tracker().cloned());
        let cancelled = Arc::new(AtomicBool::new(false));
        let (stop, stop_rx) = bounded::<()>(1);

        let spawned = {
            let detectors = Arc::clone(&detectors);
            let cancelled = Arc::clone(&cancelled);
            let initial_delay = self.config.initial_delay();
            let interval = self.config.detection_interval();
            std::thread::Builder::new()
                .name("lockwatch-detector".into())
                .spawn(move || {
                    let mut delay = initial_delay;
                    loop {
                        match stop_rx.recv_timeout(delay) {
                            Err(RecvTimeoutError::Timeout) => run_tick(&detectors, &cancelled),
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        }
                        delay = interval;
                    }
                })
        };

        let timer = match spawned {
            Ok(timer) => timer,
            Err(e) => {
                for detector in detectors.iter() {
                    detector.teardown();
                }
                drop(detectors);
                dispatcher.shutdown(self.config.shutdown_timeout());
                return Err(e.into());
            }
        };

        tracing::info!(
            target: "lockwatch",
            detectors = ?self.enabled_detectors(),
            interval_ms = self.config.detection_interval_ms,
            "deadlock detection started"
        );

        *state = SchedulerState::Running(Running {
            detectors,
            tracker,
            dispatcher,
            stop,
            cancelled,
            timer,
        });
        Ok(())
    }

    /// Stop detection and tear the detectors down
    ///
    /// Waits at most the shutdown timeout for the detection thread; a thread
    /// still busy after that is cancelled before its next detector and
    /// detached. Stopping a stopped scheduler does nothing.
    pub fn stop(&self) {
        let running = match std::mem::replace(&mut *self.state.lock(), SchedulerState::Stopped) {
            SchedulerState::Running(running) => running,
            SchedulerState::Stopped => return,
        };

        let timeout = self.config.shutdown_timeout();
        running.cancelled.store(true, Ordering::Release);
        let _ = running.stop.try_send(());
        if !join_with_timeout(running.timer, timeout) {
            tracing::warn!(
                target: "lockwatch",
                timeout_ms = self.config.shutdown_timeout_ms,
                "detection thread did not stop in time, cancelling it"
            );
        }

        for detector in running.detectors.iter() {
            detector.teardown();
        }
        drop(running.detectors);
        drop(running.tracker);

        if !running.dispatcher.shutdown(timeout) {
            tracing::warn!(target: "lockwatch", "report dispatcher did not drain in time");
        }
        tracing::info!(target: "lockwatch", "deadlock detection stopped");
    }

    /// Run every enabled detector once, on the calling thread
    pub fn detect_now(&self) -> Result<()> {
        let detectors = match &*self.state.lock() {
            SchedulerState::Running(running) => Arc::clone(&running.detectors),
            SchedulerState::Stopped => bail!("scheduler is not running"),
        };
        run_tick(&detectors, &AtomicBool::new(false));
        Ok(())
    }

    fn tracker(&self) -> Option<Arc<LockTracker>> {
        match &*self.state.lock() {
            SchedulerState::Running(running) => running.tracker.clone(),
            SchedulerState::Stopped => None,
        }
    }

    fn fallback_tracker(&self, name: &str) -> Option<Arc<LockTracker>> {
        let tracker = self.tracker();
        if tracker.is_none() {
            tracing::warn!(
                target: "lockwatch",
                lock = name,
                "explicit lock detection is not running, lock will not be tracked"
            );
        }
        tracker
    }

    /// Create a mutex reporting to this scheduler
    ///
    /// Before start, after stop, or with explicit detection disabled the
    /// mutex is returned uninstrumented.
    pub fn create_tracked_lock<T>(&self, name: &str, value: T, fair: bool) -> TrackedMutex<T> {
        let tracker = self.fallback_tracker(name);
        TrackedMutex::new_tracked(name, value, fair, tracker)
    }

    /// Instrument an existing mutex; same fallback as [`Self::create_tracked_lock`]
    pub fn wrap_lock<T, R: RawMutexFair>(
        &self,
        mutex: lock_api::Mutex<R, T>,
        name: &str,
    ) -> TrackedMutex<T, R> {
        let tracker = self.fallback_tracker(name);
        TrackedMutex::wrap(mutex, name, tracker)
    }

    fn build_detectors(&self, reports: &ReportSender) -> Vec<Detector> {
        let mut detectors = Vec::new();
        if self.config.detect_explicit_locks {
            detectors.push(Detector::ExplicitLock(ExplicitLockDetector::new(
                Arc::new(LockTracker::new()),
                Arc::clone(&self.inspector),
                reports.clone(),
            )));
        }
        if self.config.detect_implicit_locks {
            detectors.push(Detector::ImplicitLock(ImplicitLockDetector::new(
                Arc::clone(&self.inspector),
                reports.clone(),
            )));
        }
        if self.config.detect_stalls {
            match &self.critical {
                Some(critical) => detectors.push(Detector::Stall(StallDetector::new(
                    Arc::clone(critical),
                    Arc::clone(&self.inspector),
                    reports.clone(),
                    self.config.stall_threshold(),
                    self.config.shutdown_timeout(),
                ))),
                None => tracing::warn!(
                    target: "lockwatch",
                    "stall detection enabled without a critical thread, skipping it"
                ),
            }
        }
        for detector in &detectors {
            tracing::debug!(target: "lockwatch", detector = detector.name(), "detector enabled");
        }
        detectors
    }
}

impl Drop for DetectionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_tick(detectors: &[Detector], cancelled: &AtomicBool) {
    for detector in detectors {
        if cancelled.load(Ordering::Acquire) {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| detector.detect())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(target: "lockwatch", detector = detector.name(), "detection failed: {e:#}")
            }
            Err(_) => {
                tracing::error!(target: "lockwatch", detector = detector.name(), "detector panicked")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigError;
    use crate::core::introspect::{RegistryInspector, ThreadSnapshot};
    use crate::core::types::DeadlockReport;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn quiet_config() -> DetectorConfig {
        DetectorConfig {
            detect_stalls: false,
            detection_interval_ms: 60_000,
            initial_delay_ms: 60_000,
            ..Default::default()
        }
    }

    fn new_scheduler(config: DetectorConfig, inspector: Arc<dyn ThreadInspector>) -> DetectionScheduler {
        DetectionScheduler::new(
            config,
            Arc::new(|_: &DeadlockReport| {}),
            inspector,
            None,
        )
    }

    struct CountingInspector {
        calls: AtomicUsize,
        panic: bool,
    }

    impl ThreadInspector for CountingInspector {
        fn snapshot_all(&self) -> Result<Vec<ThreadSnapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("inspector exploded");
            }
            bail!("no threads for you")
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let scheduler = new_scheduler(quiet_config(), Arc::new(RegistryInspector));
        scheduler.stop();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        for config in [
            DetectorConfig {
                detection_interval_ms: 0,
                ..quiet_config()
            },
            DetectorConfig {
                stall_threshold_ms: 0,
                ..quiet_config()
            },
        ] {
            let scheduler = new_scheduler(config, Arc::new(RegistryInspector));
            let err = scheduler.start().unwrap_err();
            assert!(err.downcast_ref::<ConfigError>().is_some(), "{err:#}");
            assert!(!scheduler.is_running());
        }
    }

    #[test]
    fn test_stall_skipped_without_critical_thread() {
        let scheduler = new_scheduler(DetectorConfig::default(), Arc::new(RegistryInspector));
        assert_eq!(scheduler.enabled_detectors(), vec!["explicit-lock", "implicit-lock"]);
    }

    #[test]
    fn test_locks_untracked_when_stopped() {
        let scheduler = new_scheduler(quiet_config(), Arc::new(RegistryInspector));
        assert!(!scheduler.create_tracked_lock("early", 0, false).is_tracked());

        scheduler.start().unwrap();
        let tracked = scheduler.create_tracked_lock("live", 0, true);
        assert!(tracked.is_tracked());
        assert!(tracked.is_fair());
        assert!(scheduler.wrap_lock(parking_lot::Mutex::new(1), "wrapped").is_tracked());

        scheduler.stop();
        assert!(!scheduler.create_tracked_lock("late", 0, false).is_tracked());
    }

    #[test]
    fn test_locks_untracked_without_explicit_detection() {
        let config = DetectorConfig {
            detect_explicit_locks: false,
            ..quiet_config()
        };
        let scheduler = new_scheduler(config, Arc::new(RegistryInspector));
        scheduler.start().unwrap();
        assert!(!scheduler.create_tracked_lock("plain", 0, false).is_tracked());
    }

    #[test]
    fn test_restart_uses_fresh_tracker() {
        let scheduler = new_scheduler(quiet_config(), Arc::new(RegistryInspector));
        scheduler.start().unwrap();
        let first = scheduler.tracker().unwrap();
        scheduler.stop();
        assert!(!first.is_active());

        scheduler.start().unwrap();
        let second = scheduler.tracker().unwrap();
        assert!(second.is_active());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_detect_now_requires_running() {
        let scheduler = new_scheduler(quiet_config(), Arc::new(RegistryInspector));
        assert!(scheduler.detect_now().is_err());
        scheduler.start().unwrap();
        assert!(scheduler.detect_now().is_ok());
    }

    #[test]
    fn test_failing_detectors_are_isolated() {
        for panic in [false, true] {
            let inspector = Arc::new(CountingInspector {
                calls: AtomicUsize::new(0),
                panic,
            });
            let scheduler = new_scheduler(quiet_config(), inspector.clone());
            scheduler.start().unwrap();
            scheduler.detect_now().unwrap();
            scheduler.detect_now().unwrap();
            assert_eq!(inspector.calls.load(Ordering::SeqCst), 2);
            assert!(scheduler.is_running());
        }
    }

    #[test]
    fn test_periodic_ticks_run_detectors() {
        let inspector = Arc::new(CountingInspector {
            calls: AtomicUsize::new(0),
            panic: false,
        });
        let config = DetectorConfig {
            detection_interval_ms: 10,
            initial_delay_ms: 0,
            ..quiet_config()
        };
        let scheduler = new_scheduler(config, inspector.clone());
        scheduler.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        scheduler.stop();
        let calls = inspector.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected several ticks, saw {calls}");
    }
}
