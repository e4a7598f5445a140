// Core types
pub mod types;
pub use types::*;

pub mod config;
pub use config::{ConfigError, DetectorConfig};

// Waits-for graph and cycle search
pub mod graph;

// Detectors and their shared plumbing
pub mod detector;
pub use detector::{CriticalThread, Task};

pub mod introspect;
pub use introspect::{FrameGuard, RegistryInspector, ThreadInspector, ThreadSnapshot, enter_frame};

// Instrumented and plain critical sections
pub mod locks;
pub use locks::condvar::TrackedCondvar;
pub use locks::mutex::{InterruptFlag, LockInterrupted, TrackedMutex, TrackedMutexGuard};
pub mod monitor;
pub use monitor::{Monitor, MonitorGuard};

pub mod event_loop;
pub use event_loop::{EventLoop, EventLoopHandle};

pub mod reporter;
pub use reporter::{FanoutReporter, JsonLinesReporter, LogReporter, Reporter};

pub mod scheduler;
pub use scheduler::DetectionScheduler;

pub mod thread;
pub mod utils;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// lockwatch configuration struct
///
/// Collects the collaborators a [`DetectionScheduler`] needs and builds it.
pub struct LockWatch {
    config: DetectorConfig,
    log_path: Option<PathBuf>,
    reporter: Option<Arc<dyn Reporter>>,
    inspector: Arc<dyn ThreadInspector>,
    critical: Option<Arc<dyn CriticalThread>>,
}

impl Default for LockWatch {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl LockWatch {
    /// Create a new LockWatch
    ///
    /// By default:
    /// - Reports are logged at error level through `tracing`
    /// - Threads are inspected through the built-in registry
    /// - No critical thread is watched, so stall detection is skipped
    pub fn new(config: DetectorConfig) -> Self {
        LockWatch {
            config,
            log_path: None,
            reporter: None,
            inspector: Arc::new(RegistryInspector),
            critical: None,
        }
    }

    /// Send reports to `reporter` instead of the log
    pub fn reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Set a callback to be invoked with every report
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DeadlockReport) + Send + Sync + 'static,
    {
        self.reporter = Some(Arc::new(callback));
        self
    }

    /// Also append every report as a JSON line to the file at `path`
    ///
    /// # Arguments
    /// * `path` - Path to the log file. If the path contains "{timestamp}",
    ///   it will be replaced with the current timestamp.
    pub fn with_log<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.log_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use a custom thread inspector
    pub fn inspector(mut self, inspector: impl ThreadInspector + 'static) -> Self {
        self.inspector = Arc::new(inspector);
        self
    }

    /// Watch `critical` for stalls
    pub fn critical_thread(mut self, critical: impl CriticalThread + 'static) -> Self {
        self.critical = Some(Arc::new(critical));
        self
    }

    /// Validate the configuration and build a stopped scheduler
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the log file
    /// cannot be opened
    pub fn build(self) -> Result<DetectionScheduler> {
        self.config.validate().context("Invalid detector configuration")?;

        let base: Arc<dyn Reporter> = self.reporter.unwrap_or_else(|| Arc::new(LogReporter));
        let sink: Arc<dyn Reporter> = match self.log_path {
            Some(path) => {
                let file = JsonLinesReporter::open(&path).context("Failed to initialize report log")?;
                Arc::new(
                    FanoutReporter::new()
                        .with(move |report: &DeadlockReport| base.report(report))
                        .with(file),
                )
            }
            None => base,
        };

        Ok(DetectionScheduler::new(
            self.config,
            sink,
            self.inspector,
            self.critical,
        ))
    }

    /// Build the scheduler and start it
    pub fn start(self) -> Result<DetectionScheduler> {
        let scheduler = self.build()?;
        scheduler.start()?;
        Ok(scheduler)
    }
}
