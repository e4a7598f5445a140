//! Reporter sinks
//!
//! A [`Reporter`] is where finished reports go. Sinks run on the dispatcher
//! thread, never on a detection thread, so a slow or panicking sink cannot
//! stall detection.

use crate::core::types::{DeadlockKind, DeadlockReport, ThreadDetail};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Maximum number of stack frames rendered per thread
const MAX_RENDERED_FRAMES: usize = 15;
/// Maximum number of auxiliary threads rendered for a stall
const MAX_RENDERED_OTHERS: usize = 5;

const LINE: &str = "══════════════════════════════════════════════════════════════════";
const SEPARATOR: &str = "──────────────────────────────────────────────────────────────────";

/// Destination for deadlock and stall reports
pub trait Reporter: Send + Sync {
    fn report(&self, report: &DeadlockReport);
}

impl<F> Reporter for F
where
    F: Fn(&DeadlockReport) + Send + Sync,
{
    fn report(&self, report: &DeadlockReport) {
        self(report)
    }
}

/// Logs the rendered report at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, report: &DeadlockReport) {
        tracing::error!(target: "lockwatch", kind = ?report.kind, "{report}");
    }
}

/// Appends each report as one JSON line to a file
pub struct JsonLinesReporter {
    file: Mutex<File>,
}

impl JsonLinesReporter {
    /// Open (or create) the file in append mode
    ///
    /// If the path contains `{timestamp}` it is replaced with the current
    /// time.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = path.as_ref().to_string_lossy();
        let resolved = if raw.contains("{timestamp}") {
            let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
            raw.replace("{timestamp}", &stamp)
        } else {
            raw.into_owned()
        };

        if let Some(parent) = Path::new(&resolved).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&resolved)
            .with_context(|| format!("Failed to open report log {resolved}"))?;

        Ok(JsonLinesReporter {
            file: Mutex::new(file),
        })
    }

    fn write(&self, report: &DeadlockReport) -> Result<()> {
        let json = serde_json::to_string(report).context("Failed to serialize report")?;
        let mut file = self.file.lock();
        writeln!(file, "{json}").context("Failed to write report")?;
        file.flush().context("Failed to flush report log")?;
        Ok(())
    }
}

impl Reporter for JsonLinesReporter {
    fn report(&self, report: &DeadlockReport) {
        if let Err(e) = self.write(report) {
            tracing::warn!(target: "lockwatch", "dropping report: {e:#}");
        }
    }
}

/// Sends every report to several sinks in order
#[derive(Default)]
pub struct FanoutReporter {
    sinks: Vec<Box<dyn Reporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Reporter + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Reporter for FanoutReporter {
    fn report(&self, report: &DeadlockReport) {
        for sink in &self.sinks {
            sink.report(report);
        }
    }
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "╔{LINE}╗")?;
        writeln!(f, "║ {:^64} ║", self.kind.title())?;
        writeln!(f, "╠{LINE}╣")?;
        writeln!(f, "║ Type: {}", self.kind.description())?;
        writeln!(f, "║ Time: {}", self.timestamp)?;
        if !self.summary.is_empty() {
            writeln!(f, "║ Message: {}", self.summary)?;
        }

        for detail in &self.threads {
            writeln!(f, "╠{SEPARATOR}╣")?;
            render_detail(f, detail, self.kind)?;
        }

        if self.kind == DeadlockKind::MainThreadStall && !self.other_threads.is_empty() {
            writeln!(f, "╠{SEPARATOR}╣")?;
            writeln!(f, "║ Other Threads (top {MAX_RENDERED_OTHERS}):")?;
            for other in self.other_threads.iter().take(MAX_RENDERED_OTHERS) {
                writeln!(f, "║   - {} ({})", other.thread_name, other.state)?;
            }
        }

        write!(f, "╚{LINE}╝")
    }
}

fn render_detail(f: &mut fmt::Formatter<'_>, detail: &ThreadDetail, kind: DeadlockKind) -> fmt::Result {
    writeln!(f, "║ Thread: \"{}\" (id={})", detail.thread_name, detail.thread_id)?;
    writeln!(f, "║ State: {}", detail.state)?;

    match kind {
        DeadlockKind::ImplicitLockCycle => {
            if let Some(waiting) = &detail.waiting_for {
                write!(f, "║ Waiting for: {waiting}")?;
                if let Some(owner) = &detail.lock_owner {
                    write!(f, " (held by {})", owner.thread_name)?;
                }
                writeln!(f)?;
            }
        }
        DeadlockKind::ExplicitLockCycle => {
            if let Some(waiting) = &detail.waiting_for {
                writeln!(f, "║ Waiting for: {waiting}")?;
            }
            if !detail.held_locks.is_empty() {
                writeln!(f, "║ Holding: {}", detail.held_locks.join(", "))?;
            }
        }
        DeadlockKind::MainThreadStall => {
            if let Some(ms) = detail.blocked_for_ms.filter(|&ms| ms > 0) {
                writeln!(f, "║ Blocked for: {ms}ms")?;
            }
        }
    }

    if !detail.stack.is_empty() {
        writeln!(f, "║ Stack:")?;
        for frame in detail.stack.iter().take(MAX_RENDERED_FRAMES) {
            writeln!(f, "║   at {frame}")?;
        }
        if detail.stack.len() > MAX_RENDERED_FRAMES {
            writeln!(f, "║   ... {} more", detail.stack.len() - MAX_RENDERED_FRAMES)?;
        }
    }
    Ok(())
}
