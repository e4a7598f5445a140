use crate::core::introspect::ThreadSnapshot;
use crate::core::reporter::Reporter;
use crate::core::types::{DeadlockKind, DeadlockReport, ThreadDetail, ThreadId, ThreadState};
use crate::core::utils::join_with_timeout;
use anyhow::{Result, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Background dispatcher for report delivery
///
/// Runs a dedicated thread that receives reports through a channel and hands
/// them to the sink. Detection threads only ever enqueue, so a sink that
/// blocks or panics never reaches them.
pub(crate) struct Dispatcher {
    /// Channel sender for transmitting reports
    sender: ReportSender,
    /// Background thread handle
    thread_handle: JoinHandle<()>,
}

/// Cloneable handle detectors use to emit reports
#[derive(Clone)]
pub struct ReportSender {
    sender: Sender<DeadlockReport>,
}

impl ReportSender {
    /// Queue a report for the sink
    pub fn send(&self, report: DeadlockReport) -> Result<()> {
        self.sender
            .send(report)
            .map_err(|_| anyhow!("report dispatcher has shut down"))
    }

    /// A sender paired with a receiver, for tests
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, Receiver<DeadlockReport>) {
        let (sender, rx) = unbounded();
        (ReportSender { sender }, rx)
    }
}

impl Dispatcher {
    /// Create a new dispatcher with a background thread and channel
    pub(crate) fn new(sink: Arc<dyn Reporter>) -> Result<Self> {
        let (tx, rx) = unbounded::<DeadlockReport>();

        let thread_handle = std::thread::Builder::new()
            .name("lockwatch-reporter".into())
            .spawn(move || deliver(rx, sink))?;

        Ok(Dispatcher {
            sender: ReportSender { sender: tx },
            thread_handle,
        })
    }

    pub(crate) fn sender(&self) -> ReportSender {
        self.sender.clone()
    }

    /// Drain queued reports and stop the thread
    ///
    /// The thread exits once every [`ReportSender`] is gone; waiting is
    /// bounded by `timeout`.
    pub(crate) fn shutdown(self, timeout: Duration) -> bool {
        drop(self.sender);
        join_with_timeout(self.thread_handle, timeout)
    }
}

fn deliver(rx: Receiver<DeadlockReport>, sink: Arc<dyn Reporter>) {
    while let Ok(report) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(|| sink.report(&report))).is_err() {
            tracing::error!(target: "lockwatch", kind = ?report.kind, "reporter panicked while handling a report");
        }
    }
}

/// Build a report stamped with the current time
pub(crate) fn new_report(
    kind: DeadlockKind,
    summary: String,
    cycles: Vec<Vec<ThreadId>>,
    threads: Vec<ThreadDetail>,
    other_threads: Vec<ThreadDetail>,
) -> DeadlockReport {
    DeadlockReport {
        kind,
        timestamp: Utc::now().to_rfc3339(),
        summary,
        cycles,
        threads,
        other_threads,
    }
}

/// Plain detail of a thread from its snapshot
pub(crate) fn detail_from_snapshot(snapshot: &ThreadSnapshot) -> ThreadDetail {
    ThreadDetail {
        thread_id: snapshot.id,
        thread_name: snapshot.name.clone(),
        state: snapshot.state,
        waiting_for: None,
        lock_owner: None,
        held_locks: Vec::new(),
        stack: snapshot.stack.clone(),
        blocked_for_ms: None,
    }
}

/// Detail for a thread the inspector does not know about
pub(crate) fn detail_without_snapshot(thread_id: ThreadId) -> ThreadDetail {
    ThreadDetail {
        thread_id,
        thread_name: format!("thread-{thread_id}"),
        state: ThreadState::Unknown,
        waiting_for: None,
        lock_owner: None,
        held_locks: Vec::new(),
        stack: Vec::new(),
        blocked_for_ms: None,
    }
}
