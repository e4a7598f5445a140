//! Deadlock detection over tracked mutexes

use crate::core::detector::deadlock_handling::{
    ReportSender, detail_from_snapshot, detail_without_snapshot, new_report,
};
use crate::core::detector::tracker::LockTracker;
use crate::core::graph::{detect_cycles, threads_in_cycles};
use crate::core::introspect::{ThreadInspector, ThreadSnapshot};
use crate::core::types::{DeadlockKind, DeadlockReport, ThreadDetail, ThreadId};
use anyhow::Result;
use fxhash::FxHashMap;
use std::sync::Arc;

/// Periodic cycle search over the state kept by a [`LockTracker`]
pub struct ExplicitLockDetector {
    tracker: Arc<LockTracker>,
    inspector: Arc<dyn ThreadInspector>,
    reports: ReportSender,
}

impl ExplicitLockDetector {
    pub fn new(
        tracker: Arc<LockTracker>,
        inspector: Arc<dyn ThreadInspector>,
        reports: ReportSender,
    ) -> Self {
        ExplicitLockDetector {
            tracker,
            inspector,
            reports,
        }
    }

    /// The tracker tracked mutexes should report to
    pub fn tracker(&self) -> &Arc<LockTracker> {
        &self.tracker
    }

    /// Run one detection pass
    ///
    /// Builds the waits-for graph from the current waiters and holders, finds
    /// its cycles and emits a single report covering all of them.
    pub fn detect(&self) -> Result<Option<Vec<Vec<ThreadId>>>> {
        let graph = self.tracker.build_wait_for_graph();
        if graph.is_empty() {
            return Ok(None);
        }

        let cycles = detect_cycles(&graph);
        if cycles.is_empty() {
            return Ok(None);
        }

        let report = self.build_report(&cycles);
        self.reports.send(report)?;
        Ok(Some(cycles))
    }

    fn build_report(&self, cycles: &[Vec<ThreadId>]) -> DeadlockReport {
        // One snapshot per report, so every detail describes the same moment
        let snapshots: FxHashMap<ThreadId, ThreadSnapshot> = match self.inspector.snapshot_all() {
            Ok(all) => all.into_iter().map(|t| (t.id, t)).collect(),
            Err(e) => {
                tracing::warn!(
                    target: "lockwatch",
                    "thread snapshot failed, reporting without stacks: {e:#}"
                );
                FxHashMap::default()
            }
        };

        let threads = threads_in_cycles(cycles)
            .into_iter()
            .map(|thread_id| self.thread_detail(thread_id, snapshots.get(&thread_id)))
            .collect();

        new_report(
            DeadlockKind::ExplicitLockCycle,
            format!("Detected {} explicit lock cycle(s)", cycles.len()),
            cycles.to_vec(),
            threads,
            Vec::new(),
        )
    }

    fn thread_detail(&self, thread_id: ThreadId, snapshot: Option<&ThreadSnapshot>) -> ThreadDetail {
        let mut detail = match snapshot {
            Some(snapshot) => detail_from_snapshot(snapshot),
            None => detail_without_snapshot(thread_id),
        };

        detail.waiting_for = self
            .tracker
            .waiting_for(thread_id)
            .map(|lock_id| self.lock_label(lock_id));

        let mut held: Vec<String> = self
            .tracker
            .held_by(thread_id)
            .into_iter()
            .map(|lock_id| self.lock_label(lock_id))
            .collect();
        held.sort();
        detail.held_locks = held;
        detail
    }

    fn lock_label(&self, lock_id: usize) -> String {
        match self.tracker.lock_name(lock_id) {
            Some(name) => name.to_string(),
            None => format!("lock-{lock_id}"),
        }
    }

    /// Forget all tracked state; outstanding mutexes stop reporting
    pub fn teardown(&self) {
        self.tracker.teardown();
    }
}
