//! Heuristic deadlock detection over monitors
//!
//! Monitors never report acquisitions, so ownership has to be guessed from
//! thread snapshots. A thread blocked entering a critical section has that
//! section's signature as its innermost frame. Any other thread with the same
//! signature somewhere on its stack is presumed to be inside the section and
//! therefore to own it.
//!
//! Signature matching is by frame text only. Two unrelated monitors entered
//! from methods with the same name are indistinguishable, which can produce
//! edges (and cycles) that do not exist.

use crate::core::detector::deadlock_handling::{ReportSender, detail_from_snapshot, new_report};
use crate::core::graph::{WaitForGraph, threads_in_cycles};
use crate::core::introspect::{ThreadInspector, ThreadSnapshot};
use crate::core::types::{DeadlockKind, LockOwner, ThreadId, ThreadState};
use anyhow::{Context, Result};
use fxhash::FxHashMap;
use std::sync::Arc;

/// What a blocked thread is presumed to be waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PresumedWait {
    /// Innermost frame of the blocked thread
    pub signature: String,
    /// First other thread whose stack contains the signature
    pub owner: Option<ThreadId>,
}

/// Build the presumed waits-for graph from thread snapshots
///
/// Only threads in the `Blocked` state contribute edges. Every matching
/// thread becomes a target, so the graph may have several edges per thread.
pub(crate) fn build_wait_for_graph(
    threads: &[ThreadSnapshot],
) -> (WaitForGraph, FxHashMap<ThreadId, PresumedWait>) {
    let mut graph = WaitForGraph::new();
    let mut waits = FxHashMap::default();

    for blocked in threads.iter().filter(|t| t.state == ThreadState::Blocked) {
        let Some(signature) = blocked.top_frame() else {
            continue;
        };

        let mut owner = None;
        for other in threads.iter().filter(|t| t.id != blocked.id) {
            if other.stack.iter().any(|frame| frame == signature) {
                graph.add_edge(blocked.id, other.id);
                owner.get_or_insert(other.id);
            }
        }

        waits.insert(
            blocked.id,
            PresumedWait {
                signature: signature.to_string(),
                owner,
            },
        );
    }

    (graph, waits)
}

/// Log every monitor-blocked thread when two or more are blocked at once
///
/// Fires whether or not their waits form a cycle. Returns the number of
/// blocked threads.
pub(crate) fn warn_blocked_threads(threads: &[ThreadSnapshot]) -> usize {
    let blocked: Vec<&ThreadSnapshot> = threads
        .iter()
        .filter(|t| t.state == ThreadState::Blocked)
        .collect();
    if blocked.len() < 2 {
        return blocked.len();
    }

    tracing::warn!(
        target: "lockwatch",
        blocked = blocked.len(),
        "multiple threads blocked on monitors"
    );
    for thread in &blocked {
        tracing::warn!(
            target: "lockwatch",
            name = %thread.name,
            id = thread.id,
            top_frame = thread.top_frame().unwrap_or("<empty stack>"),
            "blocked thread"
        );
    }
    blocked.len()
}

/// Periodic heuristic search for cycles among monitor-blocked threads
pub struct ImplicitLockDetector {
    inspector: Arc<dyn ThreadInspector>,
    reports: ReportSender,
}

impl ImplicitLockDetector {
    pub fn new(inspector: Arc<dyn ThreadInspector>, reports: ReportSender) -> Self {
        ImplicitLockDetector { inspector, reports }
    }

    pub fn detect(&self) -> Result<Option<Vec<Vec<ThreadId>>>> {
        let threads = self
            .inspector
            .snapshot_all()
            .context("Failed to snapshot threads")?;

        warn_blocked_threads(&threads);

        let (graph, waits) = build_wait_for_graph(&threads);
        if graph.is_empty() {
            return Ok(None);
        }

        let cycles = graph.find_cycles();
        if cycles.is_empty() {
            return Ok(None);
        }

        let by_id: FxHashMap<ThreadId, &ThreadSnapshot> =
            threads.iter().map(|t| (t.id, t)).collect();

        let details = threads_in_cycles(&cycles)
            .into_iter()
            .filter_map(|id| by_id.get(&id))
            .map(|snapshot| {
                let mut detail = detail_from_snapshot(snapshot);
                if let Some(wait) = waits.get(&snapshot.id) {
                    detail.waiting_for = Some(wait.signature.clone());
                    detail.lock_owner = wait.owner.and_then(|owner| {
                        by_id.get(&owner).map(|t| LockOwner {
                            thread_id: t.id,
                            thread_name: t.name.clone(),
                        })
                    });
                }
                detail
            })
            .collect();

        let report = new_report(
            DeadlockKind::ImplicitLockCycle,
            format!("Detected {} implicit lock cycle(s)", cycles.len()),
            cycles.clone(),
            details,
            Vec::new(),
        );
        self.reports.send(report)?;
        Ok(Some(cycles))
    }
}
