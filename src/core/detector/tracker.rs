//! Live lock state fed by tracked mutexes
//!
//! Tracked mutexes call into a [`LockTracker`] inline, from the application
//! threads, around every acquisition and release. The tracker keeps two maps
//! keyed by thread:
//!
//! - *waiters*: the lock a thread is currently blocked on (at most one)
//! - *holdings*: the set of locks a thread currently holds
//!
//! Each thread only writes its own entries, so the maps are sharded concurrent
//! maps rather than one big lock. The detection thread reads them without
//! stopping the world; a torn snapshot costs at most one tick.

use crate::core::types::{LockId, ThreadId};
use dashmap::DashMap;
use fxhash::{FxBuildHasher, FxHashMap, FxHashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared state behind explicit-lock deadlock detection
#[derive(Debug)]
pub struct LockTracker {
    /// Maps threads to the lock they are blocked acquiring
    waiters: DashMap<ThreadId, LockId, FxBuildHasher>,
    /// Tracks, for each thread, which locks it currently holds
    holdings: DashMap<ThreadId, FxHashSet<LockId>, FxBuildHasher>,
    /// Names of every lock ever registered; append-only while active
    locks: DashMap<LockId, Arc<str>, FxBuildHasher>,
    /// Cleared on teardown so outstanding locks stop reporting
    active: AtomicBool,
}

impl Default for LockTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTracker {
    pub fn new() -> Self {
        LockTracker {
            waiters: DashMap::default(),
            holdings: DashMap::default(),
            locks: DashMap::default(),
            active: AtomicBool::new(true),
        }
    }

    /// Whether callbacks are still being recorded
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Register a lock so reports can name it
    pub fn register_lock(&self, lock_id: LockId, name: Arc<str>) {
        if self.is_active() {
            self.locks.insert(lock_id, name);
        }
    }

    /// Name a registered lock was given
    pub fn lock_name(&self, lock_id: LockId) -> Option<Arc<str>> {
        self.locks.get(&lock_id).map(|n| Arc::clone(n.value()))
    }

    /// Number of registered locks
    pub fn tracked_lock_count(&self) -> usize {
        self.locks.len()
    }

    /// A thread is about to block acquiring `lock_id`
    ///
    /// Overwrites any stale entry: a thread waits for one lock at a time.
    pub fn on_lock_attempt(&self, thread_id: ThreadId, lock_id: LockId) {
        if self.is_active() {
            self.waiters.insert(thread_id, lock_id);
        }
    }

    /// A thread acquired `lock_id`
    pub fn on_lock_acquired(&self, thread_id: ThreadId, lock_id: LockId) {
        if !self.is_active() {
            return;
        }
        self.waiters.remove(&thread_id);
        self.holdings.entry(thread_id).or_default().insert(lock_id);
    }

    /// An acquisition attempt failed, timed out or was interrupted
    pub fn on_lock_failed(&self, thread_id: ThreadId, _lock_id: LockId) {
        if self.is_active() {
            self.waiters.remove(&thread_id);
        }
    }

    /// A thread released `lock_id`
    pub fn on_lock_release(&self, thread_id: ThreadId, lock_id: LockId) {
        if !self.is_active() {
            return;
        }
        let now_empty = match self.holdings.get_mut(&thread_id) {
            Some(mut held) => {
                held.remove(&lock_id);
                held.is_empty()
            }
            None => false,
        };
        // The shard guard above is gone; removing now cannot self-deadlock
        if now_empty {
            self.holdings.remove_if(&thread_id, |_, held| held.is_empty());
        }
    }

    /// Lock the thread is currently blocked on
    pub fn waiting_for(&self, thread_id: ThreadId) -> Option<LockId> {
        self.waiters.get(&thread_id).map(|l| *l.value())
    }

    /// Locks the thread currently holds
    pub fn held_by(&self, thread_id: ThreadId) -> FxHashSet<LockId> {
        self.holdings
            .get(&thread_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Whether the thread has a holdings entry at all
    pub fn has_holdings_entry(&self, thread_id: ThreadId) -> bool {
        self.holdings.contains_key(&thread_id)
    }

    /// Copy of every (waiting thread, awaited lock) pair
    pub(crate) fn waiters_snapshot(&self) -> Vec<(ThreadId, LockId)> {
        self.waiters.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// Index from lock to the thread holding it
    pub(crate) fn owner_index(&self) -> FxHashMap<LockId, ThreadId> {
        let mut owners = FxHashMap::default();
        for entry in self.holdings.iter() {
            for &lock_id in entry.value() {
                owners.insert(lock_id, *entry.key());
            }
        }
        owners
    }

    /// Build the waits-for graph for this instant
    ///
    /// Waiters whose lock has no current holder get no edge.
    pub fn build_wait_for_graph(&self) -> FxHashMap<ThreadId, ThreadId> {
        let owners = self.owner_index();
        self.waiters_snapshot()
            .into_iter()
            .filter_map(|(waiter, lock_id)| owners.get(&lock_id).map(|&holder| (waiter, holder)))
            .collect()
    }

    /// Forget everything and stop recording
    pub fn teardown(&self) {
        self.active.store(false, Ordering::Release);
        self.waiters.clear();
        self.holdings.clear();
        self.locks.clear();
    }
}
