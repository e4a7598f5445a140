//! Thread introspection
//!
//! The detectors never walk native stacks themselves. They consume a
//! [`ThreadInspector`], which lists the live threads with their coarse state and
//! captured call stack.
//!
//! [`RegistryInspector`] is the built-in implementation. It reads a
//! process-wide cooperative registry: every thread that touches lockwatch gets
//! a record holding its name, its state and a shadow call stack pushed with
//! [`enter_frame`]. Records are dropped when their thread exits.
//!
//! ```rust
//! use lockwatch::{RegistryInspector, ThreadInspector, enter_frame};
//!
//! let _frame = enter_frame("Ledger::post");
//! let me = RegistryInspector.snapshot(lockwatch::get_current_thread_id()).unwrap();
//! assert_eq!(me.stack.first().map(String::as_str), Some("Ledger::post"));
//! ```

use crate::core::types::{ThreadId, ThreadState, get_current_thread_id};
use anyhow::Result;
use dashmap::DashMap;
use fxhash::FxBuildHasher;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// One frame of a shadow call stack, usually `Type::method`
pub type Frame = Cow<'static, str>;

/// Point-in-time view of one live thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    /// Captured call stack, innermost frame first
    pub stack: Vec<String>,
}

impl ThreadSnapshot {
    /// Innermost frame of the captured stack
    pub fn top_frame(&self) -> Option<&str> {
        self.stack.first().map(String::as_str)
    }
}

/// Capability to enumerate live threads with their states and stacks
pub trait ThreadInspector: Send + Sync {
    /// Snapshot every live thread
    fn snapshot_all(&self) -> Result<Vec<ThreadSnapshot>>;

    /// Snapshot one thread, if it is alive
    fn snapshot(&self, thread_id: ThreadId) -> Option<ThreadSnapshot> {
        self.snapshot_all()
            .ok()?
            .into_iter()
            .find(|t| t.id == thread_id)
    }
}

/// Registry entry for one thread
///
/// Only the owning thread writes its state and frames; detection threads read
/// them.
#[derive(Debug)]
pub(crate) struct ThreadRecord {
    id: ThreadId,
    name: String,
    state: AtomicU8,
    frames: Mutex<Vec<Frame>>,
}

impl ThreadRecord {
    fn new(id: ThreadId, name: String) -> Self {
        ThreadRecord {
            id,
            name,
            state: AtomicU8::new(ThreadState::Runnable.as_u8()),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn replace_state(&self, state: ThreadState) -> ThreadState {
        ThreadState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel))
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn snapshot(&self) -> ThreadSnapshot {
        let stack = self
            .frames
            .lock()
            .iter()
            .rev()
            .map(|f| f.to_string())
            .collect();
        ThreadSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            stack,
        }
    }
}

/// Process-wide table of registered threads
#[derive(Default)]
struct ThreadRegistry {
    threads: DashMap<ThreadId, Arc<ThreadRecord>, FxBuildHasher>,
}

lazy_static::lazy_static! {
    static ref REGISTRY: ThreadRegistry = ThreadRegistry::default();
}

/// Removes the thread's record when its thread-local storage is torn down
struct Registration(Arc<ThreadRecord>);

impl Drop for Registration {
    fn drop(&mut self) {
        self.0.set_state(ThreadState::Terminated);
        REGISTRY.threads.remove(&self.0.id);
    }
}

thread_local! {
    static REGISTRATION: Registration = {
        let id = get_current_thread_id();
        let name = std::thread::current()
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("thread-{id}"));
        let record = Arc::new(ThreadRecord::new(id, name));
        REGISTRY.threads.insert(id, Arc::clone(&record));
        Registration(record)
    };
}

/// Run `f` against the current thread's record, registering it if needed
///
/// Returns `None` while the thread is being torn down.
pub(crate) fn with_current<R>(f: impl FnOnce(&ThreadRecord) -> R) -> Option<R> {
    REGISTRATION.try_with(|reg| f(&reg.0)).ok()
}

/// Make sure the current thread is visible to [`RegistryInspector`]
pub fn register_current_thread() {
    with_current(|_| ());
}

/// Set the current thread's coarse state
pub(crate) fn set_current_state(state: ThreadState) {
    with_current(|record| record.set_state(state));
}

/// Marks the current thread with a state until dropped, then restores the
/// state it replaced
pub(crate) struct StateGuard {
    previous: ThreadState,
}

impl StateGuard {
    pub(crate) fn enter(state: ThreadState) -> Self {
        let previous = with_current(|record| record.replace_state(state))
            .unwrap_or(ThreadState::Runnable);
        StateGuard { previous }
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        set_current_state(self.previous);
    }
}

/// Pops the frame pushed by [`enter_frame`] when dropped
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    // Frames must be popped on the thread that pushed them
    _not_send: std::marker::PhantomData<*const ()>,
}

/// Push a frame onto the current thread's shadow call stack
///
/// The frame stays on the stack until the returned guard is dropped.
pub fn enter_frame(frame: impl Into<Frame>) -> FrameGuard {
    let frame = frame.into();
    with_current(move |record| record.frames.lock().push(frame));
    FrameGuard {
        _not_send: std::marker::PhantomData,
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        with_current(|record| {
            record.frames.lock().pop();
        });
    }
}

/// [`ThreadInspector`] backed by the process-wide thread registry
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryInspector;

impl ThreadInspector for RegistryInspector {
    fn snapshot_all(&self) -> Result<Vec<ThreadSnapshot>> {
        // Clone the records out first so no shard lock is held while reading frames
        let records: Vec<Arc<ThreadRecord>> = REGISTRY
            .threads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        Ok(records.iter().map(|r| r.snapshot()).collect())
    }

    fn snapshot(&self, thread_id: ThreadId) -> Option<ThreadSnapshot> {
        let record = REGISTRY.threads.get(&thread_id).map(|r| Arc::clone(r.value()))?;
        Some(record.snapshot())
    }
}
