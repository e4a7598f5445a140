use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread identifier type
///
/// Uniquely identifies a thread in the application. Only equality and hashing
/// are meaningful.
pub type ThreadId = usize;

// Global counter for assigning unique thread IDs
static THREAD_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

// Thread-local storage for each thread's assigned ID
thread_local! {
    static THREAD_ID: ThreadId = {
        // Each thread gets a unique ID once, when this is first accessed
        THREAD_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    };
}

/// Get a unique identifier of the current thread
/// This will always return the same ID for the lifetime of the thread
pub fn get_current_thread_id() -> ThreadId {
    THREAD_ID.with(|&id| id)
}

/// Lock identifier type
///
/// Uniquely identifies a tracked lock in the application. Each TrackedMutex
/// is assigned a unique ID when created or wrapped.
pub type LockId = usize;

/// Coarse thread state as seen by the introspection layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    /// Executing or ready to execute
    Runnable,
    /// Blocked trying to enter a critical section (monitor)
    Blocked,
    /// Waiting indefinitely (condition variable, park)
    Waiting,
    /// Waiting with a timeout
    TimedWaiting,
    /// The thread has finished
    Terminated,
    /// The state could not be determined
    Unknown,
}

impl ThreadState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ThreadState::Runnable => 0,
            ThreadState::Blocked => 1,
            ThreadState::Waiting => 2,
            ThreadState::TimedWaiting => 3,
            ThreadState::Terminated => 4,
            ThreadState::Unknown => 5,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Runnable,
            1 => ThreadState::Blocked,
            2 => ThreadState::Waiting,
            3 => ThreadState::TimedWaiting,
            4 => ThreadState::Terminated,
            _ => ThreadState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::Waiting => "WAITING",
            ThreadState::TimedWaiting => "TIMED_WAITING",
            ThreadState::Terminated => "TERMINATED",
            ThreadState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of condition a report describes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockKind {
    /// Cycle among tracked (explicit) locks
    ExplicitLockCycle,
    /// Cycle inferred among monitors (implicit locks) from thread stacks
    ImplicitLockCycle,
    /// The critical thread stopped processing its heartbeat
    MainThreadStall,
}

impl DeadlockKind {
    /// Human-readable description of the kind
    pub fn description(self) -> &'static str {
        match self {
            DeadlockKind::ExplicitLockCycle => "Explicit Lock Deadlock",
            DeadlockKind::ImplicitLockCycle => "Implicit Lock Deadlock",
            DeadlockKind::MainThreadStall => "Application Not Responding",
        }
    }

    /// Headline used when rendering a report
    pub fn title(self) -> &'static str {
        match self {
            DeadlockKind::ExplicitLockCycle | DeadlockKind::ImplicitLockCycle => {
                "DEADLOCK DETECTED!"
            }
            DeadlockKind::MainThreadStall => "ANR DETECTED!",
        }
    }
}

/// The presumed owner of a monitor a blocked thread is trying to enter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub thread_id: ThreadId,
    pub thread_name: String,
}

/// Snapshot of one thread taken while building a report
///
/// Created once at report-build time and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadDetail {
    pub thread_id: ThreadId,
    pub thread_name: String,
    pub state: ThreadState,

    /// Lock (explicit) or critical-section signature (implicit) being awaited
    pub waiting_for: Option<String>,

    /// Thread presumed to hold what `waiting_for` names (implicit cycles only)
    pub lock_owner: Option<LockOwner>,

    /// Names of the tracked locks held by the thread
    pub held_locks: Vec<String>,

    /// Captured call stack, innermost frame first
    pub stack: Vec<String>,

    /// How long the thread has been blocked (stall reports only)
    pub blocked_for_ms: Option<u64>,
}

/// Structured result of a detection
///
/// This is what the reporter sink receives. One report covers every cycle
/// found by a detector in a single tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadlockReport {
    pub kind: DeadlockKind,

    /// RFC 3339 timestamp of when the report was built
    pub timestamp: String,

    /// Free-text summary
    pub summary: String,

    /// Cycles found, each ordered along the wait chain
    pub cycles: Vec<Vec<ThreadId>>,

    /// Threads implicated in the condition
    pub threads: Vec<ThreadDetail>,

    /// Every other live thread (stall reports only)
    pub other_threads: Vec<ThreadDetail>,
}

impl DeadlockReport {
    /// Look up the detail of an implicated thread
    pub fn thread(&self, thread_id: ThreadId) -> Option<&ThreadDetail> {
        self.threads.iter().find(|t| t.thread_id == thread_id)
    }

    /// Whether the report names the given thread among the implicated ones
    pub fn involves(&self, thread_id: ThreadId) -> bool {
        self.thread(thread_id).is_some()
    }
}
