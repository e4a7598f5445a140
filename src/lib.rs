//! # lockwatch
//!
//! A runtime deadlock and stall detector for multithreaded applications.
//!
//! lockwatch runs a background detection thread that periodically looks for
//! three kinds of trouble:
//!
//! - **Explicit lock cycles**: threads blocked on each other through
//!   [`TrackedMutex`]es, found exactly from acquisition bookkeeping
//! - **Implicit lock cycles**: threads blocked on each other through
//!   [`Monitor`]s, guessed from thread states and shadow call stacks
//! - **Stalls**: a critical thread (usually an event loop) that stopped
//!   running the heartbeats posted to it
//!
//! Findings are delivered to a [`Reporter`] as [`DeadlockReport`]s. The host
//! process is never aborted.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lockwatch::{DetectorConfig, LockWatch};
//!
//! let scheduler = LockWatch::new(DetectorConfig::default())
//!     .callback(|report| eprintln!("{report}"))
//!     .start()
//!     .expect("failed to start lockwatch");
//!
//! let accounts = scheduler.create_tracked_lock("accounts", vec![0u64; 4], false);
//! accounts.lock()[0] += 10;
//!
//! scheduler.stop();
//! ```

mod core;
pub use core::{
    ConfigError, CriticalThread, DeadlockKind, DeadlockReport, DetectionScheduler, DetectorConfig,
    EventLoop, EventLoopHandle, FanoutReporter, FrameGuard, InterruptFlag, JsonLinesReporter,
    LockInterrupted, LockOwner, LockWatch, LogReporter, Monitor, MonitorGuard, RegistryInspector,
    Reporter, Task, ThreadDetail, ThreadInspector, ThreadSnapshot, ThreadState, TrackedCondvar,
    TrackedMutex, TrackedMutexGuard, enter_frame,
    detector::LockTracker,
    introspect::register_current_thread,
    thread,
    types::{LockId, ThreadId, get_current_thread_id},
};

/// Waits-for graph and cycle search
pub mod graph {
    pub use crate::core::graph::{WaitForGraph, detect_cycles, detect_cycles_multi, threads_in_cycles};
}
