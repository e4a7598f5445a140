//! The detectors run on every detection tick
//!
//! [`Detector`] is a closed set: explicit lock cycles found from tracker
//! bookkeeping, implicit cycles guessed from monitor-blocked thread stacks,
//! and stalls of a critical thread found through heartbeats.

pub mod deadlock_handling;
pub mod explicit;
pub mod implicit;
pub mod stall;
pub mod tracker;

pub use explicit::ExplicitLockDetector;
pub use implicit::ImplicitLockDetector;
pub use stall::{CriticalThread, StallDetector, Task};
pub use tracker::LockTracker;

use anyhow::Result;

/// One enabled detector
pub enum Detector {
    ExplicitLock(ExplicitLockDetector),
    ImplicitLock(ImplicitLockDetector),
    Stall(StallDetector),
}

impl Detector {
    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Detector::ExplicitLock(_) => "explicit-lock",
            Detector::ImplicitLock(_) => "implicit-lock",
            Detector::Stall(_) => "stall",
        }
    }

    /// Run one detection pass
    pub fn detect(&self) -> Result<()> {
        match self {
            Detector::ExplicitLock(d) => d.detect().map(drop),
            Detector::ImplicitLock(d) => d.detect().map(drop),
            Detector::Stall(d) => d.detect(),
        }
    }

    /// Release whatever the detector holds
    pub fn teardown(&self) {
        match self {
            Detector::ExplicitLock(d) => d.teardown(),
            Detector::ImplicitLock(_) => {}
            Detector::Stall(d) => d.teardown(),
        }
    }

    /// The lock tracker, for the explicit lock detector
    pub fn tracker(&self) -> Option<&std::sync::Arc<LockTracker>> {
        match self {
            Detector::ExplicitLock(d) => Some(d.tracker()),
            _ => None,
        }
    }
}
