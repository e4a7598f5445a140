//! Monitors: critical sections without acquisition hooks
//!
//! A [`Monitor`] is the analogue of a built-in, non-instrumentable lock. It
//! never reports to a tracker. The only trace it leaves is the entering
//! thread's state: while a thread is blocked entering a monitor it is marked
//! `BLOCKED` in the thread registry, and its shadow stack shows where it is
//! trying to enter. That is all the monitor heuristic gets to work with.
//!
//! ```rust
//! use lockwatch::{Monitor, enter_frame};
//!
//! let accounts = Monitor::new(vec![100, 50]);
//!
//! let _frame = enter_frame("Bank::transfer");
//! let mut balances = accounts.enter();
//! balances[0] -= 10;
//! balances[1] += 10;
//! ```

use crate::core::introspect::StateGuard;
use crate::core::types::ThreadState;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Mutual exclusion that is only observable through thread state
#[derive(Default)]
pub struct Monitor<T> {
    inner: Mutex<T>,
}

/// Guard returned by [`Monitor::enter`]
pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Monitor<T> {
    pub fn new(value: T) -> Self {
        Monitor {
            inner: Mutex::new(value),
        }
    }

    /// Enter the monitor, blocking while another thread is inside
    pub fn enter(&self) -> MonitorGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            return MonitorGuard { guard };
        }
        let _blocked = StateGuard::enter(ThreadState::Blocked);
        MonitorGuard {
            guard: self.inner.lock(),
        }
    }

    /// Enter the monitor only if it is free
    pub fn try_enter(&self) -> Option<MonitorGuard<'_, T>> {
        self.inner.try_lock().map(|guard| MonitorGuard { guard })
    }

    /// Run `f` inside the monitor
    pub fn synchronized<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.enter();
        f(&mut guard)
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}
