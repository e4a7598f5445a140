use crate::core::introspect::StateGuard;
use crate::core::locks::mutex::{TrackedMutex, TrackedMutexGuard};
use crate::core::types::ThreadState;
use parking_lot::Condvar as ParkingLotCondvar;
use std::time::Duration;

/// A condition variable derived from a [`TrackedMutex`]
///
/// Waiting atomically releases the mutex and reacquires it before returning.
/// The condvar reports that release before the wait and the reacquisition
/// after it, so the tracker never believes a waiting thread still holds the
/// mutex. The waiting thread shows up as `WAITING` (or `TIMED_WAITING`) to
/// the thread inspector.
///
/// # Example
///
/// ```rust
/// use lockwatch::TrackedMutex;
/// use std::sync::Arc;
/// use std::thread;
///
/// let mutex = Arc::new(TrackedMutex::untracked("ready", false));
/// let cvar = Arc::new(mutex.new_condition());
///
/// let (m2, c2) = (Arc::clone(&mutex), Arc::clone(&cvar));
/// thread::spawn(move || {
///     *m2.lock() = true;
///     c2.notify_one();
/// });
///
/// let mut ready = mutex.lock();
/// while !*ready {
///     cvar.wait(&mut ready);
/// }
/// ```
#[derive(Debug, Default)]
pub struct TrackedCondvar {
    /// The wrapped parking_lot condition variable
    inner: ParkingLotCondvar,
}

impl<T> TrackedMutex<T> {
    /// Derive a condition variable to be used with this mutex
    pub fn new_condition(&self) -> TrackedCondvar {
        TrackedCondvar::new()
    }
}

impl TrackedCondvar {
    pub fn new() -> Self {
        TrackedCondvar {
            inner: ParkingLotCondvar::new(),
        }
    }

    /// Block until notified, releasing the guard's mutex while waiting
    pub fn wait<T>(&self, guard: &mut TrackedMutexGuard<'_, T>) {
        let _state = StateGuard::enter(ThreadState::Waiting);
        self.report_release(guard);
        self.inner.wait(guard.inner_guard());
        self.report_reacquire(guard);
    }

    /// Block until notified or until `timeout` elapses
    ///
    /// # Returns
    /// `true` if the wait timed out
    pub fn wait_for<T>(&self, guard: &mut TrackedMutexGuard<'_, T>, timeout: Duration) -> bool {
        let _state = StateGuard::enter(ThreadState::TimedWaiting);
        self.report_release(guard);
        let result = self.inner.wait_for(guard.inner_guard(), timeout);
        self.report_reacquire(guard);
        result.timed_out()
    }

    /// Wake up one waiting thread
    pub fn notify_one(&self) -> bool {
        self.inner.notify_one()
    }

    /// Wake up all waiting threads
    pub fn notify_all(&self) -> usize {
        self.inner.notify_all()
    }

    fn report_release<T>(&self, guard: &TrackedMutexGuard<'_, T>) {
        let mutex = guard.mutex();
        if let Some(tracker) = mutex.tracker() {
            tracker.on_lock_release(guard.thread_id(), mutex.id());
        }
    }

    // The blocking reacquisition inside the wait is not observable, so only
    // its success is reported.
    fn report_reacquire<T>(&self, guard: &TrackedMutexGuard<'_, T>) {
        let mutex = guard.mutex();
        if let Some(tracker) = mutex.tracker() {
            tracker.on_lock_acquired(guard.thread_id(), mutex.id());
        }
    }
}
