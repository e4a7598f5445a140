use crate::core::detector::tracker::LockTracker;
use crate::core::introspect::StateGuard;
use crate::core::locks::NEXT_LOCK_ID;
use crate::core::types::{LockId, ThreadId, ThreadState, get_current_thread_id};
use parking_lot::lock_api::{self, RawMutexFair, RawMutexTimed};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Slice used by interruptible acquisition between interrupt checks
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// A wrapper around a mutex that reports lock operations for deadlock detection
///
/// `TrackedMutex` offers the interface of an ordinary mutex. Around every
/// acquisition it tells its [`LockTracker`] that the calling thread is about to
/// wait, and then whether it got the lock or gave up; after every release it
/// reports the release. Mutual exclusion itself is entirely the wrapped
/// mutex's job: the wrapper adds no synchronization of its own.
///
/// A mutex created without a tracker behaves exactly like the wrapped one and
/// reports nothing.
///
/// # Example
///
/// ```rust
/// use lockwatch::TrackedMutex;
/// use std::sync::Arc;
/// use std::thread;
///
/// let mutex = Arc::new(TrackedMutex::untracked("counter", 0));
/// let mutex_clone = Arc::clone(&mutex);
///
/// thread::spawn(move || {
///     *mutex_clone.lock() += 1;
/// })
/// .join()
/// .unwrap();
///
/// assert_eq!(*mutex.lock(), 1);
/// ```
pub struct TrackedMutex<T, R: RawMutexFair = parking_lot::RawMutex> {
    /// Unique identifier for this mutex
    id: LockId,
    /// Name used in reports
    name: Arc<str>,
    /// Release with a fair unlock
    fair: bool,
    /// Observer of lock events; `None` for an uninstrumented fallback
    tracker: Option<Arc<LockTracker>>,
    /// The wrapped mutex
    inner: lock_api::Mutex<R, T>,
}

/// Guard for a TrackedMutex, reports the release after unlocking
pub struct TrackedMutexGuard<'a, T, R: RawMutexFair = parking_lot::RawMutex> {
    /// Thread that owns this guard
    thread_id: ThreadId,
    /// Mutex this guard is for
    mutex: &'a TrackedMutex<T, R>,
    /// The inner guard, unlocked by hand in `Drop`
    guard: ManuallyDrop<lock_api::MutexGuard<'a, R, T>>,
}

/// Returned when an interruptible acquisition is interrupted
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("interrupted while waiting for lock")]
pub struct LockInterrupted;

/// Cancellation token for [`TrackedMutex::lock_interruptible`]
///
/// Interrupting a flag wakes any waiter polling it; the waiter that observes
/// the interrupt clears it.
#[derive(Debug, Default, Clone)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether an interrupt is pending
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consume a pending interrupt
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// An acquisition in progress
///
/// Dropping it without calling [`PendingAcquire::acquired`] reports a failed
/// attempt, which also covers the wrapped mutex unwinding out of `lock`.
struct PendingAcquire<'a> {
    tracker: Option<&'a LockTracker>,
    thread_id: ThreadId,
    lock_id: LockId,
}

impl<'a> PendingAcquire<'a> {
    fn begin(tracker: Option<&'a LockTracker>, lock_id: LockId) -> Self {
        let thread_id = get_current_thread_id();
        if let Some(tracker) = tracker {
            tracker.on_lock_attempt(thread_id, lock_id);
        }
        PendingAcquire {
            tracker,
            thread_id,
            lock_id,
        }
    }

    fn acquired(mut self) -> ThreadId {
        if let Some(tracker) = self.tracker.take() {
            tracker.on_lock_acquired(self.thread_id, self.lock_id);
        }
        self.thread_id
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker {
            tracker.on_lock_failed(self.thread_id, self.lock_id);
        }
    }
}

impl<T> TrackedMutex<T> {
    /// Create an uninstrumented mutex
    ///
    /// It has an id and a name but reports to no tracker.
    pub fn untracked(name: impl Into<Arc<str>>, value: T) -> Self {
        Self::wrap(lock_api::Mutex::new(value), name, None)
    }
}

impl<T, R: RawMutexFair> TrackedMutex<T, R> {
    /// Wrap an existing mutex
    ///
    /// # Arguments
    /// * `inner` - The mutex to instrument
    /// * `name` - Name used in reports
    /// * `tracker` - Observer of lock events, `None` for no instrumentation
    pub fn wrap(
        inner: lock_api::Mutex<R, T>,
        name: impl Into<Arc<str>>,
        tracker: Option<Arc<LockTracker>>,
    ) -> Self {
        let id = NEXT_LOCK_ID.fetch_add(1, Ordering::SeqCst);
        let name = name.into();
        if let Some(tracker) = &tracker {
            tracker.register_lock(id, Arc::clone(&name));
        }
        TrackedMutex {
            id,
            name,
            fair: false,
            tracker,
            inner,
        }
    }

    /// Create a tracked mutex around a fresh delegate
    ///
    /// A fair mutex hands the lock over with a fair unlock on every release.
    pub fn new_tracked(
        name: impl Into<Arc<str>>,
        value: T,
        fair: bool,
        tracker: Option<Arc<LockTracker>>,
    ) -> Self {
        let mut mutex = Self::wrap(lock_api::Mutex::new(value), name, tracker);
        mutex.fair = fair;
        mutex
    }

    /// Get the ID of this mutex
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Get the name this mutex reports under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether releases use a fair unlock
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Whether lock events are being reported
    pub fn is_tracked(&self) -> bool {
        self.tracker.as_ref().is_some_and(|t| t.is_active())
    }

    fn guard<'a>(
        &'a self,
        thread_id: ThreadId,
        guard: lock_api::MutexGuard<'a, R, T>,
    ) -> TrackedMutexGuard<'a, T, R> {
        TrackedMutexGuard {
            thread_id,
            mutex: self,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Acquire the lock, blocking the current thread until it is available
    ///
    /// The attempt is reported before blocking so a detection tick running
    /// while this thread waits sees the wait-for edge. While blocked the
    /// thread is `WAITING` to the thread inspector.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lockwatch::TrackedMutex;
    ///
    /// let mutex = TrackedMutex::untracked("answer", 42);
    /// {
    ///     let guard = mutex.lock();
    ///     assert_eq!(*guard, 42);
    /// } // lock is released when guard goes out of scope
    /// ```
    pub fn lock(&self) -> TrackedMutexGuard<'_, T, R> {
        let pending = PendingAcquire::begin(self.tracker.as_deref(), self.id);
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                let _waiting = StateGuard::enter(ThreadState::Waiting);
                self.inner.lock()
            }
        };
        let thread_id = pending.acquired();
        self.guard(thread_id, guard)
    }

    /// Try to acquire the lock without blocking
    ///
    /// # Returns
    /// Some(guard) if the lock was acquired, None if it was already held
    pub fn try_lock(&self) -> Option<TrackedMutexGuard<'_, T, R>> {
        let pending = PendingAcquire::begin(self.tracker.as_deref(), self.id);
        let guard = self.inner.try_lock()?;
        let thread_id = pending.acquired();
        Some(self.guard(thread_id, guard))
    }

    /// Returns a mutable reference to the underlying data
    ///
    /// The mutable borrow statically guarantees no locks exist, so nothing
    /// is reported.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consumes this mutex, returning the underlying data
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T, R: RawMutexFair + RawMutexTimed> TrackedMutex<T, R> {
    /// Try to acquire the lock, giving up after `timeout`
    ///
    /// A timeout is reported as a failed attempt.
    pub fn try_lock_for(&self, timeout: R::Duration) -> Option<TrackedMutexGuard<'_, T, R>> {
        let pending = PendingAcquire::begin(self.tracker.as_deref(), self.id);
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                let _waiting = StateGuard::enter(ThreadState::TimedWaiting);
                self.inner.try_lock_for(timeout)?
            }
        };
        let thread_id = pending.acquired();
        Some(self.guard(thread_id, guard))
    }

    /// Try to acquire the lock until `deadline`
    pub fn try_lock_until(&self, deadline: R::Instant) -> Option<TrackedMutexGuard<'_, T, R>> {
        let pending = PendingAcquire::begin(self.tracker.as_deref(), self.id);
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                let _waiting = StateGuard::enter(ThreadState::TimedWaiting);
                self.inner.try_lock_until(deadline)?
            }
        };
        let thread_id = pending.acquired();
        Some(self.guard(thread_id, guard))
    }
}

impl<T, R> TrackedMutex<T, R>
where
    R: RawMutexFair + RawMutexTimed<Duration = Duration, Instant = Instant>,
{
    /// Acquire the lock unless `interrupt` is raised while waiting
    ///
    /// An interrupt pending on entry fails immediately. Observing the
    /// interrupt clears it.
    pub fn lock_interruptible(
        &self,
        interrupt: &InterruptFlag,
    ) -> Result<TrackedMutexGuard<'_, T, R>, LockInterrupted> {
        let pending = PendingAcquire::begin(self.tracker.as_deref(), self.id);
        if interrupt.take() {
            return Err(LockInterrupted);
        }
        if let Some(guard) = self.inner.try_lock() {
            let thread_id = pending.acquired();
            return Ok(self.guard(thread_id, guard));
        }
        let _waiting = StateGuard::enter(ThreadState::Waiting);
        loop {
            if interrupt.take() {
                return Err(LockInterrupted);
            }
            if let Some(guard) = self.inner.try_lock_for(INTERRUPT_POLL) {
                let thread_id = pending.acquired();
                return Ok(self.guard(thread_id, guard));
            }
        }
    }
}

impl<T, R: RawMutexFair> Drop for TrackedMutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: the inner guard is taken exactly once, here, and never used again
        let guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        if self.mutex.fair {
            lock_api::MutexGuard::unlock_fair(guard);
        } else {
            drop(guard);
        }
        if let Some(tracker) = &self.mutex.tracker {
            tracker.on_lock_release(self.thread_id, self.mutex.id);
        }
    }
}

impl<'a, T, R: RawMutexFair> TrackedMutexGuard<'a, T, R> {
    /// The mutex this guard locks
    pub(crate) fn mutex(&self) -> &'a TrackedMutex<T, R> {
        self.mutex
    }

    /// The inner guard, for condition variable waits
    pub(crate) fn inner_guard(&mut self) -> &mut lock_api::MutexGuard<'a, R, T> {
        &mut self.guard
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl<T, R: RawMutexFair> Deref for TrackedMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T, R: RawMutexFair> DerefMut for TrackedMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T, R: RawMutexFair> TrackedMutex<T, R> {
    pub(crate) fn tracker(&self) -> Option<&LockTracker> {
        self.tracker.as_deref()
    }
}

// Identity is the wrapped mutex: two handles are equal iff they wrap the same one

impl<T, R: RawMutexFair> PartialEq for TrackedMutex<T, R> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T, R: RawMutexFair> Eq for TrackedMutex<T, R> {}

impl<T, R: RawMutexFair> Hash for TrackedMutex<T, R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T, R: RawMutexFair> fmt::Debug for TrackedMutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedMutex")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fair", &self.fair)
            .field("tracked", &self.is_tracked())
            .finish_non_exhaustive()
    }
}

impl<T: Default> Default for TrackedMutex<T> {
    /// Creates an uninstrumented `TrackedMutex<T>` with the Default value for T
    fn default() -> TrackedMutex<T> {
        TrackedMutex::untracked("unnamed", Default::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tracked<T>(name: &str, value: T) -> (Arc<LockTracker>, TrackedMutex<T>) {
        let tracker = Arc::new(LockTracker::new());
        let mutex = TrackedMutex::new_tracked(name, value, false, Some(Arc::clone(&tracker)));
        (tracker, mutex)
    }

    #[test]
    fn test_lock_and_release_update_tracker() {
        let (tracker, mutex) = tracked("a", 1);
        let me = get_current_thread_id();
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert!(tracker.held_by(me).contains(&mutex.id()));
            assert_eq!(tracker.waiting_for(me), None);
        }
        assert!(!tracker.has_holdings_entry(me));
        assert_eq!(*mutex.lock(), 2);
        assert_eq!(tracker.lock_name(mutex.id()).as_deref(), Some("a"));
    }

    #[test]
    fn test_failed_try_lock_leaves_no_waiter() {
        let (tracker, mutex) = tracked("b", ());
        let mutex = Arc::new(mutex);
        let _held = mutex.lock();

        let other = Arc::clone(&mutex);
        let tracker2 = Arc::clone(&tracker);
        thread::spawn(move || {
            assert!(other.try_lock().is_none());
            let me = get_current_thread_id();
            assert_eq!(tracker2.waiting_for(me), None);
            assert!(!tracker2.has_holdings_entry(me));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_try_lock_for_timeout_reports_failure() {
        let (tracker, mutex) = tracked("c", ());
        let mutex = Arc::new(mutex);
        let _held = mutex.lock();

        let other = Arc::clone(&mutex);
        thread::spawn(move || {
            assert!(other.try_lock_for(Duration::from_millis(20)).is_none());
            assert_eq!(tracker.waiting_for(get_current_thread_id()), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_blocked_lock_is_visible_as_waiter() {
        let (tracker, mutex) = tracked("d", ());
        let mutex = Arc::new(mutex);
        let held = mutex.lock();

        let other = Arc::clone(&mutex);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(get_current_thread_id()).unwrap();
            let _g = other.lock();
        });
        let waiter = rx.recv().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while tracker.waiting_for(waiter).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tracker.waiting_for(waiter), Some(mutex.id()));

        drop(held);
        handle.join().unwrap();
        assert_eq!(tracker.waiting_for(waiter), None);
    }

    #[test]
    fn test_blocked_acquisition_marks_thread_waiting() {
        use crate::core::introspect::{RegistryInspector, ThreadInspector};

        fn state_of(id: ThreadId) -> Option<ThreadState> {
            RegistryInspector.snapshot(id).map(|t| t.state)
        }

        fn await_state(id: ThreadId, state: ThreadState) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while state_of(id) != Some(state) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(state_of(id), Some(state));
        }

        let (_tracker, mutex) = tracked("g", ());
        let mutex = Arc::new(mutex);

        // Untimed acquisition
        let held = mutex.lock();
        let other = Arc::clone(&mutex);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(get_current_thread_id()).unwrap();
            let _g = other.lock();
            state_of(get_current_thread_id())
        });
        let waiter = rx.recv().unwrap();
        await_state(waiter, ThreadState::Waiting);
        drop(held);
        assert_eq!(handle.join().unwrap(), Some(ThreadState::Runnable));

        // Timed acquisition
        let held = mutex.lock();
        let other = Arc::clone(&mutex);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(get_current_thread_id()).unwrap();
            let acquired = other.try_lock_for(Duration::from_secs(5)).is_some();
            (acquired, state_of(get_current_thread_id()))
        });
        let waiter = rx.recv().unwrap();
        await_state(waiter, ThreadState::TimedWaiting);
        drop(held);
        assert_eq!(handle.join().unwrap(), (true, Some(ThreadState::Runnable)));
    }

    #[test]
    fn test_interrupted_lock_clears_waiter() {
        let (tracker, mutex) = tracked("e", ());
        let mutex = Arc::new(mutex);
        let _held = mutex.lock();

        let flag = InterruptFlag::new();
        let other = Arc::clone(&mutex);
        let flag2 = flag.clone();
        let handle = thread::spawn(move || {
            let result = other.lock_interruptible(&flag2);
            (result.is_err(), get_current_thread_id())
        });
        thread::sleep(Duration::from_millis(30));
        flag.interrupt();

        let (interrupted, waiter) = handle.join().unwrap();
        assert!(interrupted);
        assert!(!flag.is_interrupted());
        assert_eq!(tracker.waiting_for(waiter), None);
    }

    #[test]
    fn test_fair_mutex_round_trip() {
        let tracker = Arc::new(LockTracker::new());
        let mutex: TrackedMutex<i32> =
            TrackedMutex::new_tracked("fair", 0, true, Some(Arc::clone(&tracker)));
        assert!(mutex.is_fair());
        *mutex.lock() += 5;
        assert_eq!(*mutex.lock(), 5);
        assert!(!tracker.has_holdings_entry(get_current_thread_id()));
    }

    #[test]
    fn test_untracked_reports_nothing() {
        let mutex = TrackedMutex::untracked("plain", 3);
        assert!(!mutex.is_tracked());
        assert_eq!(*mutex.lock(), 3);
        assert_eq!(mutex.into_inner(), 3);
    }

    #[test]
    fn test_identity_follows_wrapped_mutex() {
        let a = TrackedMutex::untracked("x", 0);
        let b = TrackedMutex::untracked("x", 0);
        assert_eq!(a, a);
        assert_ne!(a, b);
    }
}
