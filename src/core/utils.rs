use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval between checks while waiting for a thread to finish
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Join a thread, giving up after `timeout`
///
/// A thread that has not finished in time is detached: it keeps running but
/// is no longer waited for.
///
/// # Returns
/// `true` if the thread finished (panicking counts as finished)
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        tracing::warn!(target: "lockwatch", "background thread ended with a panic");
    }
    true
}

/// Milliseconds in a duration, saturating
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
