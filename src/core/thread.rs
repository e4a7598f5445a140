//! Threads visible to the thread registry
//!
//! A drop-in replacement for `std::thread`: threads started through
//! [`spawn`] or [`Builder`] register themselves before running user code, so
//! they show up in [`RegistryInspector`](crate::RegistryInspector) snapshots
//! and in stall reports from the moment they start. Their record is removed
//! when they exit, panicking or not.
//!
//! Threads started any other way register lazily, the first time they touch a
//! tracked lock, a monitor or [`enter_frame`](crate::enter_frame).
//!
//! ```rust
//! use lockwatch::thread;
//!
//! let handle = thread::Builder::new()
//!     .name("ledger-writer".to_string())
//!     .spawn(|| 42)
//!     .unwrap();
//!
//! assert_eq!(handle.join().unwrap(), 42);
//! ```

use crate::core::introspect::register_current_thread;

pub use std::thread::{
    AccessError, JoinHandle, LocalKey, Result, Scope, ScopedJoinHandle, Thread, ThreadId,
    available_parallelism, current, panicking, park, park_timeout, scope, sleep, yield_now,
};

/// Spawn a registered thread
///
/// # Panics
///
/// Panics if the OS fails to create a thread; use [`Builder::spawn`]
/// to recover from such errors.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match Builder::new().spawn(f) {
        Ok(handle) => handle,
        Err(e) => panic!("failed to spawn thread: {e}"),
    }
}

/// Thread factory mirroring [`std::thread::Builder`]
#[derive(Debug)]
pub struct Builder {
    inner: std::thread::Builder,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            inner: std::thread::Builder::new(),
        }
    }

    /// Names the thread; the name is what reports show
    pub fn name(mut self, name: String) -> Builder {
        self.inner = self.inner.name(name);
        self
    }

    pub fn stack_size(mut self, size: usize) -> Builder {
        self.inner = self.inner.stack_size(size);
        self
    }

    pub fn spawn<F, T>(self, f: F) -> std::io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.spawn(move || {
            register_current_thread();
            f()
        })
    }

    /// Spawn a registered scoped thread
    ///
    /// ```rust
    /// use lockwatch::thread;
    /// use std::sync::atomic::{AtomicI32, Ordering};
    ///
    /// let x = AtomicI32::new(0);
    ///
    /// thread::scope(|s| {
    ///     for _ in 0..2 {
    ///         thread::Builder::new()
    ///             .spawn_scoped(s, || {
    ///                 x.fetch_add(1, Ordering::SeqCst);
    ///             })
    ///             .unwrap();
    ///     }
    /// });
    ///
    /// assert_eq!(x.load(Ordering::SeqCst), 2);
    /// ```
    pub fn spawn_scoped<'scope, 'env, F, T>(
        self,
        scope: &'scope Scope<'scope, 'env>,
        f: F,
    ) -> std::io::Result<ScopedJoinHandle<'scope, T>>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        self.inner.spawn_scoped(scope, move || {
            register_current_thread();
            f()
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
