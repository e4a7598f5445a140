//! A minimal task queue for a critical thread
//!
//! [`EventLoop`] is the receiving end, driven by the critical thread itself.
//! [`EventLoopHandle`] is the posting end and implements [`CriticalThread`],
//! so it can be handed to the stall detector.
//!
//! ```rust
//! use lockwatch::EventLoop;
//!
//! let (event_loop, handle) = EventLoop::new();
//! handle.post(Box::new(|| println!("on the loop")));
//! drop(handle);
//! event_loop.run();
//! ```

use crate::core::detector::stall::{CriticalThread, Task};
use crate::core::introspect::{StateGuard, register_current_thread};
use crate::core::types::{ThreadId, ThreadState, get_current_thread_id};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

/// Receiving side of a critical thread's task queue
pub struct EventLoop {
    tasks: Receiver<Task>,
    owner: Arc<OnceLock<ThreadId>>,
}

/// Posting side of a critical thread's task queue
#[derive(Clone)]
pub struct EventLoopHandle {
    tasks: Sender<Task>,
    owner: Arc<OnceLock<ThreadId>>,
}

impl EventLoop {
    pub fn new() -> (EventLoop, EventLoopHandle) {
        let (tx, rx) = unbounded();
        let owner = Arc::new(OnceLock::new());
        (
            EventLoop {
                tasks: rx,
                owner: Arc::clone(&owner),
            },
            EventLoopHandle { tasks: tx, owner },
        )
    }

    /// Start a loop on a new named thread
    pub fn spawn(name: &str) -> io::Result<(EventLoopHandle, JoinHandle<()>)> {
        let (event_loop, handle) = EventLoop::new();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || event_loop.run())?;
        Ok((handle, thread))
    }

    fn claim(&self) {
        register_current_thread();
        let _ = self.owner.set(get_current_thread_id());
    }

    /// Run tasks on the current thread until every handle is dropped
    pub fn run(&self) {
        self.claim();
        loop {
            let next = {
                let _idle = StateGuard::enter(ThreadState::Waiting);
                self.tasks.recv()
            };
            match next {
                Ok(task) => task(),
                Err(_) => break,
            }
        }
    }

    /// Run the tasks already queued without blocking
    ///
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        self.claim();
        let mut ran = 0;
        while let Ok(task) = self.tasks.try_recv() {
            task();
            ran += 1;
        }
        ran
    }
}

impl EventLoopHandle {
    pub fn post(&self, task: Task) -> bool {
        self.tasks.send(task).is_ok()
    }
}

impl CriticalThread for EventLoopHandle {
    fn thread_id(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }

    fn post(&self, task: Task) -> bool {
        EventLoopHandle::post(self, task)
    }
}
