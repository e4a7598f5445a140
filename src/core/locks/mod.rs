pub mod condvar;
pub mod mutex;

use std::sync::atomic::AtomicUsize;

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);
