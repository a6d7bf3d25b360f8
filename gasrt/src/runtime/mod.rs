//! The GAS task runtime.
//!
//! A [`Runtime`] owns one worker per thread: the root worker on the thread
//! that built it, and a pool of worker threads for the stealing flavor. Each
//! worker has a [`WorkerStorage`] registry tracking the GAS handle holders of
//! the tasks it runs.
//!
//! [`WorkerStorage`]: crate::storage::WorkerStorage
use crate::context;
use crate::task::WorkerId;

// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime};

mod spawn;
pub use spawn::{SpawnBuilder, TaskOpts, spawn, spawn_builder, spawn_with};

// Exports
pub(crate) use runtime::RuntimeConfig;

pub(crate) mod pool;

pub(crate) mod scheduler;

mod ticker;

pub(crate) mod worker;

/// Returns the [`WorkerId`] of the current thread, `None` outside of a runtime.
pub fn current_worker_id() -> Option<WorkerId> {
    context::try_with_context(|ctx| ctx.worker_id())
}
