//! Per-worker and per-task storage of GAS handle holders.
use crate::context;
use std::sync::Arc;

mod guard;
pub(crate) use guard::bracket;
pub use guard::GasHandleRegistration;

mod thread;
pub use thread::{ThreadStorage, current_holder};

mod worker;
pub use worker::{RegistryError, WorkerStorage, WorkerStorageStats};

/// The storage of the worker running on this thread, or `None` off the
/// runtime.
pub fn current_worker_storage() -> Option<Arc<WorkerStorage>> {
    context::try_with_context(|cx| Arc::clone(cx.storage()))
}
