use crate::storage::{self, WorkerStorage};
use crate::task::raw::{Header, TaskCell};
use crate::task::{JoinError, TaskIdGuard};
use std::sync::Arc;

/// Task body wrapper. Every task goes through here, whatever its function,
/// arguments or output:
///
/// 1. enter the thread storage and register its holder with the worker,
/// 2. run the function, catching panics,
/// 3. deregister the holder and unlocalize its handles,
/// 4. drop the thread storage,
/// 5. publish the output to joiners.
pub(super) fn run<F, T>(header: &Header, storage: &WorkerStorage, func: F, cell: Arc<TaskCell<T>>)
where
    F: FnOnce() -> T,
{
    let running = cell.state.transition_to_running();
    debug_assert!(running, "task {} ran twice", header.id);

    let _span = tracing::trace_span!(
        "task",
        id = %header.id,
        name = header.name.as_deref().unwrap_or_default(),
        worker = %storage.worker_id(),
    )
    .entered();

    let output = {
        let _id_guard = TaskIdGuard::enter(header.id);
        storage::bracket(storage, Some(header.id), func)
            .map_err(|panic| JoinError::panic(header.id, panic))
    };

    if let Err(err) = &output {
        tracing::debug!(%err, "task failed");
    }

    cell.complete(output);
}
