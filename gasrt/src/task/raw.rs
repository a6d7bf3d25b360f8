use crate::runtime::TaskOpts;
use crate::storage::WorkerStorage;
use crate::task::harness;
use crate::task::state::State;
use crate::task::{Id, JoinError, JoinHandle};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Immutable task data, available to the scheduler without running the task.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub(crate) id: Id,
    pub(crate) opts: TaskOpts,
    pub(crate) name: Option<Arc<str>>,
}

/// Result slot shared between a task and its `JoinHandle`.
pub(crate) struct TaskCell<T> {
    pub(crate) id: Id,
    pub(crate) output: OnceLock<Result<T, JoinError>>,
    pub(crate) state: Arc<State>,
}

// Safety: the output is written once by the thread running the task, before
// the terminal transition, and only read through the `JoinHandle` after it.
// The `JoinHandle` itself is only `Sync` when `T: Sync`.
unsafe impl<T: Send> Sync for TaskCell<T> {}

impl<T> TaskCell<T> {
    fn new(id: Id) -> Self {
        Self {
            id,
            output: OnceLock::new(),
            state: Arc::new(State::new()),
        }
    }

    /// Publishes the output and wakes joiners. The cell reference is dropped
    /// before the transition so that a woken joiner holds the last one.
    pub(crate) fn complete(self: Arc<Self>, output: Result<T, JoinError>) {
        let completed = output.is_ok();
        let _ = self.output.set(output);

        let state = Arc::clone(&self.state);
        drop(self);
        state.transition_to_terminal(completed);
    }

    pub(crate) fn into_output(self) -> Result<T, JoinError> {
        let TaskCell { id, output, .. } = self;
        output
            .into_inner()
            .unwrap_or_else(|| Err(JoinError::cancelled(id)))
    }
}

/// Type-erased task body, shared by the queue entry and the `JoinHandle`.
/// Whoever takes the body first runs it, every other attempt is a no-op.
pub(crate) trait Run: Send + Sync {
    fn header(&self) -> &Header;

    /// Runs the body on the worker owning `storage`. Returns false when the
    /// body was already taken.
    fn run(&self, storage: &WorkerStorage) -> bool;

    /// Fails the task with a cancelled error if its body was never taken.
    fn cancel(&self);
}

struct RawTask<F, T> {
    header: Header,
    body: Mutex<Option<(F, Arc<TaskCell<T>>)>>,
}

impl<F, T> Run for RawTask<F, T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    fn header(&self) -> &Header {
        &self.header
    }

    fn run(&self, storage: &WorkerStorage) -> bool {
        // The lock is released before the body runs, a nested join may
        // inspect this task again.
        let Some((func, cell)) = self.body.lock().take() else {
            return false;
        };

        harness::run(&self.header, storage, func, cell);
        true
    }

    fn cancel(&self) {
        if let Some((func, cell)) = self.body.lock().take() {
            drop(func);
            let id = cell.id;
            cell.complete(Err(JoinError::cancelled(id)));
        }
    }
}

/// A queued task. Owned by exactly one queue at a time.
///
/// Dropping a task whose body never ran cancels it: the runtime only does so
/// once it can no longer run anything.
pub(crate) struct Task {
    raw: Arc<dyn Run>,
}

impl Task {
    pub(crate) fn id(&self) -> Id {
        self.raw.header().id
    }

    pub(crate) fn opts(&self) -> TaskOpts {
        self.raw.header().opts
    }

    /// Runs the task body on the worker owning `storage`, unless a joiner
    /// already took it.
    pub(crate) fn run(self, storage: &WorkerStorage) -> bool {
        self.raw.run(storage)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.raw.cancel();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("header", self.raw.header())
            .finish()
    }
}

pub(crate) fn new_task<F, T>(
    func: F,
    opts: TaskOpts,
    name: Option<Arc<str>>,
) -> (Task, JoinHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let id = Id::next();
    let cell = Arc::new(TaskCell::new(id));

    let raw: Arc<dyn Run> = Arc::new(RawTask {
        header: Header { id, opts, name },
        body: Mutex::new(Some((func, Arc::clone(&cell)))),
    });

    let join = JoinHandle::new(cell, Arc::clone(&raw));
    (Task { raw }, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::GlobalSpace;
    use crate::task::{TaskState, WorkerId};
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task: Send);

    #[test]
    fn test_body_runs_once() {
        let storage = WorkerStorage::new(WorkerId(1), Arc::new(GlobalSpace::new(1)));
        let (task, join) = new_task(|| 42, TaskOpts::empty(), None);

        // The joiner took the body, the queue entry is left empty.
        assert!(join.raw.run(&storage));
        assert!(!task.run(&storage));

        assert_eq!(join.join().ok(), Some(42));
        assert_eq!(storage.stats().registered, 1);
    }

    #[test]
    fn test_dropped_task_is_cancelled() {
        let (task, join) = new_task(|| 42, TaskOpts::empty(), None);
        assert_eq!(task.id(), join.id());
        assert_eq!(join.state(), TaskState::Created);

        drop(task);
        assert_eq!(join.state(), TaskState::Failed);
        assert!(matches!(join.join(), Err(e) if e.is_cancelled()));
    }
}
