use crate::context;
use std::sync::atomic::{AtomicU64, Ordering};

use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a task relative to all other tasks
/// spawned by the process.
///
/// # Notes
///
/// - Task IDs are *not* sequential, and do not indicate the order in which
///   tasks are spawned.
/// - The task ID of the currently running task can be obtained from inside the
///   task via the [`task::try_id()`](crate::task::try_id()) and
///   [`task::id()`](crate::task::id()) functions and from outside the task via
///   the [`JoinHandle::id()`](crate::task::JoinHandle::id()) function.
/// - The body passed to `Runtime::block_on` runs as the root task, with
///   [`ROOT_TASK_ID`].
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

const ROOT_TASK_ID_VAL: u64 = 1;
pub const ROOT_TASK_ID: Id = Id(NonZeroU64::new(ROOT_TASK_ID_VAL).unwrap());

/// Returns the [`Id`] of the currently running task.
///
/// # Panics
///
/// This function panics if called from outside a task. For a version of this
/// function that doesn't panic, see [`task::try_id()`](crate::task::try_id()).
#[track_caller]
pub fn id() -> Id {
    context::current_task_id().expect("Can't get a task id when not inside a task")
}

/// Returns the [`Id`] of the currently running task, or `None` if called outside
/// of a task.
pub fn try_id() -> Option<Id> {
    context::current_task_id()
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        // Reserve ID == 1 for the root task.
        static COUNTER: AtomicU64 = AtomicU64::new(ROOT_TASK_ID_VAL + 1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety: this number is unimaginably large, even if the runtime was
        // creating 1 billion task/sec, it would take 584 years to wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

/// Set and clear the task id in the context while a task body runs.
pub(crate) struct TaskIdGuard {
    parent_task_id: Option<Id>,
}

impl TaskIdGuard {
    pub(crate) fn enter(id: Id) -> Self {
        TaskIdGuard {
            parent_task_id: context::set_current_task_id(Some(id)),
        }
    }
}

impl Drop for TaskIdGuard {
    fn drop(&mut self) {
        context::set_current_task_id(self.parent_task_id);
    }
}

/// Identifies a worker of a runtime. Worker `0` is the root worker, the
/// thread that built the runtime and drives `block_on`. Pool threads are
/// numbered from `1`.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    pub const ROOT: WorkerId = WorkerId(0);

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
