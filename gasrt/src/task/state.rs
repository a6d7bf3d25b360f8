use parking_lot::{Condvar, Mutex};

/// Lifecycle of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Spawned, waiting in a queue.
    Created,

    /// A worker is running the task body.
    Running,

    /// The task body returned a value.
    Completed,

    /// The task body panicked, or the task was dropped before running.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Shared between the task and its `JoinHandle`. Terminal transitions happen
/// exactly once and wake every waiter.
#[derive(Debug)]
pub(crate) struct State {
    stage: Mutex<TaskState>,
    cond: Condvar,
}

impl State {
    pub(crate) fn new() -> Self {
        Self {
            stage: Mutex::new(TaskState::Created),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn load(&self) -> TaskState {
        *self.stage.lock()
    }

    /// Returns false if the task already left `Created`.
    pub(crate) fn transition_to_running(&self) -> bool {
        let mut stage = self.stage.lock();

        if *stage == TaskState::Created {
            *stage = TaskState::Running;
            true
        } else {
            false
        }
    }

    pub(crate) fn transition_to_terminal(&self, completed: bool) {
        let mut stage = self.stage.lock();
        debug_assert!(!stage.is_terminal(), "task completed twice");

        *stage = if completed {
            TaskState::Completed
        } else {
            TaskState::Failed
        };

        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut stage = self.stage.lock();
        while !stage.is_terminal() {
            self.cond.wait(&mut stage);
        }
    }
}
