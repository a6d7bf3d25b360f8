use crate::context;
use crate::task::raw::{Run, TaskCell};
use crate::task::{Id, JoinError, TaskState};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::sync::Arc;

/// An owned permission to join on a task (wait for its termination).
///
/// This can be thought of as the equivalent of [`std::thread::JoinHandle`]
/// for a gasrt task rather than a thread. The task starts running as soon as
/// a worker picks it up, whether or not anyone joins it.
///
/// A `JoinHandle` *detaches* the associated task when it is dropped, which
/// means that there is no longer any handle to the task, and no way to `join`
/// on it.
///
/// This `struct` is created by the [`spawn`] and [`spawn_with`] functions.
///
/// # Blocking
///
/// [`join`] and [`get`] block until the task is terminal. When called on a
/// worker thread and the task is still queued, the joiner takes it out of the
/// queue and runs it itself, nested in the current task. A joiner never runs
/// any other task: whatever sits below it on its stack waits for it, so the
/// only task that cannot depend on the stack is the one being joined.
///
/// # Examples
///
/// The generic parameter `T` in `JoinHandle<T>` is the return type of the
/// spawned function:
///
/// ```
/// use gasrt::task::JoinHandle;
///
/// fn sum(a: i32, b: i32) -> i32 {
///     a + b
/// }
///
/// #[gasrt::main(flavor = "local")]
/// fn main() {
///     let handle: JoinHandle<i32> = gasrt::spawn_with(sum, (5, 10));
///     assert_eq!(handle.join().unwrap(), 15);
/// }
/// ```
///
/// If the task panics, the error is a [`JoinError`] that contains the panic:
///
/// ```
/// #[gasrt::main(flavor = "stealing", worker_threads = 2)]
/// fn main() {
///     let handle = gasrt::spawn(|| -> i32 { panic!("boom") });
///
///     let err = handle.join().unwrap_err();
///     assert!(err.is_panic());
/// }
/// ```
///
/// [`spawn`]: crate::spawn()
/// [`spawn_with`]: crate::spawn_with()
/// [`join`]: JoinHandle::join
/// [`get`]: JoinHandle::get
/// [`JoinError`]: crate::task::JoinError
pub struct JoinHandle<T> {
    cell: Arc<TaskCell<T>>,

    pub(super) raw: Arc<dyn Run>,

    // `TaskCell` is `Sync` for any `T: Send`, the handle is only `Sync` when
    // references to the output can be shared.
    _p: PhantomData<T>,
}

impl<T> UnwindSafe for JoinHandle<T> {}
impl<T> RefUnwindSafe for JoinHandle<T> {}

impl<T> JoinHandle<T> {
    pub(super) fn new(cell: Arc<TaskCell<T>>, raw: Arc<dyn Run>) -> JoinHandle<T> {
        JoinHandle {
            cell,
            raw,
            _p: PhantomData,
        }
    }

    /// Returns a [task ID] that uniquely identifies this task relative to other
    /// spawned tasks.
    ///
    /// [task ID]: crate::task::Id
    pub fn id(&self) -> Id {
        self.cell.id
    }

    pub fn state(&self) -> TaskState {
        self.cell.state.load()
    }

    /// Checks if the task associated with this `JoinHandle` has finished.
    ///
    /// This method does not block. A finished task has released every GAS
    /// mapping it localized and deregistered from its worker.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Waits for the task and returns a reference to its output.
    ///
    /// Can be called any number of times, the task body runs only once and
    /// every call observes the same output.
    pub fn get(&self) -> Result<&T, &JoinError> {
        self.wait();

        self.cell
            .output
            .get()
            .expect("terminal task has no output")
            .as_ref()
    }

    /// Waits for the task and returns its output.
    pub fn join(self) -> Result<T, JoinError> {
        self.wait();

        // The worker drops its reference before the terminal transition.
        match Arc::try_unwrap(self.cell) {
            Ok(cell) => cell.into_output(),
            Err(_) => unreachable!("task cell still shared after completion"),
        }
    }

    fn wait(&self) {
        let state = &self.cell.state;
        if state.load().is_terminal() {
            return;
        }

        if state.load() == TaskState::Created
            && let Some(worker) = context::current_worker()
            && self.raw.run(worker.storage())
        {
            return;
        }

        // Running elsewhere, or joined from a thread that is not a worker.
        state.wait();
    }
}

impl<T> fmt::Debug for JoinHandle<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("JoinHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
