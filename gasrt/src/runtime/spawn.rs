//! Provides functions and types for spawning new tasks onto the runtime.
//!
//! Tasks can be spawned using the simple [`spawn()`] function for default
//! behavior, with arguments through [`spawn_with()`], or configured using the
//! [`SpawnBuilder`] for more control.
//!
//! [`SpawnBuilder`]: crate::runtime::SpawnBuilder
use crate::context;
use crate::task::{Apply, JoinHandle};
use bitflags::bitflags;
use std::sync::Arc;

/// Spawns a new task running `func` with default options.
///
/// This is a convenience function for [spawn_builder()].
///
/// # Panics
///
/// Panics if called outside of a gasrt runtime.
#[track_caller]
pub fn spawn<F, T>(func: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    context::with_scheduler(|s| s.spawn(func, None, None))
}

/// Spawns a new task calling `func` with the tuple `args` as its arguments.
///
/// Arguments are moved into the task. Any change the task makes to them is
/// invisible to the caller.
///
/// ```
/// fn sum(a: i32, b: i32) -> i32 {
///     a + b
/// }
///
/// #[gasrt::main]
/// fn main() {
///     let handle = gasrt::spawn_with(sum, (5, 10));
///     assert_eq!(handle.join().unwrap(), 15);
/// }
/// ```
#[track_caller]
pub fn spawn_with<F, A>(func: F, args: A) -> JoinHandle<A::Output>
where
    A: Apply<F> + Send + 'static,
    F: Send + 'static,
    A::Output: Send + 'static,
{
    spawn(move || args.apply(func))
}

/// Creates a new [SpawnBuilder] for configuring and spawning a task.
///
/// # Example
///
/// ```no_run
/// use gasrt::runtime::TaskOpts;
///
/// gasrt::spawn_builder()
///     .with_opts(TaskOpts::STICKY)
///     .with_name("reduce")
///     .spawn(|| {
///         // ...
///     });
/// ```
pub fn spawn_builder() -> SpawnBuilder {
    SpawnBuilder::default()
}

bitflags! {
    /// Configuration options for a new task.
    ///
    /// Passed to the runtime via [SpawnBuilder::with_opts].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct TaskOpts: u16 {
        /// Task will run on the worker it is spawned from.
        ///
        /// This prevents the work-stealing scheduler from handing it to
        /// another worker before it starts.
        const STICKY = 1;
    }
}

impl TaskOpts {
    pub(crate) fn is_sticky(&self) -> bool {
        self.contains(TaskOpts::STICKY)
    }
}

/// A builder for configuring and spawning a new task.
///
/// Created by calling [spawn_builder()].
#[derive(Debug, Default)]
pub struct SpawnBuilder {
    opts: Option<TaskOpts>,

    name: Option<Arc<str>>,
}

impl SpawnBuilder {
    /// Sets the [TaskOpts] for the new task.
    pub fn with_opts(mut self, opts: TaskOpts) -> Self {
        self.opts = Some(opts);
        self
    }

    /// Names the task in trace spans.
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawns the task with the configured options.
    #[track_caller]
    pub fn spawn<F, T>(self, func: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        context::with_scheduler(|s| s.spawn(func, self.opts, self.name))
    }

    #[track_caller]
    pub fn spawn_with<F, A>(self, func: F, args: A) -> JoinHandle<A::Output>
    where
        A: Apply<F> + Send + 'static,
        F: Send + 'static,
        A::Output: Send + 'static,
    {
        self.spawn(move || args.apply(func))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use anyhow::Result;

    #[test]
    fn test_task_opts_default_is_empty() {
        assert!(!TaskOpts::default().is_sticky());
        assert!(TaskOpts::STICKY.is_sticky());
    }

    #[test]
    #[should_panic(expected = "must be called from the context of a gasrt runtime")]
    fn test_spawn_outside_runtime() {
        let _ = spawn(|| 1);
    }

    #[test]
    fn test_spawn_builder() -> Result<()> {
        let runtime = Builder::new_local().try_build()?;

        let handle = runtime.block_on(|| {
            spawn_builder()
                .with_name("product")
                .spawn_with(|a: u32, b: u32| a * b, (6, 7))
        });

        assert_eq!(handle.join().ok(), Some(42));
        Ok(())
    }
}
