use crate::runtime::scheduler::Handle;
use crate::runtime::worker::Worker;
use crate::storage::WorkerStorage;
use crate::task::{Id, WorkerId};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread_local;

// Exports
mod shared;
pub(crate) use shared::Shared;

mod slots;
pub(crate) use slots::WorkerSlots;

/// Everything a runtime thread needs to run tasks: its worker (queues and
/// [`WorkerStorage`]) and a handle to the scheduler it belongs to.
#[derive(Debug)]
pub(crate) struct Context {
    worker: Rc<Worker>,

    scheduler: Handle,

    current_task_id: Cell<Option<Id>>,
}

impl Context {
    pub(crate) fn worker_id(&self) -> WorkerId {
        self.worker.id()
    }

    pub(crate) fn storage(&self) -> &Arc<WorkerStorage> {
        self.worker.storage()
    }

    pub(crate) fn scheduler(&self) -> &Handle {
        &self.scheduler
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Rc<Context>>> = const { RefCell::new(None) };
}

/// Restores the previous context of the thread on drop.
#[derive(Debug)]
#[must_use]
pub(crate) struct ContextGuard {
    prev: Option<Rc<Context>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CONTEXT.with(|ctx| ctx.replace(prev));
    }
}

/// Installs `worker` as the worker of the current thread.
pub(crate) fn enter(worker: Rc<Worker>, scheduler: Handle) -> ContextGuard {
    let ctx = Rc::new(Context {
        worker,
        scheduler,
        current_task_id: Cell::new(None),
    });

    ContextGuard {
        prev: CONTEXT.with(|c| c.replace(Some(ctx))),
    }
}

/// Runs `f` with the context of the current thread. The context is cloned out
/// of the thread local first, so `f` may spawn, run or join tasks.
pub(crate) fn try_with_context<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Context) -> R,
{
    let ctx = CONTEXT.with(|c| c.borrow().clone());
    ctx.as_deref().map(f)
}

#[track_caller]
pub(crate) fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&Handle) -> R,
{
    try_with_context(|ctx| f(ctx.scheduler()))
        .expect("must be called from the context of a gasrt runtime")
}

pub(crate) fn current_worker() -> Option<Rc<Worker>> {
    try_with_context(|ctx| Rc::clone(&ctx.worker))
}

/// The worker of the current thread, if it belongs to `scheduler`.
pub(crate) fn current_worker_of(scheduler: &Handle) -> Option<Rc<Worker>> {
    try_with_context(|ctx| {
        ctx.scheduler
            .ptr_eq(scheduler)
            .then(|| Rc::clone(&ctx.worker))
    })
    .flatten()
}

pub(crate) fn current_task_id() -> Option<Id> {
    try_with_context(|ctx| ctx.current_task_id.get()).flatten()
}

pub(crate) fn set_current_task_id(id: Option<Id>) -> Option<Id> {
    try_with_context(|ctx| ctx.current_task_id.replace(id)).flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use anyhow::Result;
    use std::thread;

    #[test]
    fn test_context_is_thread_local() -> Result<()> {
        let runtime = Builder::new_local().try_build()?;
        assert_eq!(try_with_context(|ctx| ctx.worker_id()), Some(WorkerId::ROOT));

        let other = thread::spawn(|| try_with_context(|ctx| ctx.worker_id())).join();
        assert!(matches!(other, Ok(None)));

        drop(runtime);
        assert!(try_with_context(|ctx| ctx.worker_id()).is_none());
        Ok(())
    }

    #[test]
    fn test_task_id_outside_of_task() -> Result<()> {
        let runtime = Builder::new_local().try_build()?;
        assert_eq!(current_task_id(), None);

        runtime.block_on(|| {
            assert_eq!(current_task_id(), Some(crate::task::ROOT_TASK_ID));
        });

        assert_eq!(current_task_id(), None);
        Ok(())
    }
}
