use crate::gas::GasHandleHolder;
use crate::task::Id;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<Arc<GasHandleHolder>>> = const { RefCell::new(None) };
}

/// Task-local storage for the duration of one task body.
///
/// Owns the [`GasHandleHolder`] of the running task and makes it the current
/// holder of the thread. Dropping it restores the holder of the task that was
/// running before on this thread, if any.
#[derive(Debug)]
pub struct ThreadStorage {
    holder: Arc<GasHandleHolder>,

    parent: Option<Arc<GasHandleHolder>>,

    // Bound to the thread whose current holder it replaced.
    _not_send: PhantomData<*const ()>,
}

impl ThreadStorage {
    pub(crate) fn enter(owner: Option<Id>) -> Self {
        let holder = Arc::new(GasHandleHolder::new(owner));
        let parent = CURRENT.with(|current| current.replace(Some(Arc::clone(&holder))));

        Self {
            holder,
            parent,
            _not_send: PhantomData,
        }
    }

    pub fn holder(&self) -> &Arc<GasHandleHolder> {
        &self.holder
    }

    /// Runs `f` with the holder of the task running on this thread.
    ///
    /// Returns `None` outside of a task body.
    pub fn with_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Arc<GasHandleHolder>) -> R,
    {
        current_holder().as_ref().map(f)
    }
}

impl Drop for ThreadStorage {
    fn drop(&mut self) {
        let parent = self.parent.take();
        CURRENT.with(|current| current.replace(parent));
    }
}

/// Holder of the task running on this thread, if any.
pub fn current_holder() -> Option<Arc<GasHandleHolder>> {
    CURRENT.with(|current| current.borrow().clone())
}
