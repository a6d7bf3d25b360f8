use crate::context::WorkerSlots;
use crate::runtime::RuntimeConfig;
use crate::storage::WorkerStorage;
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread, ThreadId};

/// State shared by every worker of a runtime.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    pub(crate) shutdown: AtomicBool,

    /// Used to store per-worker data. We panic on any errors coming from the
    /// slots as it would mean the runtime is in an unexpected and unrecoverable
    /// state.
    pub(crate) worker_slots: WorkerSlots,

    /// LIFO collection of parked threads. We unpark thread in LIFO order as the
    /// latest parked thread is the one where CPU cache will be the hotest.
    pub(crate) parked_threads: RwLock<VecDeque<Thread>>,
}

impl Shared {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            shutdown: AtomicBool::new(false),
            worker_slots: WorkerSlots::new(cfg.num_workers()),
            parked_threads: RwLock::new(VecDeque::with_capacity(cfg.pool_size())),
        }
    }

    pub(crate) fn register_worker(
        &self,
        thread_id: ThreadId,
        storage: &Arc<WorkerStorage>,
    ) -> Result<()> {
        self.worker_slots.register(thread_id, storage)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// This method parks the current thread, adding the thread to the LIFO
    /// `parked_threads` list. It will stay parked until the scheduler unparks
    /// it when it judges there is sufficient work to resume the event_loop on
    /// this worker.
    ///
    /// `has_work` is checked under the lock, a worker that finds queued tasks
    /// returns immediately.
    #[track_caller]
    pub(crate) fn park_current_thread(&self, has_work: impl FnOnce() -> bool) {
        let should_unpark = {
            let mut parked_threads = self.parked_threads.write();

            // We need to check these signals *while holding the lock* to avoid race
            // conditions. These are used right before we call unpark.
            if self.is_shutdown() || has_work() {
                return;
            }

            let thread = thread::current();
            let should_unpark = self.worker_slots.with_data(&thread.id(), |data| {
                data.should_unpark.store(false, Ordering::Release);
                Arc::clone(&data.should_unpark)
            });

            parked_threads.push_back(thread);
            should_unpark
        };

        // Release lock and spin until it is time to unpark, parking again on
        // spurious wakeups.
        while !should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    #[track_caller]
    pub(crate) fn unpark_one_thread(&self) -> bool {
        if let Some(thread) = self.parked_threads.write().pop_back() {
            self.worker_slots.with_data(&thread.id(), |data| {
                data.should_unpark.store(true, Ordering::Release);
            });
            thread.unpark();
            true
        } else {
            false
        }
    }

    #[track_caller]
    pub(crate) fn unpark_all_threads(&self) -> usize {
        let mut num_unparked = 0;
        let mut parked_threads = self.parked_threads.write();

        while let Some(thread) = parked_threads.pop_back() {
            num_unparked += 1;
            self.worker_slots.with_data(&thread.id(), |data| {
                data.should_unpark.store(true, Ordering::Release);
            });

            thread.unpark();
        }

        num_unparked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Shared: Send, Sync);
}
