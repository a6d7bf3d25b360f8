use crate::context::Shared;
use crate::runtime::RuntimeConfig;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::storage::WorkerStorage;
use crate::task::{Task, WorkerId};
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::iter;
use std::sync::Arc;

/// One queue set and one [`WorkerStorage`]. Worker 0 is the root worker, it
/// lives on the thread that built the runtime and only runs the tasks that
/// thread joins, plus whatever is left in the queues at shutdown. The other
/// workers each own a pool thread and run the event loop.
#[derive(Debug)]
pub(crate) struct Worker {
    id: WorkerId,

    storage: Arc<WorkerStorage>,

    /// Determines how we run the event loop.
    cfg: RefCell<EventLoopConfig>,

    /// Event loop ticker. The root worker has no event loop and never ticks,
    /// so it never forces a pop from the global queue: its drain at shutdown
    /// empties every queue anyway.
    ticker: RefCell<Ticker>,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: Cell<bool>,

    /// Global injector queue where tasks spawned from outside the runtime are
    /// pushed.
    global: Arc<Injector<Task>>,

    /// Sticky tasks, never handed to another worker. We use a VecDeque to pop
    /// in LIFO order like the crossbeam worker.
    pinned: RefCell<VecDeque<Task>>,

    /// Local queue other workers can steal from. Tasks only move while
    /// queued, a task that started running finishes on this worker.
    stealable: CbWorker<Task>,

    /// Handle to all of the other worker's stealable queues. If there are N
    /// workers we will have N-1 queues to steal from.
    stealers: Vec<Stealer<Task>>,
}

impl Worker {
    pub(crate) fn new(
        cfg: &RuntimeConfig,
        storage: Arc<WorkerStorage>,
        global: Arc<Injector<Task>>,
        stealable: CbWorker<Task>,
        mut stealers: Vec<Stealer<Task>>,
    ) -> Self {
        // Shuffle the stealers so that each worker's search order when trying to
        // steal work is different and hopefully unique to reduce contention.
        fastrand::shuffle(&mut stealers);

        Self {
            id: storage.worker_id(),
            storage,
            cfg: RefCell::new(cfg.into()),
            ticker: RefCell::new(Ticker::new()),
            pop_global_queue: Cell::new(false),
            global,
            pinned: RefCell::new(VecDeque::new()),
            stealable,
            stealers,
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn storage(&self) -> &Arc<WorkerStorage> {
        &self.storage
    }

    pub(crate) fn add_task(&self, task: Task) {
        if task.opts().is_sticky() {
            self.pinned.borrow_mut().push_back(task);
        } else {
            self.stealable.push(task);
        }
    }

    pub(crate) fn find_task(&self) -> Option<Task> {
        // Enforce scheduler fairness by force-checking the global queue with
        // frequency `global_queue_interval`.
        if self.pop_global_queue.replace(false)
            && let Some(task) = self.global.steal_batch_and_pop(&self.stealable).success()
        {
            return Some(task);
        }

        // 1. Sticky tasks first, nobody else can run them.
        let pinned = self.pinned.borrow_mut().pop_back();
        pinned.or_else(|| {
            // 2. Look in our stealable queue
            self.stealable.pop().or_else(|| {
                // 3. No local work, repeatedly try the global injector and other
                //    workers stealable queues.
                iter::repeat_with(|| {
                    self.global.steal_batch_and_pop(&self.stealable).or_else(||
                            // The behavior of collect here is to return the first Success(T) so
                            // *we are not* iterating through all stealers everytime.
                            self.stealers.iter().map(|s| s.steal()).collect())
                })
                // Repeat a maximum of `max_steal_retries` otherwise return None.
                .take(self.cfg.borrow().max_steal_retries)
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
            })
        })
    }

    pub(crate) fn run_task(&self, task: Task) {
        let id = task.id();
        if !task.run(&self.storage) {
            tracing::trace!(%id, worker = %self.id, "task already run by its joiner");
        }
    }

    /// Runs tasks until every local and global queue is empty. Used by the
    /// root worker while shutting down.
    pub(crate) fn drain(&self) -> usize {
        iter::from_fn(|| self.find_task())
            .map(|task| self.run_task(task))
            .count()
    }

    /// Tasks this worker could steal.
    fn has_stealable_work(&self) -> bool {
        !self.global.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn tick<T: TickerData>(&self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.ticker.borrow_mut().tick(ctx, data)
    }

    /// Pool thread loop: run tasks, park when there are none, exit once the
    /// runtime shuts down and nothing is left to run.
    pub(crate) fn event_loop(&self, shared: &Shared) {
        let mut shutdown = false;

        loop {
            match self.find_task() {
                Some(task) => self.run_task(task),
                None if shutdown => break,
                // Park the thread, and wait for new tasks to be scheduled and an
                // unpark signal from the scheduler.
                None => shared.park_current_thread(|| self.has_stealable_work()),
            }

            let events = self.tick(shared, &mut *self.cfg.borrow_mut());
            if events.contains(TickerEvents::SHUTDOWN) {
                shutdown = true;
            } else if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
                self.pop_global_queue.set(true);
            }
        }

        tracing::debug!(worker = %self.id, stats = ?self.storage.stats(), "worker exiting");
        self.storage.close();
    }
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,

    max_steal_retries: usize,
}

impl EventLoopConfig {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }
}

impl From<&RuntimeConfig> for EventLoopConfig {
    fn from(cfg: &RuntimeConfig) -> EventLoopConfig {
        EventLoopConfig {
            global_queue_interval: cfg.global_queue_interval,
            max_steal_retries: cfg.max_steal_retries,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Shared;

    #[inline(always)]
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if ctx.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        if self.should_pop_global_queue(tick) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::GlobalSpace;
    use crate::runtime::{Builder, TaskOpts};
    use crate::task::new_task;
    use anyhow::Result;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_impl_all!(Worker: Send);
    assert_not_impl_any!(Worker: Sync);

    fn worker(cfg: &RuntimeConfig, global: &Arc<Injector<Task>>) -> Worker {
        let storage = Arc::new(WorkerStorage::new(
            WorkerId(1),
            Arc::new(GlobalSpace::new(2)),
        ));
        Worker::new(cfg, storage, Arc::clone(global), CbWorker::new_lifo(), vec![])
    }

    #[test]
    fn test_find_task_order() -> Result<()> {
        let cfg = RuntimeConfig::try_from(Builder::new_stealing().worker_threads(1))?;
        let global = Arc::new(Injector::new());
        let worker = worker(&cfg, &global);

        let (injected, _h1) = new_task(|| 1, TaskOpts::empty(), None);
        let (stealable, _h2) = new_task(|| 2, TaskOpts::empty(), None);
        let (sticky, _h3) = new_task(|| 3, TaskOpts::STICKY, None);
        let ids = [sticky.id(), stealable.id(), injected.id()];

        global.push(injected);
        worker.add_task(stealable);
        worker.add_task(sticky);

        let found = iter::from_fn(|| worker.find_task())
            .map(|t| t.id())
            .collect::<Vec<_>>();

        assert_eq!(found, ids);
        Ok(())
    }

    #[test]
    fn test_drain_runs_everything() -> Result<()> {
        let cfg = RuntimeConfig::try_from(Builder::new_stealing().worker_threads(1))?;
        let global = Arc::new(Injector::new());
        let worker = worker(&cfg, &global);

        let handles = (0..8)
            .map(|i| {
                let (task, handle) = new_task(move || i * 2, TaskOpts::empty(), None);
                worker.add_task(task);
                handle
            })
            .collect::<Vec<_>>();

        assert_eq!(worker.drain(), 8);
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().ok(), Some(i * 2));
        }

        assert_eq!(worker.storage().stats().registered, 8);
        assert!(worker.storage().is_empty());
        Ok(())
    }
}
