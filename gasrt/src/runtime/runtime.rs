use crate::context::{self, ContextGuard};
use crate::gas::{AddressSpace, GlobalSpace};
use crate::runtime::TaskOpts;
use crate::runtime::pool::ThreadPool;
use crate::runtime::scheduler::{Handle, Scheduler};
use crate::runtime::worker::Worker;
use crate::storage::{self, WorkerStorage};
use crate::task::{Apply, JoinHandle, ROOT_TASK_ID, TaskIdGuard, WorkerId};
use crate::utils::ScopeGuard;
use crate::utils::thread::set_current_thread_name;
use anyhow::{Result, anyhow};
use std::cell::Cell;
use std::fmt;
use std::panic;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

///
/// Event Loop policies
//
/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Local,
    Stealing,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("gasrt-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Runtime type
    kind: Kind,

    /// The number of worker threads, used by the stealing scheduler. Defaults
    /// to 1 per core, plus the `root_worker` running the closure given to
    /// `block_on`.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the global injector queue.
    global_queue_interval: u32,

    /// How many times a worker will loop over the global injector queue and
    /// other stealable queues to try and find work, before parking.
    max_steal_retries: usize,

    /// Address space shared by the workers. Defaults to a [`GlobalSpace`]
    /// with one home per worker.
    address_space: Option<Arc<dyn AddressSpace>>,
}

impl Builder {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            address_space: None,
        }
    }

    /// Returns a new builder with the local thread scheduler selected. Every
    /// task runs on the thread that built the runtime.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_local() -> Builder {
        Builder::new(Kind::Local)
    }

    /// Returns a new builder with the work-stealing scheduler selected.
    pub fn new_stealing() -> Builder {
        Builder::new(Kind::Stealing)
    }

    /// The number of worker threads, used by the Runtime. Only relevant when
    /// using a multi-threaded scheduler (i.e.: stealing scheduler).
    ///
    /// Defaults to 1 worker per CPU core.
    ///
    /// Please note the runtime also has a `root_worker` which *does not count*
    /// towards the total number of worker threads.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "gasrt-{id}", where id is monotonically
    /// increasing and `gasrt-0` is the thread that built the runtime.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The default stack size for spawned threads is 2 MiB, though this
    /// particular stack size is subject to change in the future.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of scheduler ticks after which a worker looks for its
    /// next task in the global queue first.
    ///
    /// A scheduler "tick" corresponds to one pass of the event loop.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    pub fn address_space(mut self, space: Arc<dyn AddressSpace>) -> Self {
        self.address_space = Some(space);
        self
    }

    /// Creates the configured `Runtime`.
    ///
    /// The returned `Runtime` instance is ready to spawn tasks. The calling
    /// thread becomes the root worker of the runtime.
    pub fn try_build(self) -> Result<Runtime> {
        IS_RUNTIME_ACTIVE.with(|is_active| -> Result<()> {
            if is_active.get() {
                Err(anyhow!(
                    "Cannot create a new Runtime: a runtime is already active on this thread."
                ))
            } else {
                is_active.set(true);
                Ok(())
            }
        })?;

        let mut reset = ScopeGuard::new(|| IS_RUNTIME_ACTIVE.with(|a| a.set(false)));

        let cfg = RuntimeConfig::try_from(self)?;
        let scheduler = Scheduler::new(cfg).into_handle();

        // Name the root thread *before* spawning the pool so that it gets
        // `gasrt-0`. There is no way to modify the current thread name using
        // `std::thread`, so we use `libc::` and platform specific low-level
        // interface.
        set_current_thread_name(&scheduler.cfg.thread_name);

        let (root, pool) = ThreadPool::new(&scheduler)?;
        scheduler.set_pool(pool)?;

        let root = Rc::new(root);
        let runtime = Runtime {
            scheduler: scheduler.clone(),
            root: Rc::clone(&root),
            _context: context::enter(root, scheduler.clone()),
        };

        // From here on, dropping the runtime resets the flag.
        reset.disarm();
        scheduler
            .shared
            .register_worker(thread::current().id(), runtime.root.storage())?;

        tracing::debug!(
            kind = ?scheduler.cfg.kind,
            workers = scheduler.cfg.num_workers(),
            "runtime started"
        );

        Ok(runtime)
    }
}

// Use a thread_local variable to track if a runtime is already active on this thread.
thread_local! {
    static IS_RUNTIME_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// A GAS task runtime: a root worker on the current thread and a pool of
/// worker threads, each with its own [`WorkerStorage`].
#[derive(Debug)]
pub struct Runtime {
    scheduler: Handle,

    root: Rc<Worker>,

    _context: ContextGuard,
}

impl Runtime {
    /// Runs `f` on the current thread as the root task.
    ///
    /// `f` gets its own GAS handle holder registered with the root worker,
    /// like any spawned task. A panic in `f` is propagated to the caller once
    /// the holder was released.
    pub fn block_on<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _id_guard = TaskIdGuard::enter(ROOT_TASK_ID);
        let _span = tracing::trace_span!("block_on", worker = %self.root.id()).entered();

        match storage::bracket(self.root.storage(), Some(ROOT_TASK_ID), f) {
            Ok(output) => output,
            Err(panic) => panic::resume_unwind(panic),
        }
    }

    /// Spawns a task onto the runtime.
    pub fn spawn<F, T>(&self, func: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.spawn(func, None, None)
    }

    /// Spawns `func` with the tuple `args` as its arguments.
    pub fn spawn_with<F, A>(&self, func: F, args: A) -> JoinHandle<A::Output>
    where
        A: Apply<F> + Send + 'static,
        F: Send + 'static,
        A::Output: Send + 'static,
    {
        self.spawn(move || args.apply(func))
    }

    /// Number of workers, the root worker included.
    pub fn num_workers(&self) -> usize {
        self.scheduler.shared.worker_slots.len()
    }

    pub fn worker_storage(&self, worker: WorkerId) -> Option<Arc<WorkerStorage>> {
        self.scheduler.shared.worker_slots.storage(worker)
    }

    pub fn worker_storages(&self) -> Vec<Arc<WorkerStorage>> {
        self.scheduler.shared.worker_slots.storages()
    }

    pub fn address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.scheduler.cfg.address_space
    }

    /// Shutdown the runtime.
    ///
    /// Queued tasks still run: the root worker drains its queues while the
    /// pool threads finish theirs. The thread initiating the shutdown blocks
    /// until every worker thread exited. The `Drop` implementation does the
    /// same.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        let shared = &self.scheduler.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        shared.unpark_all_threads();
        self.root.drain();

        if let Some(pool) = self.scheduler.pool.get()
            && let Err(e) = pool.join_all()
        {
            tracing::error!(error = ?e, "error during runtime shutdown");
        }

        // Pool workers are gone, run whatever was injected in the meantime.
        self.root.drain();
        self.root.storage().close();

        IS_RUNTIME_ACTIVE.with(|is_active| is_active.set(false));
        tracing::debug!(stats = ?self.root.storage().stats(), "runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

// Export runtime builder as a RuntimeConfig object to be consumed by the
// scheduler and its workers.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) kind: Kind,
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) address_space: Arc<dyn AddressSpace>,
}

impl RuntimeConfig {
    /// Number of pool threads. The local scheduler has none.
    pub(crate) fn pool_size(&self) -> usize {
        match self.kind {
            Kind::Local => 0,
            Kind::Stealing => self.worker_threads,
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.pool_size() + 1
    }

    fn validate(&self) -> Result<()> {
        if let Some(size) = self.thread_stack_size
            && size < libc::PTHREAD_STACK_MIN
        {
            return Err(anyhow!(
                "thread_stack_size ({}) is below PTHREAD_STACK_MIN ({})",
                size,
                libc::PTHREAD_STACK_MIN
            ));
        }

        Ok(())
    }

    pub(crate) fn default_task_opts(&self) -> TaskOpts {
        let mut opts = TaskOpts::default();

        // All tasks are sticky on local scheduler since we have a single thread.
        if matches!(self.kind, Kind::Local) {
            opts |= TaskOpts::STICKY;
        }

        opts
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let num_workers = match builder.kind {
            Kind::Local => 1,
            Kind::Stealing => worker_threads + 1,
        };

        let address_space = builder
            .address_space
            .unwrap_or_else(|| Arc::new(GlobalSpace::new(num_workers)));

        let cfg = RuntimeConfig {
            kind: builder.kind,
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            address_space,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    // We need this to easily inject RuntimeConfig in each spawned worker.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    // The runtime owns the context of the thread that built it.
    assert_not_impl_any!(Runtime: Send, Sync);

    #[test]
    fn test_only_one_runtime_per_thread() -> Result<()> {
        let runtime = Builder::new_local().try_build()?;
        assert!(Builder::new_stealing().worker_threads(1).try_build().is_err());

        drop(runtime);
        let _runtime = Builder::new_stealing().worker_threads(1).try_build()?;
        Ok(())
    }

    #[test]
    fn test_failed_build_resets_active_flag() -> Result<()> {
        assert!(
            Builder::new_stealing()
                .worker_threads(1)
                .thread_stack_size(1024)
                .try_build()
                .is_err()
        );

        let _runtime = Builder::new_local().try_build()?;
        Ok(())
    }

    #[test]
    fn test_config_num_workers() -> Result<()> {
        let local = RuntimeConfig::try_from(Builder::new_local().worker_threads(8))?;
        assert_eq!(local.num_workers(), 1);
        assert!(local.default_task_opts().is_sticky());

        let stealing = RuntimeConfig::try_from(Builder::new_stealing().worker_threads(3))?;
        assert_eq!(stealing.num_workers(), 4);
        assert!(!stealing.default_task_opts().is_sticky());
        Ok(())
    }

    #[test]
    fn test_shutdown_runs_queued_tasks() -> Result<()> {
        let runtime = Builder::new_stealing().worker_threads(2).try_build()?;

        let handles = (0..16u64)
            .map(|i| runtime.spawn(move || i + 1))
            .collect::<Vec<_>>();

        runtime.shutdown();
        let total = handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .sum::<u64>();

        assert_eq!(total, (1..=16).sum::<u64>());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "root boom")]
    fn test_block_on_propagates_panic() {
        let runtime = Builder::new_local().try_build().unwrap();
        runtime.block_on(|| panic!("root boom"));
    }

    #[test]
    fn test_block_on_releases_root_holder() -> Result<()> {
        let runtime = Builder::new_local().try_build()?;
        let root = runtime
            .worker_storage(WorkerId::ROOT)
            .ok_or_else(|| anyhow!("missing root storage"))?;

        let active = runtime.block_on(|| root.len());
        assert_eq!(active, 1);
        assert!(root.is_empty());
        assert_eq!(root.stats().deregistered, 1);
        Ok(())
    }
}
