use crate::context::{self, Shared};
use crate::runtime::RuntimeConfig;
use crate::runtime::TaskOpts;
use crate::runtime::pool::ThreadPool;
use crate::task::{self, JoinHandle, Task};
use anyhow::{Result, anyhow};
use crossbeam_deque::Injector;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

#[derive(Debug)]
pub(crate) struct Scheduler {
    pub(crate) cfg: RuntimeConfig,

    /// Tasks spawned from threads that are not workers of this runtime.
    pub(crate) injector: Arc<Injector<Task>>,

    pub(crate) shared: Arc<Shared>,

    pub(crate) pool: OnceLock<ThreadPool>,
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(&cfg)),
            injector: Arc::new(Injector::new()),
            pool: OnceLock::new(),
            cfg,
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

impl Deref for Handle {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Handle {
    pub(crate) fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn set_pool(&self, pool: ThreadPool) -> Result<()> {
        self.pool
            .set(pool)
            .map_err(|_| anyhow!("thread pool already started"))
    }

    pub(crate) fn spawn<F, T>(
        &self,
        func: F,
        opts: Option<TaskOpts>,
        name: Option<Arc<str>>,
    ) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let opts = self.cfg.default_task_opts() | opts.unwrap_or_default();
        let (task, handle) = task::new_task(func, opts, name);

        tracing::trace!(id = %task.id(), ?opts, "spawn");
        self.schedule(task);

        handle
    }

    /// Queues `task` on the current worker when called from this runtime, on
    /// the global injector otherwise.
    pub(crate) fn schedule(&self, task: Task) {
        match context::current_worker_of(self) {
            Some(worker) => worker.add_task(task),
            None => self.injector.push(task),
        }

        self.shared.unpark_one_thread();
    }
}
