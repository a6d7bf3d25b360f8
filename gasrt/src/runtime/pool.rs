use crate::context;
use crate::runtime::scheduler::Handle;
use crate::runtime::worker::Worker;
use crate::storage::WorkerStorage;
use crate::task::WorkerId;
use anyhow::{Context, Result, anyhow};
use crossbeam_deque::Worker as CbWorker;
use parking_lot::Mutex;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;

/// The worker threads of a runtime.
///
/// The root worker is the *current thread*, the one used to create the runtime
/// and to call `block_on`. It is built here with the others so that every
/// worker can steal from every other one, but it is handed back to the caller
/// instead of getting a thread.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    pub(super) handles: Mutex<Vec<(WorkerId, thread::JoinHandle<()>)>>,
}

impl ThreadPool {
    /// Starts the pool threads and returns the root worker with the pool.
    /// Returns once every pool worker is registered with the runtime.
    pub(crate) fn new(scheduler: &Handle) -> Result<(Worker, ThreadPool)> {
        let num_workers = scheduler.cfg.num_workers();
        let space = &scheduler.cfg.address_space;

        // Create Crossbeam LIFO queues and their stealers
        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_lifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let mut workers = local_queues
            .into_iter()
            .enumerate()
            .map(|(i, local_queue)| {
                // Give each worker a list of all *other* workers' stealers
                let other_stealers = stealers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, s)| s.clone())
                    .collect::<Vec<_>>();

                let storage = Arc::new(WorkerStorage::new(WorkerId(i), Arc::clone(space)));

                Worker::new(
                    &scheduler.cfg,
                    storage,
                    Arc::clone(&scheduler.injector),
                    local_queue,
                    other_stealers,
                )
            })
            .collect::<Vec<_>>();

        let root = workers.remove(0);
        debug_assert!(root.id().is_root());

        let pool = ThreadPool {
            handles: Mutex::new(Vec::with_capacity(workers.len())),
        };

        // Spawning threads is async, wait for all threads to be registered.
        let (ready_tx, ready_rx) = mpsc::channel();
        for worker in workers {
            let id = worker.id();
            match spawn_worker_thread(scheduler.clone(), worker, ready_tx.clone()) {
                Ok(handle) => pool.handles.lock().push((id, handle)),
                Err(e) => {
                    pool.abort(scheduler);
                    return Err(e);
                }
            }
        }
        drop(ready_tx);

        for _ in 0..pool.len() {
            if let Err(e) = ready_rx.recv().map_err(anyhow::Error::from).and_then(|r| r) {
                pool.abort(scheduler);
                return Err(e.context("worker thread failed to start"));
            }
        }

        Ok((root, pool))
    }

    fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Stops the threads started so far when the pool can't be completed.
    fn abort(&self, scheduler: &Handle) {
        scheduler.shared.shutdown.store(true, Ordering::Release);
        scheduler.shared.unpark_all_threads();

        if let Err(e) = self.join_all() {
            tracing::error!(error = ?e, "failed to stop worker threads");
        }
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let errors = handles
            .into_iter()
            .filter_map(|(id, handle)| handle.join().err().map(|_| id))
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} worker thread(s) panicked: {:?}",
                errors.len(),
                errors
            ))
        }
    }
}

fn spawn_worker_thread(
    scheduler: Handle,
    worker: Worker,
    ready: mpsc::Sender<Result<()>>,
) -> Result<thread::JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(scheduler.cfg.thread_name.0());

    if let Some(stack_size) = scheduler.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let id = worker.id();
    builder
        .spawn(move || {
            let registered = scheduler
                .shared
                .register_worker(thread::current().id(), worker.storage());

            let failed = registered.is_err();
            let _ = ready.send(registered);
            if failed {
                return;
            }

            let worker = Rc::new(worker);
            let _guard = context::enter(Rc::clone(&worker), scheduler.clone());

            tracing::debug!(worker = %worker.id(), "worker started");
            worker.event_loop(&scheduler.shared);
        })
        .with_context(|| format!("failed to spawn thread for worker {}", id))
}
