use crate::gas::{AddressSpace, GasHandleHolder, HolderId};
use crate::task::{Id, WorkerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Violations of the registration protocol. Outside of the `try_*` methods,
/// any of these aborts the process: the registry no longer describes which
/// mappings are live.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("holder {holder} is already registered on worker {worker}")]
    AlreadyRegistered { holder: HolderId, worker: WorkerId },

    #[error("no holder is registered on worker {worker}")]
    NotRegistered { worker: WorkerId },

    #[error("deregistered holder {found} on worker {worker}, expected holder {expected}")]
    OutOfOrder {
        worker: WorkerId,
        expected: HolderId,
        found: HolderId,
    },

    #[error("storage of worker {worker} is closed")]
    Closed { worker: WorkerId },

    #[error("storage of worker {worker} used from thread {thread:?}, owned by {owner:?}")]
    ForeignThread {
        worker: WorkerId,
        owner: ThreadId,
        thread: ThreadId,
    },
}

#[track_caller]
#[cold]
pub(crate) fn fatal(err: RegistryError) -> ! {
    tracing::error!(%err, "gas handle registry corrupted, aborting");
    std::process::abort()
}

#[derive(Debug)]
struct Registration {
    holder: Arc<GasHandleHolder>,

    /// Holder that was active when this one was registered.
    parent: Option<HolderId>,

    task_id: Option<Id>,

    registered_at: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    /// Top of the holder stack.
    current: Option<HolderId>,

    entries: HashMap<HolderId, Registration>,
}

#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    deregistered: AtomicU64,
    unlocalized: AtomicU64,
}

/// Snapshot of the lifetime counters of a [`WorkerStorage`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStorageStats {
    pub registered: u64,
    pub deregistered: u64,
    pub unlocalized: u64,
}

/// Per-worker registry of the [`GasHandleHolder`]s of the tasks executing on
/// a worker.
///
/// Tasks running on a worker nest: a task that blocks on a join runs other
/// tasks on the same thread until the joined task completes. Registered
/// holders therefore form a stack, each registration linking the holder that
/// was active before it. Deregistration pops the top of that stack and
/// unlocalizes every handle recorded in it.
///
/// A `WorkerStorage` is owned by one worker and only mutated from that
/// worker's thread. The owning thread is bound on first use.
pub struct WorkerStorage {
    worker_id: WorkerId,

    space: Arc<dyn AddressSpace>,

    owner_thread: OnceLock<ThreadId>,

    registry: Mutex<Registry>,

    closed: AtomicBool,

    counters: Counters,
}

impl WorkerStorage {
    pub fn new(worker_id: WorkerId, space: Arc<dyn AddressSpace>) -> Self {
        Self {
            worker_id,
            space,
            owner_thread: OnceLock::new(),
            registry: Mutex::new(Registry::default()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    /// Pushes `holder` on top of the holder stack of this worker.
    ///
    /// # Aborts
    ///
    /// Aborts the process if the holder is already registered on any worker,
    /// if the storage is closed, or if called from another thread than the
    /// worker's.
    #[track_caller]
    pub fn register_gas_handle(&self, holder: &Arc<GasHandleHolder>) {
        if let Err(err) = self.try_register_gas_handle(holder) {
            fatal(err);
        }
    }

    pub fn try_register_gas_handle(
        &self,
        holder: &Arc<GasHandleHolder>,
    ) -> Result<(), RegistryError> {
        self.check_thread()?;

        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed {
                worker: self.worker_id,
            });
        }

        let mut registry = self.registry.lock();

        holder
            .mark_registered(self.worker_id)
            .map_err(|worker| RegistryError::AlreadyRegistered {
                holder: holder.id(),
                worker,
            })?;

        let parent = registry.current.replace(holder.id());
        registry.entries.insert(
            holder.id(),
            Registration {
                holder: Arc::clone(holder),
                parent,
                task_id: holder.owner(),
                registered_at: Instant::now(),
            },
        );

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            worker = %self.worker_id,
            holder = %holder.id(),
            parent = ?parent,
            depth = registry.entries.len(),
            "registered gas handle holder"
        );

        Ok(())
    }

    /// Pops the holder on top of the holder stack and unlocalizes every
    /// handle recorded in it. Returns the id of the released holder.
    ///
    /// # Aborts
    ///
    /// Aborts the process if no holder is registered, or if called from
    /// another thread than the worker's.
    #[track_caller]
    pub fn deregister_and_unlocalize_gas_handle(&self) -> HolderId {
        match self.try_deregister_and_unlocalize_gas_handle() {
            Ok(holder) => holder,
            Err(err) => fatal(err),
        }
    }

    pub fn try_deregister_and_unlocalize_gas_handle(&self) -> Result<HolderId, RegistryError> {
        self.check_thread()?;

        let not_registered = || RegistryError::NotRegistered {
            worker: self.worker_id,
        };

        let registration = {
            let mut registry = self.registry.lock();
            let current = registry.current.ok_or_else(not_registered)?;
            let registration = registry
                .entries
                .remove(&current)
                .ok_or_else(not_registered)?;

            registry.current = registration.parent;
            registration
        };

        let holder = registration.holder;
        holder.mark_deregistered();

        // Unlocalize outside of the registry lock, the address space may
        // block on remote state.
        let handles = holder.drain();
        let unlocalized = handles.len();
        for handle in handles {
            self.space.unlocalize(handle);
        }

        self.counters.deregistered.fetch_add(1, Ordering::Relaxed);
        self.counters
            .unlocalized
            .fetch_add(unlocalized as u64, Ordering::Relaxed);

        tracing::trace!(
            worker = %self.worker_id,
            holder = %holder.id(),
            task = ?registration.task_id,
            unlocalized,
            elapsed = ?registration.registered_at.elapsed(),
            "deregistered gas handle holder"
        );

        Ok(holder.id())
    }

    pub fn contains(&self, holder: HolderId) -> bool {
        self.registry.lock().entries.contains_key(&holder)
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().entries.is_empty()
    }

    pub fn current_holder(&self) -> Option<HolderId> {
        self.registry.lock().current
    }

    /// Registered holders, from the top of the stack down.
    pub fn active_holders(&self) -> Vec<HolderId> {
        let registry = self.registry.lock();

        std::iter::successors(registry.current, |id| {
            registry.entries.get(id).and_then(|r| r.parent)
        })
        .collect()
    }

    pub fn stats(&self) -> WorkerStorageStats {
        WorkerStorageStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            deregistered: self.counters.deregistered.load(Ordering::Relaxed),
            unlocalized: self.counters.unlocalized.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects further registrations. Called when the worker shuts down.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let remaining = self.len();
        if remaining > 0 {
            tracing::warn!(
                worker = %self.worker_id,
                remaining,
                "worker storage closed with registered holders"
            );
        }
    }

    fn check_thread(&self) -> Result<(), RegistryError> {
        let thread = thread::current().id();
        let owner = *self.owner_thread.get_or_init(|| thread);

        if owner == thread {
            Ok(())
        } else {
            Err(RegistryError::ForeignThread {
                worker: self.worker_id,
                owner,
                thread,
            })
        }
    }
}

impl fmt::Debug for WorkerStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerStorage")
            .field("worker_id", &self.worker_id)
            .field("active", &self.len())
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}
