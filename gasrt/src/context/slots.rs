use crate::storage::WorkerStorage;
use crate::task::WorkerId;
use anyhow::{Context, Result, anyhow};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::ThreadId;

#[derive(Debug, Clone)]
pub(crate) struct WorkerData {
    pub(crate) storage: Arc<WorkerStorage>,

    pub(crate) should_unpark: Arc<AtomicBool>,
}

impl WorkerData {
    fn new(storage: Arc<WorkerStorage>) -> Self {
        Self {
            storage,
            should_unpark: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Per-worker data shared across the runtime. Slots are indexed by
/// [`WorkerId`], and threads are mapped to their worker when they register.
/// Both are written once per worker at startup, every other access takes a
/// read lock and is uncontended.
#[derive(Debug)]
pub(crate) struct WorkerSlots {
    slots: RwLock<Vec<Option<WorkerData>>>,

    /// Maps a `ThreadId` to its worker.
    mapping: RwLock<HashMap<ThreadId, WorkerId>>,
}

impl WorkerSlots {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; num_workers]),
            mapping: RwLock::new(HashMap::with_capacity(num_workers)),
        }
    }

    #[track_caller]
    pub(crate) fn with_data<F, R>(&self, thread_id: &ThreadId, f: F) -> R
    where
        F: FnOnce(&WorkerData) -> R,
    {
        let slot = self.get(thread_id).expect("slot uninitialized");
        f(&slot)
    }

    fn get(&self, thread_id: &ThreadId) -> Result<MappedRwLockReadGuard<'_, WorkerData>> {
        let worker = self
            .mapping
            .read()
            .get(thread_id)
            .copied()
            .with_context(|| format!("ThreadId {:?} not found", thread_id))?;

        RwLockReadGuard::try_map(self.slots.read(), |slots| slots[worker.0].as_ref())
            .map_err(|_| anyhow!("Worker {} not registered", worker))
    }

    pub(crate) fn register(&self, thread_id: ThreadId, storage: &Arc<WorkerStorage>) -> Result<()> {
        let worker = storage.worker_id();
        let mut slots = self.slots.write();

        let slot = slots
            .get_mut(worker.0)
            .with_context(|| format!("Worker {} has no slot", worker))?;

        if slot.is_some() {
            return Err(anyhow!("Worker {} already registered", worker));
        }

        if self.mapping.write().insert(thread_id, worker).is_some() {
            return Err(anyhow!("ThreadId {:?} already registered", thread_id));
        }

        *slot = Some(WorkerData::new(Arc::clone(storage)));
        Ok(())
    }

    pub(crate) fn storage(&self, worker: WorkerId) -> Option<Arc<WorkerStorage>> {
        self.slots
            .read()
            .get(worker.0)
            .and_then(|slot| slot.as_ref())
            .map(|data| Arc::clone(&data.storage))
    }

    pub(crate) fn storages(&self) -> Vec<Arc<WorkerStorage>> {
        self.slots
            .read()
            .iter()
            .flatten()
            .map(|data| Arc::clone(&data.storage))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::GlobalSpace;
    use std::thread;

    fn storage(worker: usize) -> Arc<WorkerStorage> {
        Arc::new(WorkerStorage::new(
            WorkerId(worker),
            Arc::new(GlobalSpace::new(1)),
        ))
    }

    #[test]
    fn test_register_and_lookup() -> Result<()> {
        let slots = WorkerSlots::new(2);
        let thread_id = thread::current().id();

        slots.register(thread_id, &storage(1))?;
        assert_eq!(slots.with_data(&thread_id, |data| data.storage.worker_id()), WorkerId(1));
        assert!(slots.storage(WorkerId(0)).is_none());
        assert_eq!(slots.storages().len(), 1);
        assert_eq!(slots.len(), 2);
        Ok(())
    }

    #[test]
    fn test_register_errors() -> Result<()> {
        let slots = WorkerSlots::new(2);
        let thread_id = thread::current().id();

        slots.register(thread_id, &storage(0))?;
        assert!(slots.register(thread_id, &storage(1)).is_err());
        assert!(slots.register(thread_id, &storage(0)).is_err());
        assert!(slots.register(thread_id, &storage(2)).is_err());
        Ok(())
    }
}
