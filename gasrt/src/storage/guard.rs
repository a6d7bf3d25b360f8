use crate::gas::{GasHandleHolder, HolderId};
use crate::storage::worker::{RegistryError, WorkerStorage, fatal};
use crate::storage::ThreadStorage;
use crate::task::Id;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Keeps a holder registered with a [`WorkerStorage`] for as long as it lives.
///
/// Dropping the guard deregisters the holder and unlocalizes its handles. The
/// guard checks that the holder it pops is the one it pushed, so guards must
/// be dropped in reverse order of creation on a worker.
#[derive(Debug)]
#[must_use = "dropping the guard deregisters the holder immediately"]
pub struct GasHandleRegistration<'a> {
    storage: &'a WorkerStorage,
    holder: HolderId,
}

impl<'a> GasHandleRegistration<'a> {
    #[track_caller]
    pub fn new(storage: &'a WorkerStorage, holder: &Arc<GasHandleHolder>) -> Self {
        storage.register_gas_handle(holder);

        Self {
            storage,
            holder: holder.id(),
        }
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }
}

impl Drop for GasHandleRegistration<'_> {
    fn drop(&mut self) {
        let found = self.storage.deregister_and_unlocalize_gas_handle();

        if found != self.holder {
            fatal(RegistryError::OutOfOrder {
                worker: self.storage.worker_id(),
                expected: self.holder,
                found,
            });
        }
    }
}

/// Runs `f` as a task body on the worker owning `storage`.
///
/// A fresh [`ThreadStorage`] is entered and its holder registered before `f`
/// runs. Once `f` returns or panics, the holder is deregistered, its handles
/// unlocalized and the thread storage dropped, in that order. Panics are
/// returned to the caller.
pub(crate) fn bracket<F, R>(storage: &WorkerStorage, owner: Option<Id>, f: F) -> thread::Result<R>
where
    F: FnOnce() -> R,
{
    let thread_storage = ThreadStorage::enter(owner);
    let registration = GasHandleRegistration::new(storage, thread_storage.holder());

    let output = panic::catch_unwind(AssertUnwindSafe(f));

    drop(registration);
    drop(thread_storage);

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::{self, AccessFlags, AddressSpace, GlobalSpace};
    use crate::storage::current_holder;
    use crate::task::WorkerId;
    use anyhow::Result;

    fn storage() -> (Arc<GlobalSpace>, WorkerStorage) {
        let space = Arc::new(GlobalSpace::new(1));
        let storage = WorkerStorage::new(WorkerId(0), space.clone());
        (space, storage)
    }

    #[test]
    fn test_bracket_registers_around_body() {
        let (_, storage) = storage();

        let seen = bracket(&storage, None, || {
            let holder = current_holder().map(|h| h.id());
            (holder, holder.map(|id| storage.contains(id)))
        });

        let Ok((Some(holder), Some(registered))) = seen else {
            panic!("body did not observe its holder");
        };

        assert!(registered);
        assert!(!storage.contains(holder));
        assert!(current_holder().is_none());
        assert_eq!(storage.stats().registered, 1);
        assert_eq!(storage.stats().deregistered, 1);
    }

    #[test]
    fn test_bracket_releases_on_panic() -> Result<()> {
        let (space, storage) = storage();
        let ptr = space.alloc(16, 16)?;

        let res: thread::Result<()> = bracket(&storage, None, || {
            let handle = space.localize(ptr, 16, AccessFlags::RWE, WorkerId(0));

            if let (Ok(handle), Some(holder)) = (handle, current_holder()) {
                holder.record(handle);
            }

            panic!("boom");
        });

        assert!(res.is_err());
        assert!(storage.is_empty());
        assert_eq!(space.live_mappings(), 0);
        assert_eq!(storage.stats().unlocalized, 1);
        Ok(())
    }

    #[test]
    fn test_nested_brackets() {
        let (_, storage) = storage();

        let depths = bracket(&storage, None, || {
            let outer = storage.len();
            let inner = bracket(&storage, None, || storage.len()).ok();
            (outer, inner, storage.len())
        });

        assert!(matches!(depths, Ok((1, Some(2), 1))));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_gas_calls_need_a_runtime() {
        let (_, storage) = storage();

        // Without a worker context the GAS layer refuses to localize, even
        // inside a bracket.
        let res = bracket(&storage, None, || gas::alloc(8, 8));
        assert!(matches!(res, Ok(Err(gas::GasError::NoTaskContext))));
    }
}
