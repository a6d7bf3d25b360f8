use crate::gas::{AccessFlags, AddressSpace, GasError, GasHandle, GlobalPtr, GlobalSpace};
use crate::task::WorkerId;
use dashmap::DashMap;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Localize,
    Unlocalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub(crate) ptr: GlobalPtr,
    pub(crate) worker: Option<WorkerId>,
    pub(crate) thread: ThreadId,
}

/// A [`GlobalSpace`] recording every localize and unlocalize call.
#[derive(Debug)]
pub(crate) struct SpySpace {
    inner: GlobalSpace,
    calls: DashMap<Method, Vec<Call>>,
}

impl SpySpace {
    pub(crate) fn new(num_homes: usize) -> Self {
        Self {
            inner: GlobalSpace::new(num_homes),
            calls: DashMap::new(),
        }
    }

    fn record(&self, method: Method, ptr: GlobalPtr, worker: Option<WorkerId>) {
        self.calls.entry(method).or_default().push(Call {
            ptr,
            worker,
            thread: thread::current().id(),
        });
    }

    pub(crate) fn get_calls(&self, method: Method) -> Vec<Call> {
        self.calls
            .get(&method)
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub(crate) fn num_calls(&self, method: Method) -> usize {
        self.calls.get(&method).map_or(0, |calls| calls.len())
    }
}

impl AddressSpace for SpySpace {
    fn alloc(&self, size: usize, block_size: usize) -> Result<GlobalPtr, GasError> {
        self.inner.alloc(size, block_size)
    }

    fn dealloc(&self, ptr: GlobalPtr) -> Result<(), GasError> {
        self.inner.dealloc(ptr)
    }

    fn put(&self, ptr: GlobalPtr, bytes: &[u8]) -> Result<(), GasError> {
        self.inner.put(ptr, bytes)
    }

    fn get(&self, ptr: GlobalPtr, len: usize) -> Result<Vec<u8>, GasError> {
        self.inner.get(ptr, len)
    }

    fn set(&self, ptr: GlobalPtr, value: u8, len: usize) -> Result<(), GasError> {
        self.inner.set(ptr, value, len)
    }

    fn rmw(
        &self,
        ptr: GlobalPtr,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), GasError> {
        self.inner.rmw(ptr, len, f)
    }

    fn localize(
        &self,
        ptr: GlobalPtr,
        len: usize,
        flags: AccessFlags,
        worker: WorkerId,
    ) -> Result<GasHandle, GasError> {
        let handle = self.inner.localize(ptr, len, flags, worker)?;
        self.record(Method::Localize, ptr, Some(worker));
        Ok(handle)
    }

    fn commit(&self, ptr: GlobalPtr, bytes: &[u8]) -> Result<(), GasError> {
        self.inner.commit(ptr, bytes)
    }

    fn unlocalize(&self, handle: GasHandle) {
        self.record(Method::Unlocalize, handle.ptr(), None);
        self.inner.unlocalize(handle);
    }

    fn home_of(&self, ptr: GlobalPtr) -> Result<WorkerId, GasError> {
        self.inner.home_of(ptr)
    }

    fn live_mappings(&self) -> usize {
        self.inner.live_mappings()
    }
}
