use crate::gas::{AccessFlags, GasError, GlobalPtr};
use crate::task::{Id, WorkerId};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// Most tasks localize a handful of regions at most, keep them inline.
pub(crate) const INLINE_HANDLES: usize = 4;

pub(crate) type HandleList = SmallVec<[GasHandle; INLINE_HANDLES]>;

/// Identifies a [`GasHandleHolder`] in a worker registry.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct HolderId(NonZeroU64);

impl HolderId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique holder ID: bitspace exhausted")
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key of a cached region: a contiguous range of blocks in one segment.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) struct RegionKey {
    pub(crate) segment: GlobalPtr,
    pub(crate) first_block: usize,
    pub(crate) last_block: usize,
}

/// Local copy of a block range, shared by every mapping of that range.
pub(crate) struct LocalRegion {
    pub(crate) key: RegionKey,
    pub(crate) base: GlobalPtr,
    pub(crate) data: RwLock<Vec<u8>>,
}

impl fmt::Debug for LocalRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRegion")
            .field("key", &self.key)
            .field("base", &self.base)
            .field("len", &self.data.read().len())
            .finish()
    }
}

#[derive(Debug)]
struct Mapping {
    ptr: GlobalPtr,
    len: usize,
    flags: AccessFlags,
    region: Arc<LocalRegion>,
    live: AtomicBool,
}

impl Mapping {
    fn check_live(&self) -> Result<(), GasError> {
        if self.live.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GasError::Unlocalized(self.ptr))
        }
    }

    fn offset(&self) -> usize {
        // Mappings are always created inside their region.
        self.ptr.offset_from(self.region.base).unwrap_or_default()
    }
}

/// A localized mapping of `[ptr, ptr + len)`.
///
/// Handles are owned by the [`GasHandleHolder`] of the task that created them
/// and are not `Clone`: releasing one consumes it, so every handle is
/// unlocalized exactly once. Tasks access the mapped bytes through
/// [`LocalRef`] views.
#[derive(Debug)]
pub struct GasHandle {
    mapping: Arc<Mapping>,
}

impl GasHandle {
    pub(crate) fn new(
        ptr: GlobalPtr,
        len: usize,
        flags: AccessFlags,
        region: Arc<LocalRegion>,
    ) -> Self {
        Self {
            mapping: Arc::new(Mapping {
                ptr,
                len,
                flags,
                region,
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn ptr(&self) -> GlobalPtr {
        self.mapping.ptr
    }

    pub fn len(&self) -> usize {
        self.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    pub fn flags(&self) -> AccessFlags {
        self.mapping.flags
    }

    pub fn local_ref(&self) -> LocalRef {
        LocalRef {
            mapping: Arc::clone(&self.mapping),
        }
    }

    /// Marks every [`LocalRef`] of this handle dead and hands the region back
    /// to the address space for cache bookkeeping.
    pub(crate) fn invalidate(self) -> Arc<LocalRegion> {
        self.mapping.live.store(false, Ordering::Release);
        Arc::clone(&self.mapping.region)
    }
}

/// Byte view on a localized mapping. Every access fails with
/// [`GasError::Unlocalized`] once the mapping was released.
#[derive(Debug, Clone)]
pub struct LocalRef {
    mapping: Arc<Mapping>,
}

impl LocalRef {
    pub fn ptr(&self) -> GlobalPtr {
        self.mapping.ptr
    }

    pub fn len(&self) -> usize {
        self.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    pub fn flags(&self) -> AccessFlags {
        self.mapping.flags
    }

    pub fn is_live(&self) -> bool {
        self.mapping.live.load(Ordering::Acquire)
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, GasError> {
        let data = self.mapping.region.data.read();
        self.mapping.check_live()?;

        let start = self.mapping.offset();
        Ok(f(&data[start..start + self.mapping.len]))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, GasError> {
        self.read(<[u8]>::to_vec)
    }

    /// Writes `bytes` at `offset` in the local copy. The home memory is not
    /// updated until the bytes are committed.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), GasError> {
        if !self.mapping.flags.is_writable() {
            return Err(GasError::ReadOnly(self.mapping.ptr));
        }

        if offset
            .checked_add(bytes.len())
            .is_none_or(|end| end > self.mapping.len)
        {
            return Err(GasError::OutOfBounds {
                ptr: self.mapping.ptr.wrapping_add(offset),
                len: bytes.len(),
            });
        }

        let mut data = self.mapping.region.data.write();
        self.mapping.check_live()?;

        let start = self.mapping.offset() + offset;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

const NOT_REGISTERED: usize = usize::MAX;

/// Accumulates the handles localized by one task while it runs.
///
/// A holder is created by [`ThreadStorage`] at the start of a task body and
/// registered with the [`WorkerStorage`] of the worker running it. Once
/// deregistered, every recorded handle has been unlocalized.
///
/// [`ThreadStorage`]: crate::storage::ThreadStorage
/// [`WorkerStorage`]: crate::storage::WorkerStorage
#[derive(Debug)]
pub struct GasHandleHolder {
    id: HolderId,

    /// Task owning the holder. `None` for holders created outside the task
    /// harness.
    owner: Option<Id>,

    /// Worker on which the holder is currently registered.
    registered_on: AtomicUsize,

    handles: Mutex<HandleList>,
}

impl GasHandleHolder {
    pub fn new(owner: Option<Id>) -> Self {
        Self {
            id: HolderId::next(),
            owner,
            registered_on: AtomicUsize::new(NOT_REGISTERED),
            handles: Mutex::new(SmallVec::new()),
        }
    }

    pub fn id(&self) -> HolderId {
        self.id
    }

    pub fn owner(&self) -> Option<Id> {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub fn registered_on(&self) -> Option<WorkerId> {
        match self.registered_on.load(Ordering::Acquire) {
            NOT_REGISTERED => None,
            id => Some(WorkerId(id)),
        }
    }

    pub(crate) fn record(&self, handle: GasHandle) {
        self.handles.lock().push(handle);
    }

    pub(crate) fn drain(&self) -> HandleList {
        std::mem::take(&mut *self.handles.lock())
    }

    /// Returns the worker the holder is already registered on, if any.
    pub(crate) fn mark_registered(&self, worker: WorkerId) -> Result<(), WorkerId> {
        self.registered_on
            .compare_exchange(
                NOT_REGISTERED,
                worker.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(WorkerId)
    }

    pub(crate) fn mark_deregistered(&self) {
        self.registered_on.store(NOT_REGISTERED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_impl_all!(GasHandleHolder: Send, Sync);
    assert_impl_all!(LocalRef: Send, Sync, Clone);
    assert_not_impl_any!(GasHandle: Clone);

    fn region(bytes: &[u8]) -> Arc<LocalRegion> {
        Arc::new(LocalRegion {
            key: RegionKey {
                segment: GlobalPtr(0x1000),
                first_block: 0,
                last_block: 0,
            },
            base: GlobalPtr(0x1000),
            data: RwLock::new(bytes.to_vec()),
        })
    }

    #[test]
    fn test_local_ref_dies_with_handle() {
        let handle = GasHandle::new(GlobalPtr(0x1002), 2, AccessFlags::RWE, region(b"abcd"));
        let local = handle.local_ref();

        assert_eq!(local.to_vec(), Ok(b"cd".to_vec()));
        assert!(local.write(0, b"x").is_ok());
        assert_eq!(
            local.write(1, b"yz"),
            Err(GasError::OutOfBounds {
                ptr: GlobalPtr(0x1003),
                len: 2
            })
        );

        let region = handle.invalidate();
        assert_eq!(&*region.data.read(), b"abxd");
        assert!(!local.is_live());
        assert_eq!(local.to_vec(), Err(GasError::Unlocalized(GlobalPtr(0x1002))));
    }

    #[test]
    fn test_write_offset_overflow() {
        let handle = GasHandle::new(GlobalPtr(0x1000), 4, AccessFlags::RWE, region(b"abcd"));
        let local = handle.local_ref();

        assert!(matches!(
            local.write(usize::MAX, b"z"),
            Err(GasError::OutOfBounds { len: 1, .. })
        ));
        assert_eq!(local.to_vec(), Ok(b"abcd".to_vec()));
    }

    #[test]
    fn test_read_only_mapping() {
        let handle = GasHandle::new(GlobalPtr(0x1000), 4, AccessFlags::RO, region(b"abcd"));
        assert_eq!(
            handle.local_ref().write(0, b"z"),
            Err(GasError::ReadOnly(GlobalPtr(0x1000)))
        );
    }

    #[test]
    fn test_holder_registration_marks() {
        let holder = GasHandleHolder::new(None);
        assert_eq!(holder.registered_on(), None);

        assert!(holder.mark_registered(WorkerId(2)).is_ok());
        assert_eq!(holder.mark_registered(WorkerId(3)), Err(WorkerId(2)));
        assert_eq!(holder.registered_on(), Some(WorkerId(2)));

        holder.mark_deregistered();
        assert_eq!(holder.registered_on(), None);
    }

    #[test]
    fn test_holder_drain() {
        let holder = GasHandleHolder::new(None);
        let shared = region(b"abcd");

        for i in 0..6 {
            holder.record(GasHandle::new(
                GlobalPtr(0x1000 + i),
                1,
                AccessFlags::RO,
                Arc::clone(&shared),
            ));
        }

        assert_eq!(holder.len(), 6);
        let drained = holder.drain();
        assert_eq!(drained.len(), 6);
        assert!(holder.is_empty());
    }
}
