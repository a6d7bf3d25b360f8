use crate::gas::handle::{LocalRegion, RegionKey};
use crate::gas::{AccessFlags, GasError, GasHandle, GasVector, GlobalPtr};
use crate::task::WorkerId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// The global address space collaborator of the runtime.
///
/// Workers only ever call [`unlocalize`] on it, when a task holder is
/// deregistered. Everything else is reached by tasks through the functions
/// in [`crate::gas`].
///
/// [`unlocalize`]: AddressSpace::unlocalize
pub trait AddressSpace: Send + Sync + fmt::Debug {
    /// Allocates `size` bytes distributed in blocks of `block_size` bytes.
    fn alloc(&self, size: usize, block_size: usize) -> Result<GlobalPtr, GasError>;

    /// Frees the segment starting at `ptr`.
    fn dealloc(&self, ptr: GlobalPtr) -> Result<(), GasError>;

    /// One-sided write to home memory.
    fn put(&self, ptr: GlobalPtr, bytes: &[u8]) -> Result<(), GasError>;

    /// One-sided read from home memory.
    fn get(&self, ptr: GlobalPtr, len: usize) -> Result<Vec<u8>, GasError>;

    /// Fills `[ptr, ptr + len)` of home memory with `value`.
    fn set(&self, ptr: GlobalPtr, value: u8, len: usize) -> Result<(), GasError> {
        self.put(ptr, &vec![value; len])
    }

    /// Atomic read-modify-write of `[ptr, ptr + len)` in home memory. On
    /// success `f` was called exactly once, with no other access to these
    /// bytes in between.
    fn rmw(
        &self,
        ptr: GlobalPtr,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), GasError>;

    /// Maps `[ptr, ptr + len)` locally on behalf of `worker`.
    fn localize(
        &self,
        ptr: GlobalPtr,
        len: usize,
        flags: AccessFlags,
        worker: WorkerId,
    ) -> Result<GasHandle, GasError>;

    /// Maps every range of `vectors`, all or nothing: on error, the ranges
    /// mapped so far are released before returning.
    fn localize_v(
        &self,
        vectors: &[GasVector],
        flags: AccessFlags,
        worker: WorkerId,
    ) -> Result<Vec<GasHandle>, GasError> {
        let mut handles = Vec::with_capacity(vectors.len());

        for vector in vectors {
            match self.localize(vector.ptr, vector.len, flags, worker) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    handles.into_iter().for_each(|handle| self.unlocalize(handle));
                    return Err(err);
                }
            }
        }

        Ok(handles)
    }

    /// Writes `bytes` back to home memory.
    fn commit(&self, ptr: GlobalPtr, bytes: &[u8]) -> Result<(), GasError>;

    /// Releases a mapping created by [`AddressSpace::localize`].
    fn unlocalize(&self, handle: GasHandle);

    fn home_of(&self, ptr: GlobalPtr) -> Result<WorkerId, GasError>;

    /// Number of handles localized and not yet unlocalized.
    fn live_mappings(&self) -> usize;
}

// Segments are aligned and separated by at least one unmapped page so that an
// overflowing address never lands in the next segment.
const SEGMENT_ALIGN: u64 = 4096;

struct Segment {
    base: GlobalPtr,
    size: usize,
    block_size: usize,

    /// Home worker of each block.
    homes: Vec<AtomicUsize>,

    data: RwLock<Vec<u8>>,
}

impl Segment {
    fn end(&self) -> u64 {
        self.base.0 + self.size as u64
    }

    /// Returns the offset of `ptr` in the segment if `[ptr, ptr + len)` fits.
    fn check(&self, ptr: GlobalPtr, len: usize) -> Result<usize, GasError> {
        ptr.offset_from(self.base)
            .filter(|offset| offset.checked_add(len).is_some_and(|end| end <= self.size))
            .ok_or(GasError::OutOfBounds { ptr, len })
    }

    fn block_of(&self, offset: usize) -> usize {
        offset / self.block_size
    }

    fn block_range(&self, first: usize, last: usize) -> (usize, usize) {
        (
            first * self.block_size,
            ((last + 1) * self.block_size).min(self.size),
        )
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[derive(Debug)]
struct CacheEntry {
    region: Arc<LocalRegion>,
    refs: usize,
}

/// In-process global address space.
///
/// Every worker of the runtime is the home of some blocks. Localized regions
/// are cached and reference counted per block range: [`AccessFlags::RO`] and
/// [`AccessFlags::RWE`] reuse a cached copy, [`AccessFlags::RWS`] refreshes
/// it from home memory and [`AccessFlags::OWN`] migrates the home of the
/// covered blocks to the localizing worker.
#[derive(Debug)]
pub struct GlobalSpace {
    num_homes: usize,

    next_addr: AtomicU64,

    segments: RwLock<BTreeMap<GlobalPtr, Arc<Segment>>>,

    cache: DashMap<RegionKey, CacheEntry>,

    live: AtomicUsize,
}

impl GlobalSpace {
    pub fn new(num_homes: usize) -> Self {
        Self {
            num_homes: num_homes.max(1),
            next_addr: AtomicU64::new(SEGMENT_ALIGN),
            segments: RwLock::new(BTreeMap::new()),
            cache: DashMap::new(),
            live: AtomicUsize::new(0),
        }
    }

    pub fn num_homes(&self) -> usize {
        self.num_homes
    }

    /// Number of block ranges currently cached locally.
    pub fn cached_regions(&self) -> usize {
        self.cache.len()
    }

    fn segment(&self, ptr: GlobalPtr) -> Result<Arc<Segment>, GasError> {
        if ptr.is_null() {
            return Err(GasError::NullPointer);
        }

        self.segments
            .read()
            .range(..=ptr)
            .next_back()
            .filter(|(_, segment)| ptr.0 < segment.end())
            .map(|(_, segment)| Arc::clone(segment))
            .ok_or(GasError::UnknownSegment(ptr))
    }

    fn load_region(segment: &Segment, first: usize, last: usize) -> Vec<u8> {
        let (start, end) = segment.block_range(first, last);
        segment.data.read()[start..end].to_vec()
    }
}

impl AddressSpace for GlobalSpace {
    fn alloc(&self, size: usize, block_size: usize) -> Result<GlobalPtr, GasError> {
        if size == 0 || block_size == 0 {
            return Err(GasError::ZeroSized);
        }

        let reserved = (size as u64).div_ceil(SEGMENT_ALIGN) * SEGMENT_ALIGN + SEGMENT_ALIGN;
        let base = GlobalPtr(self.next_addr.fetch_add(reserved, Ordering::Relaxed));

        let num_blocks = size.div_ceil(block_size);
        let segment = Segment {
            base,
            size,
            block_size,
            homes: (0..num_blocks)
                .map(|block| AtomicUsize::new(block % self.num_homes))
                .collect(),
            data: RwLock::new(vec![0; size]),
        };

        self.segments.write().insert(base, Arc::new(segment));
        tracing::debug!(%base, size, block_size, num_blocks, "allocated segment");

        Ok(base)
    }

    fn dealloc(&self, ptr: GlobalPtr) -> Result<(), GasError> {
        let mut segments = self.segments.write();
        if !segments.contains_key(&ptr) {
            return Err(GasError::UnknownSegment(ptr));
        }

        let live = self
            .cache
            .iter()
            .filter(|entry| entry.key().segment == ptr)
            .map(|entry| entry.refs)
            .sum::<usize>();

        if live > 0 {
            return Err(GasError::SegmentInUse { base: ptr, live });
        }

        self.cache.retain(|key, _| key.segment != ptr);
        segments.remove(&ptr);
        tracing::debug!(base = %ptr, "freed segment");

        Ok(())
    }

    fn put(&self, ptr: GlobalPtr, bytes: &[u8]) -> Result<(), GasError> {
        let segment = self.segment(ptr)?;
        let offset = segment.check(ptr, bytes.len())?;

        segment.data.write()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn get(&self, ptr: GlobalPtr, len: usize) -> Result<Vec<u8>, GasError> {
        let segment = self.segment(ptr)?;
        let offset = segment.check(ptr, len)?;

        Ok(segment.data.read()[offset..offset + len].to_vec())
    }

    fn set(&self, ptr: GlobalPtr, value: u8, len: usize) -> Result<(), GasError> {
        let segment = self.segment(ptr)?;
        let offset = segment.check(ptr, len)?;

        segment.data.write()[offset..offset + len].fill(value);
        Ok(())
    }

    fn rmw(
        &self,
        ptr: GlobalPtr,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), GasError> {
        let segment = self.segment(ptr)?;
        let offset = segment.check(ptr, len)?;

        f(&mut segment.data.write()[offset..offset + len]);
        Ok(())
    }

    fn localize(
        &self,
        ptr: GlobalPtr,
        len: usize,
        flags: AccessFlags,
        worker: WorkerId,
    ) -> Result<GasHandle, GasError> {
        let flags = flags.validate()?;
        if len == 0 {
            return Err(GasError::ZeroSized);
        }

        let segment = self.segment(ptr)?;
        let offset = segment.check(ptr, len)?;
        let first = segment.block_of(offset);
        let last = segment.block_of(offset + len - 1);

        if flags.takes_ownership() {
            let home = worker.0 % self.num_homes;
            for block in first..=last {
                segment.homes[block].store(home, Ordering::Release);
            }
        }

        let key = RegionKey {
            segment: segment.base,
            first_block: first,
            last_block: last,
        };

        let region = match self.cache.entry(key) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.refs += 1;

                if flags.refreshes() {
                    let fresh = Self::load_region(&segment, first, last);
                    entry.region.data.write().copy_from_slice(&fresh);
                }

                Arc::clone(&entry.region)
            }
            Entry::Vacant(entry) => {
                let (start, _) = segment.block_range(first, last);
                let region = Arc::new(LocalRegion {
                    key,
                    base: segment.base + start,
                    data: RwLock::new(Self::load_region(&segment, first, last)),
                });

                entry.insert(CacheEntry {
                    region: Arc::clone(&region),
                    refs: 1,
                });
                region
            }
        };

        self.live.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(%ptr, len, ?flags, %worker, "localized");

        Ok(GasHandle::new(ptr, len, flags, region))
    }

    fn commit(&self, ptr: GlobalPtr, bytes: &[u8]) -> Result<(), GasError> {
        self.put(ptr, bytes)
    }

    fn unlocalize(&self, handle: GasHandle) {
        let ptr = handle.ptr();
        let region = handle.invalidate();

        if let Entry::Occupied(mut entry) = self.cache.entry(region.key)
            && Arc::ptr_eq(&entry.get().region, &region)
        {
            let cached = entry.get_mut();
            cached.refs -= 1;
            if cached.refs == 0 {
                entry.remove();
            }
        }

        self.live.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(%ptr, "unlocalized");
    }

    fn home_of(&self, ptr: GlobalPtr) -> Result<WorkerId, GasError> {
        let segment = self.segment(ptr)?;
        let offset = segment.check(ptr, 0)?;
        let block = segment.block_of(offset);

        Ok(WorkerId(segment.homes[block].load(Ordering::Acquire)))
    }

    fn live_mappings(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(GlobalSpace: Send, Sync, AddressSpace);

    const W0: WorkerId = WorkerId(0);

    #[test]
    fn test_alloc_distributes_blocks_round_robin() -> Result<()> {
        let space = GlobalSpace::new(3);
        let ptr = space.alloc(64, 16)?;

        let homes = (0..4)
            .map(|block| space.home_of(ptr + block * 16))
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(homes, vec![WorkerId(0), WorkerId(1), WorkerId(2), WorkerId(0)]);
        Ok(())
    }

    #[test]
    fn test_segments_do_not_overlap() -> Result<()> {
        let space = GlobalSpace::new(1);
        let a = space.alloc(100, 10)?;
        let b = space.alloc(100, 10)?;

        assert!(b.addr() >= a.addr() + 100 + SEGMENT_ALIGN);
        assert_eq!(
            space.get(a + 100, 1),
            Err(GasError::UnknownSegment(a + 100))
        );
        Ok(())
    }

    #[rstest]
    #[case::null(GlobalPtr::NULL, 1, GasError::NullPointer)]
    #[case::unknown(GlobalPtr(1), 1, GasError::UnknownSegment(GlobalPtr(1)))]
    fn test_get_errors(#[case] ptr: GlobalPtr, #[case] len: usize, #[case] expected: GasError) {
        let space = GlobalSpace::new(1);
        assert_eq!(space.get(ptr, len), Err(expected));
    }

    #[test]
    fn test_put_get_and_bounds() -> Result<()> {
        let space = GlobalSpace::new(2);
        let ptr = space.alloc(8, 4)?;

        space.put(ptr + 2, b"hey")?;
        assert_eq!(space.get(ptr, 8)?, b"\0\0hey\0\0\0".to_vec());
        assert_eq!(
            space.put(ptr + 6, b"hey"),
            Err(GasError::OutOfBounds { ptr: ptr + 6, len: 3 })
        );
        Ok(())
    }

    #[test]
    fn test_huge_length_is_out_of_bounds() -> Result<()> {
        let space = GlobalSpace::new(1);
        let ptr = space.alloc(16, 8)?;

        assert_eq!(
            space.get(ptr + 4, usize::MAX),
            Err(GasError::OutOfBounds { ptr: ptr + 4, len: usize::MAX })
        );
        assert_eq!(
            space.localize(ptr + 1, usize::MAX, AccessFlags::RO, W0).err(),
            Some(GasError::OutOfBounds { ptr: ptr + 1, len: usize::MAX })
        );
        Ok(())
    }

    #[test]
    fn test_set_fills_home_memory() -> Result<()> {
        let space = GlobalSpace::new(2);
        let ptr = space.alloc(8, 4)?;

        space.set(ptr + 2, 0xab, 4)?;
        assert_eq!(space.get(ptr, 8)?, vec![0, 0, 0xab, 0xab, 0xab, 0xab, 0, 0]);
        assert_eq!(
            space.set(ptr + 6, 0, 4),
            Err(GasError::OutOfBounds { ptr: ptr + 6, len: 4 })
        );
        Ok(())
    }

    #[test]
    fn test_rmw_is_atomic() -> Result<()> {
        const THREADS: u64 = 4;
        const INCREMENTS: u64 = 250;

        let space = GlobalSpace::new(1);
        let ptr = space.alloc(8, 8)?;

        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..INCREMENTS {
                        space.rmw(ptr, 8, &mut |bytes: &mut [u8]| {
                            let mut word = [0; 8];
                            word.copy_from_slice(bytes);
                            bytes.copy_from_slice(&(u64::from_le_bytes(word) + 1).to_le_bytes());
                        })?;
                    }
                    Ok::<_, GasError>(())
                });
            }
        });

        let mut word = [0; 8];
        word.copy_from_slice(&space.get(ptr, 8)?);
        assert_eq!(u64::from_le_bytes(word), THREADS * INCREMENTS);
        Ok(())
    }

    #[test]
    fn test_localize_v_is_all_or_nothing() -> Result<()> {
        let space = GlobalSpace::new(2);
        let ptr = space.alloc(64, 16)?;

        let vectors = [
            GasVector::new(ptr, 8),
            GasVector::new(ptr + 32, 8),
            GasVector::new(ptr + 60, 8),
        ];
        assert_eq!(
            space.localize_v(&vectors, AccessFlags::RO, W0).err(),
            Some(GasError::OutOfBounds { ptr: ptr + 60, len: 8 })
        );
        assert_eq!(space.live_mappings(), 0);
        assert_eq!(space.cached_regions(), 0);

        let handles = space.localize_v(&vectors[..2], AccessFlags::RO, W0)?;
        assert_eq!(handles.len(), 2);
        assert_eq!(space.live_mappings(), 2);

        handles.into_iter().for_each(|handle| space.unlocalize(handle));
        assert_eq!(space.live_mappings(), 0);
        Ok(())
    }

    #[test]
    fn test_localize_strided_rows() -> Result<()> {
        let space = GlobalSpace::new(2);
        let ptr = space.alloc(4 * 8, 8)?;
        for row in 0..4u8 {
            space.set(ptr + usize::from(row) * 8, row, 8)?;
        }

        // Column of the first two bytes of every other row.
        let rows = GasVector::strided(ptr, 16, [2, 2]);
        let handles = space.localize_v(&rows, AccessFlags::RO, W0)?;

        let bytes = handles
            .iter()
            .map(|handle| handle.local_ref().to_vec())
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(bytes, vec![vec![0, 0], vec![2, 2]]);

        handles.into_iter().for_each(|handle| space.unlocalize(handle));
        Ok(())
    }

    #[test]
    fn test_localize_reuses_cached_region() -> Result<()> {
        let space = GlobalSpace::new(2);
        let ptr = space.alloc(32, 8)?;
        space.put(ptr, b"old")?;

        let first = space.localize(ptr, 3, AccessFlags::RO, W0)?;
        space.put(ptr, b"new")?;
        let second = space.localize(ptr, 3, AccessFlags::REUSE, W0)?;

        // Both mappings share the stale cached copy.
        assert_eq!(second.local_ref().to_vec()?, b"old".to_vec());
        assert_eq!(space.cached_regions(), 1);
        assert_eq!(space.live_mappings(), 2);

        space.unlocalize(first);
        assert_eq!(space.cached_regions(), 1);

        space.unlocalize(second);
        assert_eq!(space.cached_regions(), 0);
        assert_eq!(space.live_mappings(), 0);
        Ok(())
    }

    #[test]
    fn test_rws_refreshes_cached_region() -> Result<()> {
        let space = GlobalSpace::new(2);
        let ptr = space.alloc(32, 8)?;
        space.put(ptr, b"old")?;

        let stale = space.localize(ptr, 3, AccessFlags::RO, W0)?;
        space.put(ptr, b"new")?;
        let fresh = space.localize(ptr, 3, AccessFlags::UPDATE, W0)?;

        assert_eq!(fresh.local_ref().to_vec()?, b"new".to_vec());
        assert_eq!(stale.local_ref().to_vec()?, b"new".to_vec());

        space.unlocalize(stale);
        space.unlocalize(fresh);
        Ok(())
    }

    #[test]
    fn test_rwe_write_then_commit() -> Result<()> {
        let space = GlobalSpace::new(2);
        let ptr = space.alloc(16, 4)?;

        let handle = space.localize(ptr + 4, 4, AccessFlags::RWE, W0)?;
        let local = handle.local_ref();
        local.write(0, b"abcd")?;

        // Local writes are invisible at home until committed.
        assert_eq!(space.get(ptr + 4, 4)?, vec![0; 4]);

        space.commit(local.ptr(), &local.to_vec()?)?;
        assert_eq!(space.get(ptr + 4, 4)?, b"abcd".to_vec());

        space.unlocalize(handle);
        assert!(!local.is_live());
        Ok(())
    }

    #[test]
    fn test_own_migrates_home() -> Result<()> {
        let space = GlobalSpace::new(4);
        let ptr = space.alloc(64, 16)?;
        assert_eq!(space.home_of(ptr + 16)?, WorkerId(1));

        // Spans blocks 1 and 2.
        let handle = space.localize(ptr + 20, 20, AccessFlags::RO | AccessFlags::OWN, WorkerId(3))?;

        assert_eq!(space.home_of(ptr)?, WorkerId(0));
        assert_eq!(space.home_of(ptr + 16)?, WorkerId(3));
        assert_eq!(space.home_of(ptr + 32)?, WorkerId(3));
        assert_eq!(space.home_of(ptr + 48)?, WorkerId(3));

        space.unlocalize(handle);
        Ok(())
    }

    #[test]
    fn test_localize_rejects_invalid_flags() -> Result<()> {
        let space = GlobalSpace::new(1);
        let ptr = space.alloc(8, 8)?;

        assert_eq!(
            space.localize(ptr, 8, AccessFlags::OWN, W0).err(),
            Some(GasError::InvalidFlags(AccessFlags::OWN))
        );
        assert_eq!(space.live_mappings(), 0);
        Ok(())
    }

    #[test]
    fn test_dealloc_with_live_mappings() -> Result<()> {
        let space = GlobalSpace::new(1);
        let ptr = space.alloc(8, 8)?;
        let handle = space.localize(ptr, 8, AccessFlags::RO, W0)?;

        assert_eq!(
            space.dealloc(ptr),
            Err(GasError::SegmentInUse { base: ptr, live: 1 })
        );

        space.unlocalize(handle);
        space.dealloc(ptr)?;
        assert_eq!(space.get(ptr, 1), Err(GasError::UnknownSegment(ptr)));
        assert_eq!(space.dealloc(ptr), Err(GasError::UnknownSegment(ptr)));
        Ok(())
    }
}
