//! Global address space accesses for running tasks.
//!
//! Every mapping created by [`localize`] is recorded in the
//! [`GasHandleHolder`] of the calling task and released when the task body
//! exits, whatever the outcome of the task. [`unlocalize`] releases them
//! earlier.
//!
//! ```no_run
//! use gasrt::gas::{self, AccessFlags};
//!
//! # fn doc() -> Result<(), gas::GasError> {
//! let ptr = gas::alloc(1024, 64)?;
//!
//! let handle = gasrt::spawn(move || -> Result<Vec<u8>, gas::GasError> {
//!     let local = gas::localize(ptr, 16, AccessFlags::RWE)?;
//!     local.write(0, b"hello")?;
//!     gas::commit(&local)?;
//!     local.to_vec()
//! });
//!
//! assert!(handle.join().is_ok());
//! # Ok(())
//! # }
//! ```
use crate::context;
use crate::storage;
use std::sync::Arc;

mod errors;
pub use errors::GasError;

mod flags;
pub use flags::AccessFlags;

pub(crate) mod handle;
pub use handle::{GasHandle, GasHandleHolder, HolderId, LocalRef};

mod ptr;
pub use ptr::{GasVector, GlobalPtr};

mod space;
pub use space::{AddressSpace, GlobalSpace};

use crate::task::WorkerId;

fn address_space() -> Result<Arc<dyn AddressSpace>, GasError> {
    context::try_with_context(|cx| Arc::clone(cx.storage().address_space()))
        .ok_or(GasError::NoTaskContext)
}

/// Allocates `size` bytes of global memory, distributed across the workers
/// in blocks of `block_size` bytes.
pub fn alloc(size: usize, block_size: usize) -> Result<GlobalPtr, GasError> {
    address_space()?.alloc(size, block_size)
}

pub fn dealloc(ptr: GlobalPtr) -> Result<(), GasError> {
    address_space()?.dealloc(ptr)
}

pub fn put(ptr: GlobalPtr, bytes: &[u8]) -> Result<(), GasError> {
    address_space()?.put(ptr, bytes)
}

pub fn get(ptr: GlobalPtr, len: usize) -> Result<Vec<u8>, GasError> {
    address_space()?.get(ptr, len)
}

/// Fills `len` bytes of global memory at `ptr` with `value`.
pub fn set(ptr: GlobalPtr, value: u8, len: usize) -> Result<(), GasError> {
    address_space()?.set(ptr, value, len)
}

/// Runs `f` on the home bytes of `[ptr, ptr + len)`, atomically with respect
/// to every other access of the address space.
///
/// ```no_run
/// # fn doc(counter: gasrt::gas::GlobalPtr) -> Result<(), gasrt::gas::GasError> {
/// let previous = gasrt::gas::rmw(counter, 1, |bytes| {
///     let previous = bytes[0];
///     bytes[0] += 1;
///     previous
/// })?;
/// # Ok(())
/// # }
/// ```
pub fn rmw<R>(ptr: GlobalPtr, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, GasError> {
    let mut f = Some(f);
    let mut output = None;

    address_space()?.rmw(ptr, len, &mut |bytes: &mut [u8]| {
        output = f.take().map(|f| f(bytes));
    })?;

    Ok(output.expect("address space returned from rmw without applying it"))
}

pub fn home_of(ptr: GlobalPtr) -> Result<WorkerId, GasError> {
    address_space()?.home_of(ptr)
}

/// Address space, worker and holder of the running task.
fn task_context() -> Result<(Arc<dyn AddressSpace>, WorkerId, Arc<GasHandleHolder>), GasError> {
    let (space, worker) = context::try_with_context(|cx| {
        (Arc::clone(cx.storage().address_space()), cx.worker_id())
    })
    .ok_or(GasError::NoTaskContext)?;

    let holder = storage::current_holder().ok_or(GasError::NoTaskContext)?;
    Ok((space, worker, holder))
}

/// Maps `[ptr, ptr + len)` on the current worker.
///
/// The mapping lives until the current task body exits, or until
/// [`unlocalize`] is called from the same task.
pub fn localize(ptr: GlobalPtr, len: usize, flags: AccessFlags) -> Result<LocalRef, GasError> {
    let (space, worker, holder) = task_context()?;

    let handle = space.localize(ptr, len, flags, worker)?;
    let local = handle.local_ref();
    holder.record(handle);

    Ok(local)
}

/// Maps every range of `vectors` with the same `flags`. Either all of them
/// are mapped, or none is.
pub fn localize_v(vectors: &[GasVector], flags: AccessFlags) -> Result<Vec<LocalRef>, GasError> {
    let (space, worker, holder) = task_context()?;

    let handles = space.localize_v(vectors, flags, worker)?;
    let locals = handles.iter().map(GasHandle::local_ref).collect();
    handles.into_iter().for_each(|handle| holder.record(handle));

    Ok(locals)
}

/// Maps `rows` ranges of `row_len` bytes, `stride` bytes apart, with `count`
/// being `[rows, row_len]`. See [`GasVector::strided`].
pub fn localize_s(
    ptr: GlobalPtr,
    stride: usize,
    count: [usize; 2],
    flags: AccessFlags,
) -> Result<Vec<LocalRef>, GasError> {
    localize_v(&GasVector::strided(ptr, stride, count), flags)
}

/// Writes the local bytes of `local` back to home memory.
pub fn commit(local: &LocalRef) -> Result<(), GasError> {
    let bytes = local.to_vec()?;
    address_space()?.commit(local.ptr(), &bytes)
}

/// Commits every mapping of `locals`, as returned by [`localize_v`] or
/// [`localize_s`]. Stops at the first error.
pub fn commit_v(locals: &[LocalRef]) -> Result<(), GasError> {
    let space = address_space()?;
    locals
        .iter()
        .try_for_each(|local| space.commit(local.ptr(), &local.to_vec()?))
}

/// Releases every mapping of the current task now. The task stays registered
/// with its worker and can localize again.
///
/// Returns the number of released mappings.
pub fn unlocalize() -> Result<usize, GasError> {
    let space = address_space()?;
    let holder = storage::current_holder().ok_or(GasError::NoTaskContext)?;

    let handles = holder.drain();
    let count = handles.len();
    for handle in handles {
        space.unlocalize(handle);
    }

    Ok(count)
}
