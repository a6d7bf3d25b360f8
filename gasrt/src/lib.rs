//! A task runtime for global address space (GAS) programs.
//!
//! Tasks are plain functions spawned with their arguments and joined for
//! their result. While a task runs, every GAS mapping it localizes is tracked
//! by its worker and released when the task body exits, whether it returned
//! or panicked.
//!
//! ```
//! use gasrt::gas::{self, AccessFlags};
//!
//! fn checksum(ptr: gas::GlobalPtr, len: usize) -> Result<u64, gas::GasError> {
//!     let local = gas::localize(ptr, len, AccessFlags::RO)?;
//!     local.read(|bytes| bytes.iter().map(|b| u64::from(*b)).sum())
//! }
//!
//! #[gasrt::main(flavor = "stealing", worker_threads = 2)]
//! fn main() {
//!     let ptr = gas::alloc(4, 4).unwrap();
//!     gas::put(ptr, &[1, 2, 3, 4]).unwrap();
//!
//!     let handle = gasrt::spawn_with(checksum, (ptr, 4));
//!     assert_eq!(handle.join().unwrap(), Ok(10));
//! }
//! ```
#[doc(inline)]
pub use gasrt_macros::main;

#[doc(inline)]
pub use gasrt_macros::test;

mod context;

pub mod gas;

pub mod runtime;
pub use runtime::{spawn, spawn_builder, spawn_with};

pub mod storage;

pub mod task;

mod utils;

#[cfg(test)]
mod test_utils;
