//! Task spawn and join.
//!
//! A task is a function and its arguments, moved into the runtime at spawn
//! time and run once by a worker. Every task body is bracketed: a
//! [`ThreadStorage`] is entered and its GAS handle holder registered with the
//! worker before the function runs, and the holder is deregistered and its
//! mappings unlocalized after it returns or panics, before the output becomes
//! visible through the [`JoinHandle`].
//!
//! [`ThreadStorage`]: crate::storage::ThreadStorage

mod args;
pub use args::Apply;

mod error;
pub use error::JoinError;

mod harness;

mod id;
pub(crate) use id::TaskIdGuard;
pub use id::{Id, ROOT_TASK_ID, WorkerId, id, try_id};

mod join;
pub use join::JoinHandle;

mod raw;
pub(crate) use raw::{Task, new_task};

mod state;
pub use state::TaskState;
