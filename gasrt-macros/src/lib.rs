#![warn(missing_docs, unreachable_pub)]

//! Attribute macros running a function as the root task of a gasrt runtime.
//!
//! Both macros take a synchronous function without arguments, build a
//! runtime with `gasrt::runtime::Builder` and run the function body through
//! `Runtime::block_on`. The body is therefore a task like any other: it has
//! its own GAS handle holder, registered with the root worker, and every
//! mapping it localizes is released when it returns.
//!
//! Arguments:
//!
//! - `flavor = "local" | "stealing"`: `local` runs every task on the calling
//!   thread, `stealing` adds a pool of worker threads.
//! - `worker_threads = N`: size of the pool, `stealing` only. Defaults to the
//!   available parallelism.

mod entry;
mod parse;

use entry::Entry;

/// Runs `main` as the root task of a new runtime, `stealing` by default.
///
/// ```no_run
/// #[gasrt::main(worker_threads = 4)]
/// fn main() {
///     let handle = gasrt::spawn_with(|a: u32, b: u32| a * b, (6, 7));
///     assert_eq!(handle.join().unwrap(), 42);
/// }
/// ```
///
/// expands to
///
/// ```no_run
/// fn main() {
///     let body = move || {
///         let handle = gasrt::spawn_with(|a: u32, b: u32| a * b, (6, 7));
///         assert_eq!(handle.join().unwrap(), 42);
///     };
///     let runtime = gasrt::runtime::Builder::new_stealing()
///         .worker_threads(4)
///         .try_build()
///         .expect("failed to build the gasrt runtime");
///     runtime.block_on(body)
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::expand(Entry::Main, args.into(), item.into()).into()
}

/// Runs a test function as the root task of its own runtime, `local` by
/// default.
///
/// ```no_run
/// #[gasrt::test(flavor = "stealing", worker_threads = 2)]
/// fn sums() -> Result<(), gasrt::task::JoinError> {
///     assert_eq!(gasrt::spawn(|| 1 + 2).join()?, 3);
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::expand(Entry::Test, args.into(), item.into()).into()
}
