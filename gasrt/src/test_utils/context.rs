use crate::runtime::{Builder, Runtime};
use crate::test_utils::{SpySpace, init_tracing};
use anyhow::Result;
use std::sync::Arc;

pub(crate) fn init_local_runtime(builder: Option<Builder>) -> Result<(Runtime, Arc<SpySpace>)> {
    init_runtime(builder.unwrap_or(Builder::new_local()), 1)
}

pub(crate) fn init_stealing_runtime(
    worker_threads: usize,
    builder: Option<Builder>,
) -> Result<(Runtime, Arc<SpySpace>)> {
    let builder = builder
        .unwrap_or(Builder::new_stealing())
        .worker_threads(worker_threads);

    init_runtime(builder, worker_threads + 1)
}

fn init_runtime(builder: Builder, num_workers: usize) -> Result<(Runtime, Arc<SpySpace>)> {
    init_tracing();

    let space = Arc::new(SpySpace::new(num_workers));
    let runtime = builder.address_space(space.clone()).try_build()?;

    Ok((runtime, space))
}
