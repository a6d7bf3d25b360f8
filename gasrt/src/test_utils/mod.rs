use std::sync::Once;
use tracing_subscriber::EnvFilter;

// Exports
mod context;
pub(crate) use context::{init_local_runtime, init_stealing_runtime};

pub(crate) mod spy;
pub(crate) use spy::{Method, SpySpace};

/// Installs a fmt subscriber once per test binary. Filter with `RUST_LOG`.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
