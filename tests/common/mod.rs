//! Shared setup for integration tests

use outline_core::db::MemoryStore;
use outline_core::services::{NodeEngine, SchedulerConfig};
use std::sync::Arc;
use std::time::Duration;

/// Initialize test logging once; respects `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Engine over a fresh in-memory store with a short debounce window
pub fn fast_engine() -> (NodeEngine, Arc<MemoryStore>) {
    fast_engine_with(Duration::from_millis(20))
}

/// Engine with an explicit debounce window
pub fn fast_engine_with(debounce: Duration) -> (NodeEngine, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = NodeEngine::with_config(
        store.clone(),
        SchedulerConfig {
            debounce,
            ..Default::default()
        },
    );
    (engine, store)
}
