//! Shared setup for integration tests

use section_checkpoint::testing::CountingBackend;
use section_checkpoint::{CheckpointEngine, EngineConfig, MemoryBackend};
use std::sync::Arc;

/// Engine plus a handle on its backing memory, for inspecting raw keys
#[allow(dead_code)]
pub fn memory_engine() -> (CheckpointEngine, MemoryBackend) {
    let backend = MemoryBackend::new();
    let engine = CheckpointEngine::new(Arc::new(backend.clone()), EngineConfig::default());
    (engine, backend)
}

/// Engine over a backend that counts writes
#[allow(dead_code)]
pub fn counting_engine() -> (CheckpointEngine, CountingBackend) {
    let backend = CountingBackend::new();
    let engine = CheckpointEngine::new(Arc::new(backend.clone()), EngineConfig::default());
    (engine, backend)
}
