//! # section-checkpoint - Resume Where the User Left Off
//!
//! **Checkpoint and restore engine** for in-progress section state: generic UI
//! state, chat transcripts with their unsent draft, structured exam/form state
//! and media playback position. State is written to a durable key-value store
//! while the user works and replayed when the section mounts again.
//!
//! ## Components
//!
//! - [`KeyStore`] - availability-probed wrapper over a [`StorageBackend`] that
//!   turns quota failures into typed errors and tracks recency for eviction
//! - [`SectionNamespace`] - collision-free `{section}_{field}` key layout
//! - [`CheckpointWriter`] - periodic sampler or reactive writer with a
//!   minimum-change policy and one-shot eviction recovery
//! - [`LivenessProbe`] - gates every media sample and restore seek on a
//!   player handle that still answers
//! - [`RestoreCoordinator`] - grace period, validation and a one-shot latch
//!   per mount
//! - [`CorruptionGuard`] - parses every stored value and purges what it
//!   cannot use
//! - [`ExitFlusher`] - last write on page hide, unload or process exit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use section_checkpoint::{CheckpointEngine, RestoreContext, RestoreOutcome, Snapshot};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = CheckpointEngine::in_memory();
//!
//!     let writer = engine.start_reactive("profile-main");
//!     writer.observe(Snapshot::Generic(json!({"tab": "billing"})));
//!
//!     match engine.restore("profile-main", RestoreContext::generic()).await {
//!         RestoreOutcome::Restored(record) => println!("resume at {:?}", record.payload),
//!         other => println!("fresh start: {:?}", other),
//!     }
//! }
//! ```
//!
//! ## Failure Policy
//!
//! Storage, corruption and player failures never reach the caller as errors.
//! Writes degrade to no-ops and restores resolve to a [`RestoreOutcome`]; the
//! reason is logged through `tracing`. Only configuration loading and opening a
//! file backend return [`Result`].

pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod guard;
pub mod logging;
pub mod namespace;
pub mod probe;
pub mod record;
pub mod restore;
pub mod store;
pub mod testing;
pub mod writer;

pub use config::{load_config, ConfigLoader, EngineConfig};
pub use engine::{CheckpointEngine, PlayerKind};
pub use error::{CheckpointError, Result};
pub use flush::{BeaconTransport, ExitFlusher};
pub use guard::{CorruptionGuard, RecordSchema};
pub use logging::init_tracing;
pub use namespace::{Field, SectionNamespace, CURRENT_SECTION_KEY};
pub use probe::{LivenessProbe, PlayerError, PlayerHandle, ProbeState};
pub use record::{
    CheckpointKind, CheckpointRecord, MediaPosition, MessageRole, Snapshot, StoredEnvelope,
    TranscriptMessage, TranscriptSnapshot,
};
pub use restore::{RejectReason, RestoreContext, RestoreCoordinator, RestoreOutcome, RestorePhase};
pub use store::{BackendError, FileBackend, KeyStore, MemoryBackend, StorageBackend};
pub use writer::{CheckpointWriter, FnSource, MediaSource, SamplingPolicy, SnapshotSource};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
