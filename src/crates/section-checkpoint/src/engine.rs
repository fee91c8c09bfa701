//! Caller-facing entry point
//!
//! [`CheckpointEngine`] ties the store, the writers, the restore coordinators
//! and the exit flusher together. Views hand it a section id and get back a
//! writer handle or a [`RestoreOutcome`]; nothing here returns an error for
//! storage, corruption or player failures.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::flush::{BeaconTransport, ExitFlusher};
use crate::guard::RecordSchema;
use crate::namespace::{all_keys_for, SectionNamespace, CURRENT_SECTION_KEY};
use crate::probe::{LivenessProbe, PlayerHandle};
use crate::record::{CheckpointKind, CheckpointRecord, Snapshot};
use crate::restore::{read_record, RestoreContext, RestoreCoordinator, RestoreOutcome};
use crate::store::{FileBackend, KeyStore, MemoryBackend, StorageBackend};
use crate::writer::{
    persist_snapshot, CheckpointWriter, MediaSource, SamplingPolicy, SnapshotSource, WriterState,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Where a media position is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    /// Native media element, sampled every second
    Local,
    /// Embedded third-party player SDK, sampled every two seconds
    Remote,
}

/// Checkpoint and restore engine for one store
#[derive(Debug, Clone)]
pub struct CheckpointEngine {
    store: Arc<KeyStore>,
    config: Arc<EngineConfig>,
    flusher: ExitFlusher,
}

impl CheckpointEngine {
    pub fn new(backend: Arc<dyn StorageBackend>, config: EngineConfig) -> Self {
        let store = Arc::new(KeyStore::open(backend));
        info!(available = store.is_available(), "Checkpoint engine ready");
        Self {
            store,
            config: Arc::new(config),
            flusher: ExitFlusher::new(),
        }
    }

    /// Engine over a fresh in-memory store with default settings
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), EngineConfig::default())
    }

    /// Engine over the backend named by `config.storage.path`: a file when
    /// set, memory otherwise
    pub fn open(config: EngineConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match config.storage_path() {
            Some(path) => Arc::new(FileBackend::open(path)?),
            None => Arc::new(MemoryBackend::new()),
        };
        Ok(Self::new(backend, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether writes can persist at all this session
    pub fn is_persistent(&self) -> bool {
        self.store.is_available()
    }

    /// Write `snapshot` once, right now
    pub fn checkpoint(&self, section_id: &str, snapshot: &Snapshot) -> bool {
        persist_snapshot(&self.store, &SectionNamespace::new(section_id), snapshot)
    }

    /// Sample `source` on `policy`'s interval until the writer is stopped.
    ///
    /// Spawns the sampling task, so it must be called from within a tokio
    /// runtime; it panics otherwise.
    pub fn start_checkpointing(
        &self,
        section_id: &str,
        source: Arc<dyn SnapshotSource>,
        policy: SamplingPolicy,
    ) -> CheckpointWriter {
        let state = self.writer_state(section_id, policy.min_delta);
        CheckpointWriter::periodic(state, source, policy)
    }

    /// Writer that persists every change passed to `observe`; needs no runtime
    pub fn start_reactive(&self, section_id: &str) -> CheckpointWriter {
        CheckpointWriter::reactive(self.writer_state(section_id, 0.0))
    }

    /// Sample playback position of `player`, probing it before each sample.
    ///
    /// Also records `section_id` as the last active section. The writer stops
    /// itself once the player is torn down; start a new one with the new
    /// handle when the section is re-entered.
    ///
    /// Spawns the sampling task, so it must be called from within a tokio
    /// runtime; it panics otherwise.
    pub fn start_media_checkpointing(
        &self,
        section_id: &str,
        media_id: &str,
        player: Arc<dyn PlayerHandle>,
        kind: PlayerKind,
    ) -> CheckpointWriter {
        self.mark_active(section_id);

        let media = &self.config.media;
        let probe = Arc::new(LivenessProbe::new(player, media.probe_timeout()));
        let policy = match kind {
            PlayerKind::Local => SamplingPolicy::local_media(media),
            PlayerKind::Remote => SamplingPolicy::remote_media(media),
        };

        self.start_checkpointing(section_id, Arc::new(MediaSource::new(media_id, probe)), policy)
    }

    /// Coordinator for one mount of `section_id`
    pub fn mount(&self, section_id: &str) -> RestoreCoordinator {
        RestoreCoordinator::new(
            self.store.clone(),
            SectionNamespace::new(section_id),
            self.config.clone(),
        )
    }

    /// Mount and restore in one step.
    ///
    /// Every call is a fresh mount with its own latch, so calling this twice
    /// restores twice. Views that re-render keep the coordinator from
    /// [`mount`](Self::mount) and call `restore` on it instead.
    pub async fn restore(&self, section_id: &str, context: RestoreContext) -> RestoreOutcome {
        self.mount(section_id).restore(context).await
    }

    /// Remove every key of `section_id`
    pub fn clear_saved_progress(&self, section_id: &str) {
        for key in all_keys_for(section_id) {
            self.store.remove(&key);
        }
        if self.last_active_section().as_deref() == Some(section_id) {
            self.store.remove(CURRENT_SECTION_KEY);
        }
        info!(section = section_id, "Saved progress cleared");
    }

    /// The stored record of `kind` for `section_id`, without restoring it.
    ///
    /// Corrupt or expired data is purged and reported as `None`.
    pub fn saved_section(&self, section_id: &str, kind: CheckpointKind) -> Option<CheckpointRecord> {
        let schema = RecordSchema::any_object();
        let schema = matches!(kind, CheckpointKind::Generic | CheckpointKind::StructuredForm)
            .then_some(&schema);

        match read_record(
            &self.store,
            &SectionNamespace::new(section_id),
            kind,
            schema,
            &self.config.expiry,
        ) {
            Ok(record) => record,
            Err(reason) => {
                debug!(section = section_id, %kind, %reason, "No usable saved record");
                None
            }
        }
    }

    /// Section whose media progress was sampled most recently
    pub fn last_active_section(&self) -> Option<String> {
        self.store.get(CURRENT_SECTION_KEY)
    }

    pub fn exit_flusher(&self) -> &ExitFlusher {
        &self.flusher
    }

    pub fn set_beacon(&self, beacon: Arc<dyn BeaconTransport>) {
        self.flusher.set_beacon(beacon);
    }

    /// Write the last sample of every active writer; call on page hide or exit
    pub fn flush_on_exit(&self) -> usize {
        self.flusher.page_hidden()
    }

    fn writer_state(&self, section_id: &str, min_delta: f64) -> Arc<WriterState> {
        WriterState::new(
            self.store.clone(),
            SectionNamespace::new(section_id),
            min_delta,
            self.flusher.clone(),
        )
    }

    fn mark_active(&self, section_id: &str) {
        if self.last_active_section().as_deref() == Some(section_id) {
            return;
        }
        if let Err(e) = self.store.set(CURRENT_SECTION_KEY, section_id) {
            debug!(section = section_id, error = %e, "Could not record active section");
        }
    }
}
