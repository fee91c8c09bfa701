//! Periodic and reactive checkpoint writers
//!
//! A [`CheckpointWriter`] persists one section's live state through the
//! [`KeyStore`]. It runs in one of two modes:
//!
//! - **Periodic** - a tokio task samples a [`SnapshotSource`] on a fixed
//!   interval (1s for local media elements, 2s for remote player SDKs) and
//!   writes only when the value moved by more than the policy's minimum delta.
//! - **Reactive** - the caller pushes every change through
//!   [`CheckpointWriter::observe`], which writes immediately. Used for
//!   transcripts and form state.
//!
//! # Tick discipline
//!
//! Each tick awaits at most one snapshot, bounded by the sampling interval
//! plus the source's [`extra_budget`](SnapshotSource::extra_budget). A media
//! source budgets its probe timeout, so a wedged player is always declared
//! dead instead of being cut off mid-probe. A snapshot that takes longer is
//! dropped: the next tick supersedes it. Missed
//! ticks are skipped rather than queued, so a slow player never builds a
//! backlog of writes.
//!
//! # Failure handling
//!
//! A full store triggers one recovery attempt: the least recently used key of
//! some other section is evicted and the write retried once. After that the
//! write is dropped with a warning. A [`PlayerUnreachable`] sample stops the
//! writer for good; a new writer is started when the section is re-entered
//! with a fresh handle.
//!
//! [`PlayerUnreachable`]: CheckpointError::PlayerUnreachable

use crate::config::MediaConfig;
use crate::error::{CheckpointError, Result};
use crate::flush::ExitFlusher;
use crate::namespace::{self, SectionNamespace};
use crate::probe::{LivenessProbe, ProbeState};
use crate::record::{MediaPosition, Snapshot};
use crate::store::KeyStore;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Supplies the live state of a section
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Current state, or `None` when there is nothing to sample this tick
    async fn snapshot(&self) -> Result<Option<Snapshot>>;

    /// Time a snapshot needs beyond the sampling interval before it may be
    /// dropped as superseded
    fn extra_budget(&self) -> Duration {
        Duration::ZERO
    }
}

/// [`SnapshotSource`] over a synchronous accessor
pub struct FnSource<F> {
    accessor: F,
}

impl<F> FnSource<F>
where
    F: Fn() -> Option<Snapshot> + Send + Sync,
{
    pub fn new(accessor: F) -> Self {
        Self { accessor }
    }
}

#[async_trait]
impl<F> SnapshotSource for FnSource<F>
where
    F: Fn() -> Option<Snapshot> + Send + Sync,
{
    async fn snapshot(&self) -> Result<Option<Snapshot>> {
        Ok((self.accessor)())
    }
}

/// Samples playback position from a player, probing liveness first
pub struct MediaSource {
    media_id: String,
    probe: Arc<LivenessProbe>,
}

impl MediaSource {
    pub fn new(media_id: impl Into<String>, probe: Arc<LivenessProbe>) -> Self {
        Self {
            media_id: media_id.into(),
            probe,
        }
    }

    pub fn probe(&self) -> &Arc<LivenessProbe> {
        &self.probe
    }
}

#[async_trait]
impl SnapshotSource for MediaSource {
    /// A probe cut short never reaches `Dead`, so it always gets its full timeout
    fn extra_budget(&self) -> Duration {
        self.probe.timeout()
    }

    async fn snapshot(&self) -> Result<Option<Snapshot>> {
        if !self.probe.check().await {
            return match self.probe.state() {
                ProbeState::Dead => Err(CheckpointError::PlayerUnreachable(format!(
                    "player for {} failed liveness probe",
                    self.media_id
                ))),
                _ => Ok(None),
            };
        }

        let player = self.probe.player();
        let read = async {
            let position = player.current_time().await?;
            let duration = player.duration().await?;
            Ok::<_, crate::probe::PlayerError>((position, duration))
        };

        let (position, duration) = match read.await {
            Ok(values) => values,
            Err(e) => {
                self.probe.mark_dead();
                return Err(CheckpointError::PlayerUnreachable(e.to_string()));
            }
        };

        if !position.is_finite() || position < 0.0 || !duration.is_finite() {
            return Ok(None);
        }

        Ok(Some(Snapshot::Media(MediaPosition::new(
            self.media_id.clone(),
            position,
            duration,
        ))))
    }
}

/// Sampling interval and write threshold for a periodic writer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    pub interval: Duration,
    /// Minimum media position change, in seconds, before a write
    pub min_delta: f64,
    /// Quiet period before the first sample, so a restore lands first
    pub start_delay: Duration,
}

impl SamplingPolicy {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            min_delta: 0.0,
            start_delay: Duration::ZERO,
        }
    }

    pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// Native media element
    pub fn local_media(config: &MediaConfig) -> Self {
        Self::every(config.local_interval())
            .with_min_delta(config.min_delta_secs)
            .with_start_delay(config.restore_grace())
    }

    /// Remote player SDK
    pub fn remote_media(config: &MediaConfig) -> Self {
        Self::every(config.remote_interval())
            .with_min_delta(config.min_delta_secs)
            .with_start_delay(config.restore_grace())
    }
}

/// Persist `snapshot` under `namespace`, one KeyStore call per key.
///
/// Welcome-only transcripts and non-object generic or form state are never
/// written. Returns whether every key was written; failures are logged and
/// never propagated.
pub(crate) fn persist_snapshot(store: &KeyStore, namespace: &SectionNamespace, snapshot: &Snapshot) -> bool {
    match snapshot {
        Snapshot::Transcript(transcript) if transcript.is_placeholder() => {
            debug!(section = namespace.section_id(), "Skipping placeholder transcript");
            return false;
        }
        Snapshot::Generic(value) | Snapshot::StructuredForm(value) if !value.is_object() => {
            warn!(
                section = namespace.section_id(),
                kind = %snapshot.kind(),
                "Refusing to checkpoint state that is not a JSON object"
            );
            return false;
        }
        _ => {}
    }

    let entries = match snapshot.to_entries(Utc::now()) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(section = namespace.section_id(), error = %e, "Failed to serialize checkpoint");
            return false;
        }
    };

    for (field, value) in entries {
        let key = namespace.key_for(field);
        if !write_with_recovery(store, namespace, &key, &value) {
            return false;
        }
    }
    true
}

fn write_with_recovery(store: &KeyStore, namespace: &SectionNamespace, key: &str, value: &str) -> bool {
    let err = match store.set(key, value) {
        Ok(()) => return true,
        Err(e) => e,
    };

    match err {
        CheckpointError::StorageUnavailable => {
            debug!(key, "Storage unavailable, checkpoint not written");
            false
        }
        e if e.is_recoverable_by_eviction() => {
            // Only keys of other sections are fair game
            let victim = store
                .eviction_candidates(|k| {
                    namespace.owns(k) || namespace::owning_section(k).is_none()
                })
                .into_iter()
                .next();

            let Some(victim) = victim else {
                warn!(key, "Storage full and nothing to evict, checkpoint dropped");
                return false;
            };

            debug!(key, evicted = %victim, "Storage full, evicting least recently used checkpoint");
            store.remove(&victim);

            match store.set(key, value) {
                Ok(()) => true,
                Err(e) => {
                    warn!(key, error = %e, "Checkpoint dropped after eviction retry");
                    false
                }
            }
        }
        e => {
            warn!(key, error = %e, "Checkpoint write failed");
            false
        }
    }
}

/// State shared between a writer handle, its sampling task and the exit flusher
pub(crate) struct WriterState {
    id: Uuid,
    store: Arc<KeyStore>,
    namespace: SectionNamespace,
    min_delta: f64,
    stopped: AtomicBool,
    last_seen: Mutex<Option<Snapshot>>,
    last_persisted: Mutex<Option<Snapshot>>,
    flusher: ExitFlusher,
}

impl WriterState {
    pub(crate) fn new(
        store: Arc<KeyStore>,
        namespace: SectionNamespace,
        min_delta: f64,
        flusher: ExitFlusher,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            store,
            namespace,
            min_delta,
            stopped: AtomicBool::new(false),
            last_seen: Mutex::new(None),
            last_persisted: Mutex::new(None),
            flusher,
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn section_id(&self) -> &str {
        self.namespace.section_id()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Record a sample and write it if it changed materially
    fn offer(&self, snapshot: Snapshot) -> bool {
        if self.is_stopped() {
            return false;
        }

        if let Snapshot::Transcript(transcript) = &snapshot {
            if transcript.is_placeholder() {
                return false;
            }
        }

        *self.last_seen.lock() = Some(snapshot.clone());

        let changed = match self.last_persisted.lock().as_ref() {
            Some(previous) => snapshot.differs_materially(previous, self.min_delta),
            None => true,
        };
        if !changed {
            return false;
        }

        self.write(snapshot)
    }

    /// Write the last sample regardless of the delta policy.
    ///
    /// Returns the snapshot written, if any.
    pub(crate) fn flush(&self) -> Option<Snapshot> {
        if self.is_stopped() {
            return None;
        }

        let snapshot = self.last_seen.lock().clone()?;
        self.write(snapshot.clone()).then_some(snapshot)
    }

    fn write(&self, snapshot: Snapshot) -> bool {
        let written = persist_snapshot(&self.store, &self.namespace, &snapshot);
        if written {
            *self.last_persisted.lock() = Some(snapshot);
        }
        written
    }

    /// Returns `true` on the first call only
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.flusher.deregister(self.id);
        true
    }
}

/// Handle to an active writer; dropping it stops the writer
pub struct CheckpointWriter {
    state: Arc<WriterState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("id", &self.state.id)
            .field("section", &self.state.section_id())
            .field("stopped", &self.state.is_stopped())
            .finish()
    }
}

impl CheckpointWriter {
    /// Start sampling `source` every `policy.interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn periodic(
        state: Arc<WriterState>,
        source: Arc<dyn SnapshotSource>,
        policy: SamplingPolicy,
    ) -> Self {
        state.flusher.register(&state);
        info!(
            section = state.section_id(),
            interval_ms = policy.interval.as_millis() as u64,
            "Checkpoint sampling started"
        );

        let task = tokio::spawn(run_sampler(state.clone(), source, policy));
        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Writer fed through [`observe`](Self::observe)
    pub(crate) fn reactive(state: Arc<WriterState>) -> Self {
        state.flusher.register(&state);
        debug!(section = state.section_id(), "Reactive checkpointing started");
        Self {
            state,
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn section_id(&self) -> &str {
        self.state.section_id()
    }

    /// Persist a changed value immediately; returns whether a write happened
    pub fn observe(&self, snapshot: Snapshot) -> bool {
        self.state.offer(snapshot)
    }

    /// Last value written by this writer
    pub fn last_persisted(&self) -> Option<Snapshot> {
        self.state.last_persisted.lock().clone()
    }

    /// Whether the writer was stopped, explicitly or by a dead player
    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Cancel the timer; later ticks and observations are no-ops
    pub fn stop(&self) {
        if self.state.stop() {
            debug!(section = self.section_id(), "Checkpoint writer stopped");
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_sampler(state: Arc<WriterState>, source: Arc<dyn SnapshotSource>, policy: SamplingPolicy) {
    if !policy.start_delay.is_zero() {
        tokio::time::sleep(policy.start_delay).await;
    }

    let interval = policy.interval;
    let budget = interval + source.extra_budget();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; sampling starts one interval in
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if state.is_stopped() {
            break;
        }

        match tokio::time::timeout(budget, source.snapshot()).await {
            Err(_) => {
                debug!(section = state.section_id(), "Sample superseded by next tick");
            }
            Ok(Ok(Some(snapshot))) => {
                state.offer(snapshot);
            }
            Ok(Ok(None)) => {}
            Ok(Err(CheckpointError::PlayerUnreachable(reason))) => {
                info!(section = state.section_id(), reason = %reason, "Player gone, stopping checkpoint sampling");
                state.stop();
                break;
            }
            Ok(Err(e)) => {
                warn!(section = state.section_id(), error = %e, "Checkpoint sample failed");
            }
        }
    }
}
