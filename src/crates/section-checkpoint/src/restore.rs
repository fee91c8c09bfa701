//! Restore protocol
//!
//! A [`RestoreCoordinator`] is created when a section mounts. Its
//! [`restore`](RestoreCoordinator::restore) reads the section's checkpoint,
//! validates it against the live context and applies it at most once:
//!
//! 1. Wait a grace period (100ms for textual state, 3s for a remote player) so
//!    the view and any player SDK finish mounting.
//! 2. Read the primary key; absent data is [`RestoreOutcome::NotFound`].
//! 3. Parse through the [`CorruptionGuard`]; corrupt data is purged and
//!    reported as [`RejectReason::Corrupt`].
//! 4. Validate the shape per kind, and for media the asset id, the live
//!    duration (within tolerance) and the end guard.
//! 5. Apply: textual state goes to the caller's closure; media is probed once
//!    more, then seeked and resumed.
//!
//! The coordinator latches on the first attempt. Re-running the mount effect,
//! or calling `restore` concurrently, awaits and returns the first outcome
//! without applying anything again.
//!
//! ```text
//!   Idle ──restore()──▶ Pending ──▶ Restored
//!                           └─────▶ Declined   (NotFound / Rejected / Failed)
//! ```

use crate::config::{EngineConfig, ExpiryConfig};
use crate::guard::{CorruptionGuard, RecordSchema};
use crate::namespace::{Field, SectionNamespace};
use crate::probe::{LivenessProbe, PlayerHandle};
use crate::record::{CheckpointKind, CheckpointRecord, MediaPosition, Snapshot};
use crate::store::KeyStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// What the live view looks like at restore time
#[derive(Clone)]
pub enum RestoreContext {
    Generic { schema: RecordSchema },
    StructuredForm { schema: RecordSchema },
    Transcript,
    Media {
        media_id: String,
        player: Arc<dyn PlayerHandle>,
    },
}

impl std::fmt::Debug for RestoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generic { schema } => f.debug_struct("Generic").field("schema", schema).finish(),
            Self::StructuredForm { schema } => f
                .debug_struct("StructuredForm")
                .field("schema", schema)
                .finish(),
            Self::Transcript => f.write_str("Transcript"),
            Self::Media { media_id, .. } => {
                f.debug_struct("Media").field("media_id", media_id).finish()
            }
        }
    }
}

impl RestoreContext {
    /// Generic state with no required fields
    pub fn generic() -> Self {
        Self::Generic {
            schema: RecordSchema::any_object(),
        }
    }

    pub fn structured_form(schema: RecordSchema) -> Self {
        Self::StructuredForm { schema }
    }

    pub fn media(media_id: impl Into<String>, player: Arc<dyn PlayerHandle>) -> Self {
        Self::Media {
            media_id: media_id.into(),
            player,
        }
    }

    pub fn kind(&self) -> CheckpointKind {
        match self {
            Self::Generic { .. } => CheckpointKind::Generic,
            Self::StructuredForm { .. } => CheckpointKind::StructuredForm,
            Self::Transcript => CheckpointKind::Transcript,
            Self::Media { .. } => CheckpointKind::Media,
        }
    }

    fn schema(&self) -> Option<&RecordSchema> {
        match self {
            Self::Generic { schema } | Self::StructuredForm { schema } => Some(schema),
            _ => None,
        }
    }
}

/// Why a stored checkpoint was not restored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Unparseable or malformed; the data was purged
    Corrupt,
    /// Belongs to another asset or duration; kept for a later visit
    Stale,
    /// Position inside the end guard; the asset counts as finished
    NearEnd,
    /// Older than the configured maximum age; the data was purged
    Expired,
    /// Transcript without messages; the data was purged
    Empty,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrupt => write!(f, "corrupt"),
            Self::Stale => write!(f, "stale"),
            Self::NearEnd => write!(f, "near-end"),
            Self::Expired => write!(f, "expired"),
            Self::Empty => write!(f, "empty"),
        }
    }
}

/// Result of a restore attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored(CheckpointRecord),
    NotFound,
    Rejected(RejectReason),
    /// The player could not be driven; nothing was applied
    Failed(String),
}

impl RestoreOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored(_))
    }

    /// The restored record, if any
    pub fn record(&self) -> Option<&CheckpointRecord> {
        match self {
            Self::Restored(record) => Some(record),
            _ => None,
        }
    }
}

/// Restore state of one mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    Pending,
    Restored,
    Declined,
}

/// Read and validate a section's checkpoint without applying it.
///
/// Corrupt, empty and expired data is purged on the way. Context checks
/// (media id, live duration, end guard) are left to the coordinator.
pub(crate) fn read_record(
    store: &KeyStore,
    namespace: &SectionNamespace,
    kind: CheckpointKind,
    schema: Option<&RecordSchema>,
    expiry: &ExpiryConfig,
) -> Result<Option<CheckpointRecord>, RejectReason> {
    let key = namespace.key_for(kind.primary_field());
    let Some(raw) = store.get(&key) else {
        return Ok(None);
    };

    let guard = CorruptionGuard::new(store);
    let envelope = guard
        .parse_envelope(&key, Some(raw), kind, schema)
        .ok_or(RejectReason::Corrupt)?;

    if let Some(max_age) = expiry.max_age(kind) {
        if Utc::now() - envelope.saved_at > max_age {
            guard.purge::<()>(&key, "expired");
            return Err(RejectReason::Expired);
        }
    }

    let snapshot = match Snapshot::from_envelope_payload(kind, envelope.payload) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            guard.purge::<()>(&key, &format!("payload shape: {}", e));
            return Err(RejectReason::Corrupt);
        }
    };

    let snapshot = match snapshot {
        Snapshot::Transcript(mut transcript) => {
            if transcript.messages.is_empty() {
                guard.purge::<()>(&key, "empty transcript");
                return Err(RejectReason::Empty);
            }
            transcript.draft = guard
                .read_value(&namespace.key_for(Field::UserInput))
                .unwrap_or_default();
            transcript.show_prompts = guard
                .read_value(&namespace.key_for(Field::ShowPrompts))
                .unwrap_or(transcript.show_prompts);
            Snapshot::Transcript(transcript)
        }
        Snapshot::Media(position) => {
            let plausible = position.position_seconds.is_finite()
                && position.position_seconds >= 0.0
                && position.duration_seconds.is_finite()
                && position.duration_seconds > 0.0
                && !position.media_id.is_empty();
            if !plausible {
                guard.purge::<()>(&key, "implausible media position");
                return Err(RejectReason::Corrupt);
            }
            Snapshot::Media(position)
        }
        other => other,
    };

    Ok(Some(CheckpointRecord {
        section_id: namespace.section_id().to_string(),
        kind,
        payload: snapshot,
        saved_at: envelope.saved_at,
    }))
}

/// Drives the restore of one section mount
pub struct RestoreCoordinator {
    store: Arc<KeyStore>,
    namespace: SectionNamespace,
    config: Arc<EngineConfig>,
    outcome: OnceCell<RestoreOutcome>,
    phase: Mutex<RestorePhase>,
}

impl std::fmt::Debug for RestoreCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreCoordinator")
            .field("section", &self.namespace.section_id())
            .field("phase", &self.phase())
            .finish()
    }
}

impl RestoreCoordinator {
    pub(crate) fn new(store: Arc<KeyStore>, namespace: SectionNamespace, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            namespace,
            config,
            outcome: OnceCell::new(),
            phase: Mutex::new(RestorePhase::Idle),
        }
    }

    pub fn section_id(&self) -> &str {
        self.namespace.section_id()
    }

    pub fn phase(&self) -> RestorePhase {
        *self.phase.lock()
    }

    /// Restore once for this mount
    pub async fn restore(&self, context: RestoreContext) -> RestoreOutcome {
        self.restore_with(context, |_| {}).await
    }

    /// Restore once for this mount, calling `apply` with the record if (and
    /// only if) this call performed the restore
    pub async fn restore_with<F>(&self, context: RestoreContext, apply: F) -> RestoreOutcome
    where
        F: FnOnce(&CheckpointRecord) + Send,
    {
        self.outcome
            .get_or_init(|| async move {
                *self.phase.lock() = RestorePhase::Pending;
                let outcome = self.attempt(&context).await;

                if let RestoreOutcome::Restored(record) = &outcome {
                    apply(record);
                }

                *self.phase.lock() = match outcome {
                    RestoreOutcome::Restored(_) => RestorePhase::Restored,
                    _ => RestorePhase::Declined,
                };
                info!(section = self.section_id(), outcome = %outcome_label(&outcome), "Restore finished");
                outcome
            })
            .await
            .clone()
    }

    /// Clear the latch so the next `restore` reads the store again
    pub fn recheck(&mut self) {
        self.outcome = OnceCell::new();
        *self.phase.lock() = RestorePhase::Idle;
    }

    async fn attempt(&self, context: &RestoreContext) -> RestoreOutcome {
        let kind = context.kind();
        tokio::time::sleep(self.config.restore_grace(kind)).await;

        let record = match read_record(
            &self.store,
            &self.namespace,
            kind,
            context.schema(),
            &self.config.expiry,
        ) {
            Ok(Some(record)) => record,
            Ok(None) => return RestoreOutcome::NotFound,
            Err(reason) => return RestoreOutcome::Rejected(reason),
        };

        match (context, &record.payload) {
            (RestoreContext::Media { media_id, player }, Snapshot::Media(position)) => {
                match self.apply_media(media_id, player, position).await {
                    None => RestoreOutcome::Restored(record),
                    Some(outcome) => outcome,
                }
            }
            _ => RestoreOutcome::Restored(record),
        }
    }

    /// Validate a media position against the live player, then seek and play.
    ///
    /// Returns `None` once the position has been applied.
    async fn apply_media(
        &self,
        media_id: &str,
        player: &Arc<dyn PlayerHandle>,
        position: &MediaPosition,
    ) -> Option<RestoreOutcome> {
        let media = &self.config.media;

        if position.media_id != media_id {
            debug!(
                section = self.section_id(),
                stored = %position.media_id,
                live = media_id,
                "Stored position belongs to another asset"
            );
            return Some(RestoreOutcome::Rejected(RejectReason::Stale));
        }

        let Some(live_duration) = self.wait_until_ready(player).await else {
            return Some(RestoreOutcome::Failed(format!(
                "player for {} never became ready",
                media_id
            )));
        };

        if (position.duration_seconds - live_duration).abs() > media.duration_tolerance_secs {
            debug!(
                section = self.section_id(),
                stored = position.duration_seconds,
                live = live_duration,
                "Stored duration does not match live asset"
            );
            return Some(RestoreOutcome::Rejected(RejectReason::Stale));
        }

        if position.is_near_end(media.end_guard_secs) {
            debug!(section = self.section_id(), position = position.position_seconds, "Stored position is past the end guard");
            return Some(RestoreOutcome::Rejected(RejectReason::NearEnd));
        }

        let probe = LivenessProbe::new(player.clone(), media.probe_timeout());
        if !probe.check().await {
            return Some(RestoreOutcome::Failed("player failed liveness probe before seek".to_string()));
        }

        if let Err(e) = player.set_current_time(position.position_seconds).await {
            return Some(RestoreOutcome::Failed(format!("seek rejected: {}", e)));
        }

        // The position is already applied; a blocked resume leaves the user
        // one click away from where they stopped
        if let Err(e) = player.play().await {
            warn!(section = self.section_id(), error = %e, "Resume after restore was rejected");
        }

        None
    }

    /// Wait for the player to report a usable duration, retrying on a timer
    async fn wait_until_ready(&self, player: &Arc<dyn PlayerHandle>) -> Option<f64> {
        let media = &self.config.media;
        let attempts = media.ready_attempts.max(1);

        for attempt in 1..=attempts {
            let check = tokio::time::timeout(media.probe_timeout(), async {
                player.ready().await?;
                player.duration().await
            })
            .await;

            match check {
                Ok(Ok(duration)) if duration.is_finite() && duration > 0.0 => return Some(duration),
                Ok(Ok(_)) => debug!(attempt, "Player duration not available yet"),
                Ok(Err(e)) => debug!(attempt, error = %e, "Player not ready"),
                Err(_) => debug!(attempt, "Player readiness check timed out"),
            }

            if attempt < attempts {
                tokio::time::sleep(media.ready_retry()).await;
            }
        }

        None
    }
}

fn outcome_label(outcome: &RestoreOutcome) -> String {
    match outcome {
        RestoreOutcome::Restored(_) => "restored".to_string(),
        RestoreOutcome::NotFound => "not-found".to_string(),
        RestoreOutcome::Rejected(reason) => format!("rejected:{}", reason),
        RestoreOutcome::Failed(reason) => format!("failed:{}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{StoredEnvelope, TranscriptMessage, TranscriptSnapshot};
    use crate::store::MemoryBackend;
    use crate::testing::FakePlayer;
    use crate::writer::persist_snapshot;
    use serde_json::json;

    fn coordinator(section: &str, config: EngineConfig) -> (Arc<KeyStore>, RestoreCoordinator) {
        let store = Arc::new(KeyStore::open(Arc::new(MemoryBackend::new())));
        let coordinator =
            RestoreCoordinator::new(store.clone(), SectionNamespace::new(section), Arc::new(config));
        (store, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_without_data() {
        let (_, coordinator) = coordinator("s", EngineConfig::default());
        assert_eq!(coordinator.restore(RestoreContext::generic()).await, RestoreOutcome::NotFound);
        assert_eq!(coordinator.phase(), RestorePhase::Declined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_form_missing_field_rejected_and_purged() {
        let (store, coordinator) = coordinator("exam-1", EngineConfig::default());
        let ns = SectionNamespace::new("exam-1");
        persist_snapshot(&store, &ns, &Snapshot::StructuredForm(json!({"answers": {}})));

        let schema = RecordSchema::with_required(["answers", "currentQuestion"]);
        let outcome = coordinator.restore(RestoreContext::structured_form(schema)).await;

        assert_eq!(outcome, RestoreOutcome::Rejected(RejectReason::Corrupt));
        assert_eq!(store.get("exam-1_exam_state"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_rejected() {
        let mut config = EngineConfig::default();
        config.expiry.generic_max_age_secs = Some(60);
        let (store, coordinator) = coordinator("s", config);

        let old = StoredEnvelope::new(
            CheckpointKind::Generic,
            json!({"tab": 2}),
            Utc::now() - chrono::Duration::hours(1),
        );
        store
            .set("s_section_state", &serde_json::to_string(&old).unwrap())
            .unwrap();

        let outcome = coordinator.restore(RestoreContext::generic()).await;
        assert_eq!(outcome, RestoreOutcome::Rejected(RejectReason::Expired));
        assert_eq!(store.get("s_section_state"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_restores_draft_and_prompts() {
        let (store, coordinator) = coordinator("ask-ai-main", EngineConfig::default());
        let ns = SectionNamespace::new("ask-ai-main");
        let transcript = TranscriptSnapshot::new(vec![
            TranscriptMessage::welcome("Welcome"),
            TranscriptMessage::user("Explain photosynthesis"),
        ])
        .with_draft("and respiration?")
        .with_show_prompts(false);
        assert!(persist_snapshot(&store, &ns, &Snapshot::Transcript(transcript.clone())));

        let outcome = coordinator.restore(RestoreContext::Transcript).await;
        assert_eq!(
            outcome.record().map(|r| &r.payload),
            Some(&Snapshot::Transcript(transcript))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_transcript_rejected() {
        let (store, coordinator) = coordinator("s", EngineConfig::default());
        let envelope = StoredEnvelope::new(CheckpointKind::Transcript, json!([]), Utc::now());
        store.set("s_chat", &serde_json::to_string(&envelope).unwrap()).unwrap();

        let outcome = coordinator.restore(RestoreContext::Transcript).await;
        assert_eq!(outcome, RestoreOutcome::Rejected(RejectReason::Empty));
        assert_eq!(store.get("s_chat"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_other_asset_is_stale_and_kept() {
        let (store, coordinator) = coordinator("lecture", EngineConfig::default());
        let ns = SectionNamespace::new("lecture");
        persist_snapshot(&store, &ns, &Snapshot::Media(MediaPosition::new("vid-a", 40.0, 300.0)));

        let player = Arc::new(FakePlayer::new(300.0));
        let outcome = coordinator.restore(RestoreContext::media("vid-b", player.clone())).await;

        assert_eq!(outcome, RestoreOutcome::Rejected(RejectReason::Stale));
        assert!(store.get("lecture_current_playback_time").is_some());
        assert!(player.seeks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_waits_for_slow_player() {
        let (store, coordinator) = coordinator("lecture", EngineConfig::default());
        let ns = SectionNamespace::new("lecture");
        persist_snapshot(&store, &ns, &Snapshot::Media(MediaPosition::new("vid-a", 40.0, 300.0)));

        // Duration unknown until metadata loads, after the grace period
        let player = Arc::new(FakePlayer::new(f64::NAN));
        let loader = player.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(4200)).await;
            loader.set_duration(300.0);
        });

        let outcome = coordinator.restore(RestoreContext::media("vid-a", player.clone())).await;
        assert!(outcome.is_restored());
        assert_eq!(player.seeks(), vec![40.0]);
        assert_eq!(player.play_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_player_never_ready_fails() {
        let (store, coordinator) = coordinator("lecture", EngineConfig::default());
        let ns = SectionNamespace::new("lecture");
        persist_snapshot(&store, &ns, &Snapshot::Media(MediaPosition::new("vid-a", 40.0, 300.0)));

        let player = Arc::new(FakePlayer::new(300.0));
        player.detach();

        let outcome = coordinator.restore(RestoreContext::media("vid-a", player.clone())).await;
        assert!(matches!(outcome, RestoreOutcome::Failed(_)));
        assert!(player.seeks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_autoplay_still_restores_position() {
        let (store, coordinator) = coordinator("lecture", EngineConfig::default());
        let ns = SectionNamespace::new("lecture");
        persist_snapshot(&store, &ns, &Snapshot::Media(MediaPosition::new("vid-a", 40.0, 300.0)));

        let player = Arc::new(FakePlayer::new(300.0));
        player.reject_play();

        let outcome = coordinator.restore(RestoreContext::media("vid-a", player.clone())).await;
        assert!(outcome.is_restored());
        assert_eq!(player.seeks(), vec![40.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_reads_again() {
        let (store, mut coordinator) = coordinator("s", EngineConfig::default());
        assert_eq!(coordinator.restore(RestoreContext::generic()).await, RestoreOutcome::NotFound);

        persist_snapshot(&store, &SectionNamespace::new("s"), &Snapshot::Generic(json!({"step": 3})));
        assert_eq!(coordinator.restore(RestoreContext::generic()).await, RestoreOutcome::NotFound);

        coordinator.recheck();
        assert_eq!(coordinator.phase(), RestorePhase::Idle);
        assert!(coordinator.restore(RestoreContext::generic()).await.is_restored());
    }
}
