//! Checkpoint data model
//!
//! A checkpoint is one section's in-progress state, tagged with the
//! [`CheckpointKind`] that decides its sub-schema and restore rules:
//!
//! | Kind | Payload | Primary key |
//! |------|---------|-------------|
//! | `Generic` | arbitrary JSON object | `{section}_section_state` |
//! | `StructuredForm` | JSON object with required fields | `{section}_exam_state` |
//! | `Transcript` | ordered messages + draft + prompt toggle | `{section}_chat` |
//! | `Media` | `{mediaId, positionSeconds, durationSeconds}` | `{section}_current_playback_time` |
//!
//! Every primary key holds a [`StoredEnvelope`]: the payload plus the schema
//! version, the kind and a `savedAt` timestamp. A multi-field payload is always
//! one envelope so a reader never observes half of an update.

use crate::namespace::Field;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which sub-schema and validation rules apply to a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Arbitrary section UI state
    Generic,
    /// Media playback position
    Media,
    /// Chat transcript with an unsent draft
    Transcript,
    /// Multi-field navigation state (exam progress, wizards)
    StructuredForm,
}

impl CheckpointKind {
    /// All kinds, in declaration order
    pub const ALL: [CheckpointKind; 4] = [
        CheckpointKind::Generic,
        CheckpointKind::Media,
        CheckpointKind::Transcript,
        CheckpointKind::StructuredForm,
    ];

    /// The key field holding this kind's envelope
    pub fn primary_field(self) -> Field {
        match self {
            CheckpointKind::Generic => Field::SectionState,
            CheckpointKind::Media => Field::CurrentPlaybackTime,
            CheckpointKind::Transcript => Field::Chat,
            CheckpointKind::StructuredForm => Field::ExamState,
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::Media => write!(f, "media"),
            Self::Transcript => write!(f, "transcript"),
            Self::StructuredForm => write!(f, "structured_form"),
        }
    }
}

/// Author of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Ai,
    User,
}

/// One entry of a chat transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    #[serde(rename = "type")]
    pub role: MessageRole,

    pub text: String,

    /// Set on the greeting a fresh conversation starts with
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_welcome: bool,

    /// Fields the engine does not interpret (attachments, ids, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TranscriptMessage {
    /// Create an AI message
    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Ai,
            text: text.into(),
            is_welcome: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Create the welcome entry of a fresh conversation
    pub fn welcome(text: impl Into<String>) -> Self {
        Self {
            is_welcome: true,
            ..Self::ai(text)
        }
    }

    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            ..Self::ai(text)
        }
    }
}

/// Chat transcript state: ordered messages, the unsent draft and whether the
/// suggested prompts are still shown
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSnapshot {
    pub messages: Vec<TranscriptMessage>,
    pub draft: String,
    pub show_prompts: bool,
}

impl TranscriptSnapshot {
    pub fn new(messages: Vec<TranscriptMessage>) -> Self {
        Self {
            messages,
            draft: String::new(),
            show_prompts: true,
        }
    }

    pub fn with_draft(mut self, draft: impl Into<String>) -> Self {
        self.draft = draft.into();
        self
    }

    pub fn with_show_prompts(mut self, show_prompts: bool) -> Self {
        self.show_prompts = show_prompts;
        self
    }

    /// True when the transcript holds nothing but the initial greeting.
    ///
    /// Persisting such a transcript would overwrite a real saved conversation
    /// with a freshly initialised one.
    pub fn is_placeholder(&self) -> bool {
        self.messages.iter().all(|m| m.is_welcome)
    }
}

/// Playback position of one media asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPosition {
    pub media_id: String,
    pub position_seconds: f64,
    pub duration_seconds: f64,
}

impl MediaPosition {
    pub fn new(media_id: impl Into<String>, position_seconds: f64, duration_seconds: f64) -> Self {
        Self {
            media_id: media_id.into(),
            position_seconds,
            duration_seconds,
        }
    }

    /// Whether the position falls inside the end guard, i.e. the asset counts
    /// as finished rather than in progress
    pub fn is_near_end(&self, end_guard_seconds: f64) -> bool {
        self.position_seconds >= self.duration_seconds - end_guard_seconds
    }
}

/// Live state of a section, one variant per [`CheckpointKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Generic(Value),
    StructuredForm(Value),
    Transcript(TranscriptSnapshot),
    Media(MediaPosition),
}

impl Snapshot {
    pub fn kind(&self) -> CheckpointKind {
        match self {
            Snapshot::Generic(_) => CheckpointKind::Generic,
            Snapshot::StructuredForm(_) => CheckpointKind::StructuredForm,
            Snapshot::Transcript(_) => CheckpointKind::Transcript,
            Snapshot::Media(_) => CheckpointKind::Media,
        }
    }

    /// Whether `self` is worth writing given the last persisted value.
    ///
    /// Media positions must move by more than `min_delta` seconds; every other
    /// kind is written on any change.
    pub fn differs_materially(&self, previous: &Snapshot, min_delta: f64) -> bool {
        match (self, previous) {
            (Snapshot::Media(now), Snapshot::Media(prev)) => {
                now.media_id != prev.media_id
                    || (now.duration_seconds - prev.duration_seconds).abs() > f64::EPSILON
                    || (now.position_seconds - prev.position_seconds).abs() > min_delta
            }
            (now, prev) => now != prev,
        }
    }

    /// Payload stored inside the primary envelope
    pub(crate) fn envelope_payload(&self) -> serde_json::Result<Value> {
        match self {
            Snapshot::Generic(value) | Snapshot::StructuredForm(value) => Ok(value.clone()),
            Snapshot::Transcript(transcript) => serde_json::to_value(&transcript.messages),
            Snapshot::Media(position) => serde_json::to_value(position),
        }
    }

    /// Rebuild a snapshot from an envelope payload.
    ///
    /// Transcript drafts live under their own keys; the caller fills them in.
    pub(crate) fn from_envelope_payload(
        kind: CheckpointKind,
        payload: Value,
    ) -> serde_json::Result<Self> {
        Ok(match kind {
            CheckpointKind::Generic => Snapshot::Generic(payload),
            CheckpointKind::StructuredForm => Snapshot::StructuredForm(payload),
            CheckpointKind::Transcript => {
                Snapshot::Transcript(TranscriptSnapshot::new(serde_json::from_value(payload)?))
            }
            CheckpointKind::Media => Snapshot::Media(serde_json::from_value(payload)?),
        })
    }

    /// Serialize into `(field, value)` pairs, one KeyStore write each.
    ///
    /// The primary envelope comes first so the auxiliary transcript keys are
    /// never written without it.
    pub(crate) fn to_entries(&self, saved_at: DateTime<Utc>) -> serde_json::Result<Vec<(Field, String)>> {
        let envelope = StoredEnvelope::new(self.kind(), self.envelope_payload()?, saved_at);
        let mut entries = vec![(self.kind().primary_field(), serde_json::to_string(&envelope)?)];

        if let Snapshot::Transcript(transcript) = self {
            entries.push((Field::UserInput, serde_json::to_string(&transcript.draft)?));
            entries.push((Field::ShowPrompts, serde_json::to_string(&transcript.show_prompts)?));
        }

        Ok(entries)
    }
}

/// The JSON blob written under a primary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEnvelope {
    /// Schema version of the envelope
    pub v: u32,
    pub kind: CheckpointKind,
    pub saved_at: DateTime<Utc>,
    pub payload: Value,
}

impl StoredEnvelope {
    /// Current envelope format version
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(kind: CheckpointKind, payload: Value, saved_at: DateTime<Utc>) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            kind,
            saved_at,
            payload,
        }
    }
}

/// A checkpoint as read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub section_id: String,
    pub kind: CheckpointKind,
    pub payload: Snapshot,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transcript_message_wire_format() {
        let raw = json!({"type": "ai", "text": "Welcome", "isWelcome": true, "id": 7});
        let message: TranscriptMessage = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(message.role, MessageRole::Ai);
        assert!(message.is_welcome);
        assert_eq!(message.extra.get("id"), Some(&json!(7)));
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn test_placeholder_detection() {
        let welcome_only = TranscriptSnapshot::new(vec![TranscriptMessage::welcome("Welcome")]);
        assert!(welcome_only.is_placeholder());
        assert!(TranscriptSnapshot::new(Vec::new()).is_placeholder());

        let mut real = welcome_only.clone();
        real.messages.push(TranscriptMessage::user("What is a derivative?"));
        assert!(!real.is_placeholder());
    }

    #[test]
    fn test_media_delta_threshold() {
        let saved = Snapshot::Media(MediaPosition::new("vid-1", 10.0, 120.0));

        let nudged = Snapshot::Media(MediaPosition::new("vid-1", 10.6, 120.0));
        assert!(!nudged.differs_materially(&saved, 1.0));

        let moved = Snapshot::Media(MediaPosition::new("vid-1", 11.5, 120.0));
        assert!(moved.differs_materially(&saved, 1.0));

        let other_asset = Snapshot::Media(MediaPosition::new("vid-2", 10.0, 120.0));
        assert!(other_asset.differs_materially(&saved, 1.0));
    }

    #[test]
    fn test_near_end() {
        assert!(MediaPosition::new("v", 115.0, 120.0).is_near_end(10.0));
        assert!(!MediaPosition::new("v", 100.0, 120.0).is_near_end(10.0));
    }

    #[test]
    fn test_transcript_entries_envelope_first() {
        let snapshot = Snapshot::Transcript(
            TranscriptSnapshot::new(vec![TranscriptMessage::user("hi")]).with_draft("half a"),
        );
        let entries = snapshot.to_entries(Utc::now()).unwrap();

        let fields: Vec<Field> = entries.iter().map(|(field, _)| *field).collect();
        assert_eq!(fields, vec![Field::Chat, Field::UserInput, Field::ShowPrompts]);
        assert_eq!(entries[1].1, "\"half a\"");
        assert_eq!(entries[2].1, "true");
    }
}
