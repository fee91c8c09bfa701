//! Validated deserialization of stored records
//!
//! Stored data may come from an older schema, a manual edit or a write that
//! was interrupted by a crash. [`CorruptionGuard`] treats any parse failure or
//! shape mismatch as "no usable data": the key is purged, a diagnostic is
//! logged and the caller sees `None`. Nothing here returns an error.

use crate::record::{CheckpointKind, StoredEnvelope};
use crate::store::KeyStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Required top-level payload fields for object-shaped kinds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl RecordSchema {
    /// Schema accepting any JSON object
    pub fn any_object() -> Self {
        Self::default()
    }

    pub fn with_required<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Names of required fields absent from `payload`, or `Err` when the
    /// payload is not an object at all
    pub fn missing_fields(&self, payload: &Value) -> std::result::Result<Vec<String>, String> {
        let object = payload
            .as_object()
            .ok_or_else(|| "payload is not an object".to_string())?;

        Ok(self
            .required_fields
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .cloned()
            .collect())
    }
}

/// Parses stored strings, purging whatever fails validation
#[derive(Debug, Clone, Copy)]
pub struct CorruptionGuard<'a> {
    store: &'a KeyStore,
}

impl<'a> CorruptionGuard<'a> {
    pub fn new(store: &'a KeyStore) -> Self {
        Self { store }
    }

    /// Read and validate the envelope stored at `key`.
    ///
    /// `schema` is only consulted for object-shaped kinds.
    pub fn read_envelope(
        &self,
        key: &str,
        expected: CheckpointKind,
        schema: Option<&RecordSchema>,
    ) -> Option<StoredEnvelope> {
        let raw = self.store.get(key);
        self.parse_envelope(key, raw, expected, schema)
    }

    /// Validate an already-read raw value
    pub fn parse_envelope(
        &self,
        key: &str,
        raw: Option<String>,
        expected: CheckpointKind,
        schema: Option<&RecordSchema>,
    ) -> Option<StoredEnvelope> {
        let raw = raw?;

        let envelope: StoredEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => return self.purge(key, &format!("unparseable: {}", e)),
        };

        if envelope.v != StoredEnvelope::CURRENT_VERSION {
            return self.purge(key, &format!("unsupported version {}", envelope.v));
        }

        if envelope.kind != expected {
            return self.purge(
                key,
                &format!("kind mismatch: stored {}, expected {}", envelope.kind, expected),
            );
        }

        if matches!(expected, CheckpointKind::Generic | CheckpointKind::StructuredForm) {
            let schema = schema.cloned().unwrap_or_default();
            match schema.missing_fields(&envelope.payload) {
                Ok(missing) if missing.is_empty() => {}
                Ok(missing) => {
                    return self.purge(key, &format!("missing fields: {}", missing.join(", ")))
                }
                Err(reason) => return self.purge(key, &reason),
            }
        }

        Some(envelope)
    }

    /// Parse an auxiliary JSON value such as a transcript draft
    pub fn read_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.store.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => self.purge(key, &format!("unparseable: {}", e)),
        }
    }

    /// Remove `key` and report why
    pub fn purge<T>(&self, key: &str, reason: &str) -> Option<T> {
        warn!(key, reason, "Discarding corrupt checkpoint data");
        self.store.remove(key);
        None
    }
}
