//! Core record types for the view history.
//!
//! - `UnixMillis`: Timestamp in milliseconds since Unix epoch
//! - `ViewMetadata`: Descriptive fields shown in history lists
//! - `ViewRecord`: One history entry, keyed by item id
//!
//! Records are validated at construction so everything that reaches the
//! write queue has a usable id and a non-negative timestamp.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest accepted item id, in bytes.
pub const MAX_ID_LEN: usize = 2048;

/// Longest accepted `name`/`cover` value, in bytes.
pub const MAX_TEXT_LEN: usize = 1024;

/// Rejections raised at the write boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record id is empty")]
    EmptyId,
    #[error("record id is {0} bytes, limit is {MAX_ID_LEN}")]
    IdTooLong(usize),
    #[error("timestamp {0} is negative")]
    NegativeTimestamp(i64),
    #[error("metadata field `{field}` is {len} bytes, limit is {MAX_TEXT_LEN}")]
    FieldTooLong { field: &'static str, len: usize },
}

/// Unix timestamp in milliseconds.
///
/// Matches JavaScript `Date.now()` so stored rows stay readable by the
/// older plaintext format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixMillis(pub i64);

impl UnixMillis {
    pub fn now() -> Self {
        Self(crate::platform::now_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Whole milliseconds elapsed between `self` and a later `now`.
    pub fn age_at(&self, now: UnixMillis) -> i64 {
        now.0.saturating_sub(self.0)
    }
}

impl fmt::Display for UnixMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive metadata for a viewed item.
///
/// Everything here is optional; unknown fields coming from older rows or
/// callers are kept in `extra` so they survive a rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ViewMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_cover(mut self, cover: impl Into<String>) -> Self {
        self.cover = Some(cover.into());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    fn validate(&self) -> Result<(), RecordError> {
        for (field, value) in [("name", &self.name), ("cover", &self.cover)] {
            if let Some(v) = value {
                if v.len() > MAX_TEXT_LEN {
                    return Err(RecordError::FieldTooLong {
                        field,
                        len: v.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// One history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRecord {
    pub id: String,
    pub timestamp: UnixMillis,
    #[serde(default)]
    pub synced: bool,
    #[serde(flatten)]
    pub payload: ViewMetadata,
}

impl ViewRecord {
    /// Builds a validated record.
    pub fn new(
        id: impl Into<String>,
        timestamp: UnixMillis,
        synced: bool,
        payload: ViewMetadata,
    ) -> Result<Self, RecordError> {
        let record = Self {
            id: id.into(),
            timestamp,
            synced,
            payload,
        };
        record.validate()?;
        Ok(record)
    }

    /// A fresh, unsynced view of `id` at the current time.
    pub fn viewed_now(id: impl Into<String>, payload: ViewMetadata) -> Result<Self, RecordError> {
        Self::new(id, UnixMillis::now(), false, payload)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        if self.id.len() > MAX_ID_LEN {
            return Err(RecordError::IdTooLong(self.id.len()));
        }
        if self.timestamp.0 < 0 {
            return Err(RecordError::NegativeTimestamp(self.timestamp.0));
        }
        self.payload.validate()
    }

    /// Applies the one-way `unsynced -> synced` rule against a stored copy.
    ///
    /// A rewrite never clears a flag the stored record already has.
    pub fn merge_synced_from(&mut self, stored: &ViewRecord) {
        if stored.synced {
            self.synced = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_blank_id() {
        let err = ViewRecord::new("  ", UnixMillis(1), false, ViewMetadata::default()).unwrap_err();
        assert_eq!(err, RecordError::EmptyId);
    }

    #[test]
    fn test_rejects_oversized_fields() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        assert_eq!(
            ViewRecord::new(long.clone(), UnixMillis(1), false, ViewMetadata::default()),
            Err(RecordError::IdTooLong(MAX_ID_LEN + 1))
        );

        let meta = ViewMetadata::named("y".repeat(MAX_TEXT_LEN + 1));
        assert!(matches!(
            ViewRecord::new("/a", UnixMillis(1), false, meta),
            Err(RecordError::FieldTooLong { field: "name", .. })
        ));
    }

    #[test]
    fn test_rejects_negative_timestamp() {
        assert_eq!(
            ViewRecord::new("/a", UnixMillis(-5), false, ViewMetadata::default()),
            Err(RecordError::NegativeTimestamp(-5))
        );
    }

    #[test]
    fn test_merge_synced_is_one_way() {
        let stored = ViewRecord::new("/a", UnixMillis(1), true, ViewMetadata::default()).unwrap();
        let mut fresh = ViewRecord::new("/a", UnixMillis(2), false, ViewMetadata::default()).unwrap();
        fresh.merge_synced_from(&stored);
        assert!(fresh.synced);

        let stored = ViewRecord::new("/a", UnixMillis(1), false, ViewMetadata::default()).unwrap();
        let mut fresh = ViewRecord::new("/a", UnixMillis(2), true, ViewMetadata::default()).unwrap();
        fresh.merge_synced_from(&stored);
        assert!(fresh.synced);
    }

    #[test]
    fn test_plaintext_shape_flattens_metadata() {
        let record = ViewRecord::new(
            "/gallery/42",
            UnixMillis(1_700_000_000_000),
            false,
            ViewMetadata::named("Harbor").with_dimensions(800, 600),
        )
        .unwrap();

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "/gallery/42");
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert_eq!(json["name"], "Harbor");
        assert_eq!(json["width"], 800);
        assert!(json.get("cover").is_none());
    }
}
