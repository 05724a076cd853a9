//! Obfuscation codec for stored view records.
//!
//! ## Wire form
//!
//! ```text
//! { "id": "/gallery/42", "timestamp": 1700000000000, "data": "<base64>" }
//! ```
//!
//! `id` is the object store key path and `timestamp` feeds the
//! `by_timestamp` index, so both stay plaintext. Everything else
//! (`synced` plus the metadata) is serialized to JSON, XOR-ed with a fixed
//! keystream and base64 encoded into `data`.
//!
//! This only keeps history out of casual view in devtools. There is no
//! integrity check: a tampered row either decodes to whatever the bytes say
//! or is reported as unreadable.
//!
//! Rows written before the codec existed are plain `ViewRecord` JSON with no
//! `data` field; `decode` accepts those as-is.

use crate::record::{UnixMillis, ViewMetadata, ViewRecord};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const KEYSTREAM: [u8; 32] = [
    0x5a, 0x13, 0xc7, 0x8e, 0x21, 0xf4, 0x6b, 0x90, 0x3d, 0xa2, 0x17, 0xe8, 0x4c, 0x71, 0xb5, 0x09,
    0x96, 0x2e, 0xd3, 0x68, 0x0f, 0xbb, 0x44, 0x7a, 0xe1, 0x35, 0x8c, 0x52, 0xfa, 0x1b, 0xc0, 0x67,
];

/// Why a stored row could not be turned back into a record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("row is unreadable: {0}")]
    Unreadable(String),
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The stored shape of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRecord {
    pub id: String,
    pub timestamp: i64,
    pub data: String,
}

impl EncodedRecord {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "timestamp": self.timestamp,
            "data": self.data,
        })
    }
}

/// Fields hidden inside `data`.
#[derive(Serialize, Deserialize)]
struct HiddenFields {
    #[serde(default)]
    synced: bool,
    #[serde(default)]
    payload: ViewMetadata,
}

fn apply_keystream(bytes: &mut [u8]) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= KEYSTREAM[i % KEYSTREAM.len()];
    }
}

/// Encodes a record into its stored shape.
pub fn encode(record: &ViewRecord) -> Result<EncodedRecord, CodecError> {
    let hidden = HiddenFields {
        synced: record.synced,
        payload: record.payload.clone(),
    };
    let mut bytes = serde_json::to_vec(&hidden)?;
    apply_keystream(&mut bytes);

    Ok(EncodedRecord {
        id: record.id.clone(),
        timestamp: record.timestamp.0,
        data: STANDARD.encode(bytes),
    })
}

/// Encodes straight to a storable JSON value.
pub fn encode_value(record: &ViewRecord) -> Result<Value, CodecError> {
    encode(record).map(|e| e.to_value())
}

/// Decodes a stored row.
///
/// Accepts both the obfuscated shape and legacy plaintext rows.
pub fn decode(value: &Value) -> Result<ViewRecord, CodecError> {
    let obj = value
        .as_object()
        .ok_or_else(|| CodecError::Unreadable("row is not an object".to_string()))?;

    match obj.get("data") {
        Some(Value::String(data)) => decode_obfuscated(value, data),
        Some(_) => Err(CodecError::Unreadable("`data` is not a string".to_string())),
        None => decode_legacy(value),
    }
}

fn decode_obfuscated(value: &Value, data: &str) -> Result<ViewRecord, CodecError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CodecError::Unreadable("missing id".to_string()))?;
    let timestamp = timestamp_of(value)
        .ok_or_else(|| CodecError::Unreadable(format!("missing timestamp for {}", id)))?;

    let mut bytes = STANDARD
        .decode(data)
        .map_err(|e| CodecError::Unreadable(format!("{}: bad base64: {}", id, e)))?;
    apply_keystream(&mut bytes);

    let hidden: HiddenFields = serde_json::from_slice(&bytes)
        .map_err(|e| CodecError::Unreadable(format!("{}: bad payload: {}", id, e)))?;

    Ok(ViewRecord {
        id: id.to_string(),
        timestamp: UnixMillis(timestamp),
        synced: hidden.synced,
        payload: hidden.payload,
    })
}

fn decode_legacy(value: &Value) -> Result<ViewRecord, CodecError> {
    let record: ViewRecord = serde_json::from_value(value.clone())
        .map_err(|e| CodecError::Unreadable(format!("not a legacy record: {}", e)))?;
    record
        .validate()
        .map_err(|e| CodecError::Unreadable(e.to_string()))?;
    Ok(record)
}

/// Reads the indexed timestamp of a stored row.
///
/// JavaScript numbers may come back as floats after a JSON round trip, so
/// both integer and float forms are accepted.
pub fn timestamp_of(value: &Value) -> Option<i64> {
    let ts = value.get("timestamp")?;
    ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64))
}
