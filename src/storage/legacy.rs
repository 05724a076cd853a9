//! Migration of the legacy single-blob history.
//!
//! Before the object store existed, history lived in one localStorage entry
//! holding either a JSON array of plaintext records or an object mapping id
//! to record. On the schema upgrade the blob is parsed, each usable entry is
//! re-encoded, and the blob is removed once the upgrade has committed.

use crate::codec;
use crate::record::ViewRecord;
use serde_json::Value;

/// Parses a legacy blob into rows ready to store.
///
/// Entries that are not valid records are skipped; an unparseable blob
/// yields nothing.
pub fn parse_legacy_blob(blob: &str) -> Vec<Value> {
    let parsed: Value = match serde_json::from_str(blob) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Legacy history blob is not JSON, dropping it: {}", e);
            return Vec::new();
        }
    };

    let entries: Vec<Value> = match parsed {
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .map(|(id, mut entry)| {
                if let Value::Object(fields) = &mut entry {
                    fields.entry("id").or_insert(Value::String(id));
                }
                entry
            })
            .collect(),
        _ => {
            log::warn!("Legacy history blob has unexpected shape, dropping it");
            return Vec::new();
        }
    };

    let total = entries.len();
    let rows: Vec<Value> = entries
        .into_iter()
        .filter_map(|entry| {
            let record: ViewRecord = match codec::decode(&entry) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("Skipping legacy entry: {}", e);
                    return None;
                }
            };
            codec::encode_value(&record).ok()
        })
        .collect();

    if rows.len() < total {
        log::info!(
            "Legacy history: {} of {} entries usable",
            rows.len(),
            total
        );
    }
    rows
}

/// Reads the legacy blob from localStorage.
#[cfg(target_arch = "wasm32")]
pub fn read_legacy_blob(key: &str) -> Option<String> {
    let storage = web_sys::window()?.local_storage().ok()??;
    storage.get_item(key).ok()?
}

/// Removes the legacy blob from localStorage.
#[cfg(target_arch = "wasm32")]
pub fn clear_legacy_blob(key: &str) {
    let storage = match web_sys::window().map(|w| w.local_storage()) {
        Some(Ok(Some(s))) => s,
        _ => return,
    };

    if let Err(e) = storage.remove_item(key) {
        log::warn!("Failed to remove legacy history blob: {:?}", e);
    } else {
        log::info!("Removed legacy history blob `{}`", key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UnixMillis;

    #[test]
    fn test_array_blob() {
        let blob = r#"[
            {"id": "/a", "timestamp": 100, "name": "A"},
            {"id": "/b", "timestamp": 200, "synced": true}
        ]"#;
        let rows = parse_legacy_blob(blob);
        assert_eq!(rows.len(), 2);

        let a = codec::decode(&rows[0]).unwrap();
        assert_eq!(a.id, "/a");
        assert_eq!(a.timestamp, UnixMillis(100));
        assert_eq!(a.payload.name.as_deref(), Some("A"));
        assert!(rows[0].get("data").is_some());

        assert!(codec::decode(&rows[1]).unwrap().synced);
    }

    #[test]
    fn test_map_blob_takes_id_from_key() {
        let blob = r#"{"/x": {"timestamp": 5}, "/y": {"id": "/y", "timestamp": 6}}"#;
        let mut ids: Vec<String> = parse_legacy_blob(blob)
            .iter()
            .map(|r| codec::decode(r).unwrap().id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["/x", "/y"]);
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let blob = r#"[{"id": "/ok", "timestamp": 1}, {"timestamp": 2}, "junk", {"id": "", "timestamp": 3}]"#;
        let rows = parse_legacy_blob(blob);
        assert_eq!(rows.len(), 1);
        assert_eq!(codec::decode(&rows[0]).unwrap().id, "/ok");
    }

    #[test]
    fn test_unparseable_blob_yields_nothing() {
        assert!(parse_legacy_blob("{not json").is_empty());
        assert!(parse_legacy_blob("42").is_empty());
    }
}
