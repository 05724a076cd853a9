//! Persistent storage for view records.
//!
//! `ViewStore` is the adapter the rest of the crate talks to. On WASM
//! targets it is backed by IndexedDB; everywhere else (and in tests) by an
//! in-memory store with the same semantics.
//!
//! ## Layout
//! ```text
//! IndexedDB "view-history" (v2)
//! └── viewed            - keyPath "id", one row per item
//!     └── by_timestamp  - non-unique index on "timestamp"
//!
//! localStorage "viewed_items" - legacy single blob, migrated once then removed
//! ```
//!
//! Rows are kept as raw JSON values so a damaged row still reaches the
//! codec, which decides whether to skip it.

pub mod legacy;
pub mod memory;

#[cfg(target_arch = "wasm32")]
mod indexeddb;

#[cfg(target_arch = "wasm32")]
pub use indexeddb::IndexedDbViewStore;
pub use memory::MemoryViewStore;

use serde_json::Value;
use std::future::Future;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The database could not be opened, or is not open.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A transaction failed to complete (quota, corruption, abort).
    #[error("transaction failed: {0}")]
    Transaction(String),
    /// A row could not be converted to or from its stored form.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Cursor direction over the timestamp index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// Bounds on the timestamp index. `None` means unbounded on that side.
///
/// `lower` is inclusive, `upper` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampRange {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
}

impl TimestampRange {
    pub fn all() -> Self {
        Self::default()
    }

    /// Everything strictly older than `cutoff`.
    pub fn before(cutoff: i64) -> Self {
        Self {
            lower: None,
            upper: Some(cutoff),
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.lower.map_or(true, |l| ts >= l) && self.upper.map_or(true, |u| ts < u)
    }
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Name of the database (IndexedDB database name on web).
    pub database_name: String,
    /// Name of the object store holding the rows.
    pub store_name: String,
    /// Name of the timestamp index.
    pub index_name: String,
    /// Schema version (incrementing triggers upgrade).
    pub version: u32,
    /// localStorage key of the legacy single-blob history.
    pub legacy_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_name: "view-history".to_string(),
            store_name: "viewed".to_string(),
            index_name: "by_timestamp".to_string(),
            version: 2,
            legacy_key: "viewed_items".to_string(),
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with the given database name.
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Self::default()
        }
    }

    /// Sets the schema version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the legacy localStorage key.
    pub fn with_legacy_key(mut self, key: impl Into<String>) -> Self {
        self.legacy_key = key.into();
        self
    }
}

/// Storage adapter for view records.
///
/// Every row must carry a string `id`; rows with a numeric `timestamp` are
/// visible through the timestamp index.
///
/// Note: no `Send` bounds, WASM is single-threaded and JS handles cannot
/// cross threads.
pub trait ViewStore {
    /// Opens the store, upgrading the schema and migrating legacy data.
    ///
    /// Calling it again after a successful open is a no-op.
    fn open(&self) -> impl Future<Output = Result<(), StoreError>>;

    /// Gets a row by id.
    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Value>, StoreError>>;

    /// Inserts or replaces a row.
    fn put(&self, row: Value) -> impl Future<Output = Result<(), StoreError>>;

    /// Inserts or replaces rows in a single transaction, in order.
    fn put_batch(&self, rows: Vec<Value>) -> impl Future<Output = Result<(), StoreError>>;

    /// Read-modify-write of several rows in one readwrite transaction.
    ///
    /// For each id, `update` receives the stored row (if any) and returns the
    /// row to write, or `None` to leave it untouched. No other write can land
    /// between the read and the write of a row. Returns how many rows were
    /// written; a failure anywhere aborts the whole transaction.
    ///
    /// The transaction is created on the first poll, so writes issued later
    /// are ordered after it.
    fn update_rows<F>(
        &self,
        ids: Vec<String>,
        update: F,
    ) -> impl Future<Output = Result<u32, StoreError>>
    where
        F: FnMut(&str, Option<Value>) -> Option<Value> + 'static;

    /// Deletes a row. Succeeds even if the id didn't exist.
    fn delete(&self, id: &str) -> impl Future<Output = Result<(), StoreError>>;

    /// Number of rows.
    fn count(&self) -> impl Future<Output = Result<u32, StoreError>>;

    /// Walks the timestamp index, returning at most `limit` rows.
    fn iterate_by_timestamp(
        &self,
        direction: Direction,
        range: TimestampRange,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<Value>, StoreError>>;

    /// Walks the timestamp index oldest first, deleting up to `limit` rows
    /// in `range` within one transaction. Returns how many were deleted.
    fn delete_by_timestamp(
        &self,
        range: TimestampRange,
        limit: u32,
    ) -> impl Future<Output = Result<u32, StoreError>>;

    /// All rows, including ones missing from the timestamp index.
    fn get_all(&self) -> impl Future<Output = Result<Vec<Value>, StoreError>>;
}

/// Extracts the primary key of a row.
pub(crate) fn row_id(row: &Value) -> Result<&str, StoreError> {
    row.get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Serialization("row has no string id".to_string()))
}
