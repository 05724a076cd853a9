//! In-memory `ViewStore` for native builds and tests.
//!
//! Keeps the same contract as the IndexedDB store: rows keyed by `id`, a
//! non-unique timestamp index rebuilt on every put, batches applied all or
//! nothing. Data is not persisted across restarts.
//!
//! A legacy blob can be staged before `open()` to exercise migration, and
//! failures can be injected to exercise the error-collapsing paths.

use super::{legacy, row_id, Direction, StoreError, TimestampRange, ViewStore};
use crate::codec::timestamp_of;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

#[derive(Default)]
struct Inner {
    rows: HashMap<String, Value>,
    /// (timestamp, id), ordered like an IndexedDB index cursor.
    by_timestamp: BTreeSet<(i64, String)>,
}

impl Inner {
    fn insert(&mut self, row: Value) -> Result<(), StoreError> {
        let id = row_id(&row)?.to_string();
        self.remove(&id);
        if let Some(ts) = timestamp_of(&row) {
            self.by_timestamp.insert((ts, id.clone()));
        }
        self.rows.insert(id, row);
        Ok(())
    }

    fn remove(&mut self, id: &str) {
        if let Some(old) = self.rows.remove(id) {
            if let Some(ts) = timestamp_of(&old) {
                self.by_timestamp.remove(&(ts, id.to_string()));
            }
        }
    }

    fn walk(&self, direction: Direction, range: TimestampRange) -> Vec<&(i64, String)> {
        let in_range = self.by_timestamp.iter().filter(|(ts, _)| range.contains(*ts));
        match direction {
            Direction::Ascending => in_range.collect(),
            Direction::Descending => {
                let mut v: Vec<_> = in_range.collect();
                v.reverse();
                v
            }
        }
    }
}

/// In-memory view store.
#[derive(Clone, Default)]
pub struct MemoryViewStore {
    inner: Rc<RefCell<Inner>>,
    open: Rc<Cell<bool>>,
    legacy_blob: Rc<RefCell<Option<String>>>,
    fail_open: Rc<Cell<bool>>,
    fail_writes: Rc<Cell<bool>>,
    commits: Rc<Cell<u32>>,
}

impl MemoryViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a legacy blob that the next upgrade will migrate.
    pub fn with_legacy_blob(self, blob: impl Into<String>) -> Self {
        *self.legacy_blob.borrow_mut() = Some(blob.into());
        self
    }

    /// The legacy blob still waiting to be migrated, if any.
    pub fn legacy_blob(&self) -> Option<String> {
        self.legacy_blob.borrow().clone()
    }

    /// Makes `open()` fail, as when IndexedDB is blocked or missing.
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.set(fail);
    }

    /// Makes every write transaction fail, as on quota exhaustion.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Number of write transactions committed so far.
    pub fn committed_transactions(&self) -> u32 {
        self.commits.get()
    }

    /// Writes a raw row, bypassing the codec. Used to plant damaged rows.
    pub fn insert_raw(&self, row: Value) -> Result<(), StoreError> {
        self.inner.borrow_mut().insert(row)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.get() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("Database not open".to_string()))
        }
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.fail_writes.get() {
            return Err(StoreError::Transaction("QuotaExceededError".to_string()));
        }
        Ok(())
    }

    fn commit(&self) {
        self.commits.set(self.commits.get() + 1);
    }
}

impl ViewStore for MemoryViewStore {
    async fn open(&self) -> Result<(), StoreError> {
        if self.open.get() {
            return Ok(());
        }
        if self.fail_open.get() {
            return Err(StoreError::Unavailable("IndexedDB not available".to_string()));
        }

        // First open is the upgrade: migrate the legacy blob, then drop it.
        if let Some(blob) = self.legacy_blob.borrow_mut().take() {
            let rows = legacy::parse_legacy_blob(&blob);
            let mut inner = self.inner.borrow_mut();
            let mut migrated = 0;
            for row in rows {
                if inner.insert(row).is_ok() {
                    migrated += 1;
                }
            }
            log::info!("Migrated {} legacy history entries", migrated);
        }

        self.open.set(true);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.borrow().rows.get(id).cloned())
    }

    async fn put(&self, row: Value) -> Result<(), StoreError> {
        self.begin_write()?;
        self.inner.borrow_mut().insert(row)?;
        self.commit();
        Ok(())
    }

    async fn put_batch(&self, rows: Vec<Value>) -> Result<(), StoreError> {
        self.begin_write()?;
        // Validate first so a bad row aborts the whole batch.
        for row in &rows {
            row_id(row)?;
        }
        let mut inner = self.inner.borrow_mut();
        for row in rows {
            inner.insert(row)?;
        }
        self.commit();
        Ok(())
    }

    async fn update_rows<F>(&self, ids: Vec<String>, mut update: F) -> Result<u32, StoreError>
    where
        F: FnMut(&str, Option<Value>) -> Option<Value> + 'static,
    {
        self.begin_write()?;
        let mut inner = self.inner.borrow_mut();
        let mut staged = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(row) = update(id.as_str(), inner.rows.get(id).cloned()) else {
                continue;
            };
            if row_id(&row)? != id.as_str() {
                return Err(StoreError::Serialization(format!(
                    "update of {} returned a different id",
                    id
                )));
            }
            staged.push(row);
        }
        let written = staged.len() as u32;
        for row in staged {
            inner.insert(row)?;
        }
        drop(inner);
        self.commit();
        Ok(written)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.begin_write()?;
        self.inner.borrow_mut().remove(id);
        self.commit();
        Ok(())
    }

    async fn count(&self) -> Result<u32, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.borrow().rows.len() as u32)
    }

    async fn iterate_by_timestamp(
        &self,
        direction: Direction,
        range: TimestampRange,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.borrow();
        let limit = limit.map_or(usize::MAX, |l| l as usize);
        Ok(inner
            .walk(direction, range)
            .into_iter()
            .take(limit)
            .filter_map(|(_, id)| inner.rows.get(id).cloned())
            .collect())
    }

    async fn delete_by_timestamp(&self, range: TimestampRange, limit: u32) -> Result<u32, StoreError> {
        self.begin_write()?;
        let mut inner = self.inner.borrow_mut();
        let doomed: Vec<String> = inner
            .walk(Direction::Ascending, range)
            .into_iter()
            .take(limit as usize)
            .map(|(_, id)| id.clone())
            .collect();
        for id in &doomed {
            inner.remove(id);
        }
        drop(inner);
        self.commit();
        Ok(doomed.len() as u32)
    }

    async fn get_all(&self) -> Result<Vec<Value>, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.borrow();
        let mut ids: Vec<&String> = inner.rows.keys().collect();
        ids.sort();
        Ok(ids.into_iter().filter_map(|id| inner.rows.get(id).cloned()).collect())
    }
}
