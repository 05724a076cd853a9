//! Write-coalescing queue.
//!
//! Rapid navigation produces bursts of views. Instead of one transaction per
//! view, `enqueue` appends to a pending list and the first append of a cycle
//! asks the caller to arm a short timer. When the timer fires, `flush`
//! drains the whole list in one synchronous step and commits it as a single
//! batched transaction. Views enqueued while that commit is in flight start
//! the next cycle.
//!
//! Within one batch only the last state per id is written.

use crate::codec;
use crate::record::ViewRecord;
use crate::storage::{StoreError, ViewStore};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Running write counters, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WriteStats {
    /// Records committed through either write path.
    pub total_writes: u64,
    /// Batched flushes that committed.
    pub batches_processed: u64,
    /// Mean records per committed batch.
    pub average_batch_size: f64,
    /// Time spent inside committed flushes, in milliseconds.
    pub total_flush_ms: f64,
    /// Flushes whose transaction failed; their records were dropped.
    pub failed_batches: u64,
}

/// Pending-write buffer shared by the facade and its flush task.
pub struct WriteQueue<S> {
    store: S,
    pending: RefCell<Vec<ViewRecord>>,
    scheduled: Cell<bool>,
    stats: RefCell<WriteStats>,
    batched_records: Cell<u64>,
}

impl<S: ViewStore> WriteQueue<S> {
    pub fn new(store: S) -> Rc<Self> {
        Rc::new(Self {
            store,
            pending: RefCell::new(Vec::new()),
            scheduled: Cell::new(false),
            stats: RefCell::new(WriteStats::default()),
            batched_records: Cell::new(0),
        })
    }

    /// Queues a record. Returns `true` when the caller must arm a flush.
    pub fn enqueue(&self, record: ViewRecord) -> bool {
        self.pending.borrow_mut().push(record);
        !self.scheduled.replace(true)
    }

    /// Number of records waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Whether a flush has been armed and not yet drained.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    /// Latest queued state for `id`, if any.
    pub fn pending_for(&self, id: &str) -> Option<ViewRecord> {
        self.pending
            .borrow()
            .iter()
            .rev()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Sets the synced flag on queued copies of `id`.
    ///
    /// Returns whether anything was queued for it.
    pub fn mark_pending_synced(&self, id: &str) -> bool {
        let mut found = false;
        for record in self.pending.borrow_mut().iter_mut().filter(|r| r.id == id) {
            record.synced = true;
            found = true;
        }
        found
    }

    /// Takes everything pending and resets the scheduled flag.
    fn drain(&self) -> Vec<ViewRecord> {
        let batch = std::mem::take(&mut *self.pending.borrow_mut());
        self.scheduled.set(false);
        batch
    }

    /// Drains the queue and commits it as one transaction.
    ///
    /// Only the last queued state per id is written. The stored synced flag
    /// is read and merged inside the same transaction, so a delivery that
    /// lands while the batch is in flight is never rolled back.
    ///
    /// Returns the number of records committed.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let batch = self.drain();
        if batch.is_empty() {
            return Ok(0);
        }

        let start = web_time::Instant::now();
        let (ids, latest) = coalesce(batch);

        match self.store.update_rows(ids, merge_into(latest)).await {
            Ok(written) => {
                let count = written as usize;
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.record_batch(count, elapsed_ms);
                log::debug!("Flushed {} view(s) in {:.1}ms", count, elapsed_ms);
                Ok(count)
            }
            Err(e) => {
                self.stats.borrow_mut().failed_batches += 1;
                Err(e)
            }
        }
    }

    /// Writes one record in its own transaction, skipping the queue.
    pub async fn write_immediate(&self, record: ViewRecord) -> Result<(), StoreError> {
        encode_row(&record)?;
        let (ids, latest) = coalesce(vec![record]);
        let written = self.store.update_rows(ids, merge_into(latest)).await?;
        self.stats.borrow_mut().total_writes += u64::from(written);
        Ok(())
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> WriteStats {
        *self.stats.borrow()
    }

    fn record_batch(&self, count: usize, elapsed_ms: f64) {
        let mut stats = self.stats.borrow_mut();
        stats.total_writes += count as u64;
        stats.batches_processed += 1;
        stats.total_flush_ms += elapsed_ms;
        self.batched_records
            .set(self.batched_records.get() + count as u64);
        stats.average_batch_size =
            self.batched_records.get() as f64 / stats.batches_processed as f64;
    }
}

fn encode_row(record: &ViewRecord) -> Result<Value, StoreError> {
    codec::encode_value(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Keeps the last state per id. Ids come back in order of their last view.
fn coalesce(batch: Vec<ViewRecord>) -> (Vec<String>, HashMap<String, ViewRecord>) {
    let mut latest = HashMap::with_capacity(batch.len());
    let mut ids = Vec::with_capacity(batch.len());
    for record in batch.into_iter().rev() {
        if !latest.contains_key(&record.id) {
            ids.push(record.id.clone());
            latest.insert(record.id.clone(), record);
        }
    }
    ids.reverse();
    (ids, latest)
}

/// Row update that writes the queued state, never clearing a stored
/// synced flag.
fn merge_into(
    mut latest: HashMap<String, ViewRecord>,
) -> impl FnMut(&str, Option<Value>) -> Option<Value> + 'static {
    move |id, stored| {
        let mut record = latest.remove(id)?;
        if let Some(stored) = stored.and_then(|row| codec::decode(&row).ok()) {
            record.merge_synced_from(&stored);
        }
        match encode_row(&record) {
            Ok(row) => Some(row),
            Err(e) => {
                log::warn!("Dropping view of {}: {}", id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{UnixMillis, ViewMetadata};
    use crate::storage::MemoryViewStore;
    use futures_executor::block_on;

    fn view(id: &str, ts: i64) -> ViewRecord {
        ViewRecord::new(id, UnixMillis(ts), false, ViewMetadata::default()).unwrap()
    }

    fn queue() -> (MemoryViewStore, Rc<WriteQueue<MemoryViewStore>>) {
        let store = MemoryViewStore::new();
        block_on(store.open()).unwrap();
        (store.clone(), WriteQueue::new(store))
    }

    fn stored(store: &MemoryViewStore, id: &str) -> Option<ViewRecord> {
        block_on(store.get(id))
            .unwrap()
            .map(|row| codec::decode(&row).unwrap())
    }

    #[test]
    fn test_only_first_enqueue_arms_flush() {
        let (_, q) = queue();
        assert!(q.enqueue(view("/a", 1)));
        assert!(!q.enqueue(view("/b", 2)));
        assert!(!q.enqueue(view("/c", 3)));
        assert_eq!(q.pending_len(), 3);

        block_on(q.flush()).unwrap();
        assert!(!q.is_scheduled());
        assert!(q.enqueue(view("/d", 4)));
    }

    #[test]
    fn test_burst_commits_in_one_transaction() {
        let (store, q) = queue();
        for (id, ts) in [("a", 1), ("b", 2), ("c", 3)] {
            q.enqueue(view(id, ts));
        }
        assert_eq!(block_on(q.flush()).unwrap(), 3);
        assert_eq!(store.committed_transactions(), 1);
        assert_eq!(block_on(store.count()).unwrap(), 3);

        let stats = q.stats();
        assert_eq!(stats.total_writes, 3);
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.average_batch_size, 3.0);
    }

    #[test]
    fn test_last_write_wins_within_batch() {
        let (store, q) = queue();
        q.enqueue(view("/a", 10));
        q.enqueue(view("/a", 30));
        q.enqueue(view("/a", 20));
        assert_eq!(block_on(q.flush()).unwrap(), 1);

        assert_eq!(block_on(store.count()).unwrap(), 1);
        assert_eq!(stored(&store, "/a").unwrap().timestamp, UnixMillis(20));
    }

    #[test]
    fn test_repeated_ids_are_written_once_per_flush() {
        let (store, q) = queue();
        for (id, ts) in [("/a", 1), ("/b", 2), ("/a", 3), ("/c", 4), ("/a", 5)] {
            q.enqueue(view(id, ts));
        }
        assert_eq!(block_on(q.flush()).unwrap(), 3);
        assert_eq!(store.committed_transactions(), 1);
        assert_eq!(q.stats().total_writes, 3);
        assert_eq!(stored(&store, "/a").unwrap().timestamp, UnixMillis(5));
        assert_eq!(stored(&store, "/b").unwrap().timestamp, UnixMillis(2));
    }

    #[test]
    fn test_flag_synced_after_enqueue_survives_flush() {
        let (store, q) = queue();
        block_on(q.write_immediate(view("/a", 1))).unwrap();
        q.enqueue(view("/a", 2));

        // Delivery confirmed directly in the store while the view is queued.
        let mut delivered = view("/a", 1);
        delivered.synced = true;
        block_on(store.put(codec::encode_value(&delivered).unwrap())).unwrap();

        block_on(q.flush()).unwrap();
        let record = stored(&store, "/a").unwrap();
        assert_eq!(record.timestamp, UnixMillis(2));
        assert!(record.synced);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let (store, q) = queue();
        assert_eq!(block_on(q.flush()).unwrap(), 0);
        assert_eq!(store.committed_transactions(), 0);
        assert_eq!(q.stats(), WriteStats::default());
    }

    #[test]
    fn test_rewrite_keeps_synced_flag() {
        let (store, q) = queue();
        let mut synced = view("/a", 1);
        synced.synced = true;
        block_on(q.write_immediate(synced)).unwrap();

        q.enqueue(view("/a", 2));
        block_on(q.flush()).unwrap();

        let record = stored(&store, "/a").unwrap();
        assert_eq!(record.timestamp, UnixMillis(2));
        assert!(record.synced);
    }

    #[test]
    fn test_mark_pending_synced() {
        let (store, q) = queue();
        q.enqueue(view("/a", 1));
        assert!(q.mark_pending_synced("/a"));
        assert!(!q.mark_pending_synced("/b"));
        assert!(q.pending_for("/a").unwrap().synced);

        block_on(q.flush()).unwrap();
        assert!(stored(&store, "/a").unwrap().synced);
    }

    #[test]
    fn test_failed_flush_is_counted_and_drained() {
        let (store, q) = queue();
        store.fail_writes(true);
        q.enqueue(view("/a", 1));

        assert!(block_on(q.flush()).is_err());
        assert_eq!(q.pending_len(), 0);
        assert!(!q.is_scheduled());
        let stats = q.stats();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.batches_processed, 0);
        assert_eq!(stats.total_writes, 0);
    }

    #[test]
    fn test_immediate_write_bypasses_queue() {
        let (store, q) = queue();
        q.enqueue(view("/queued", 1));
        block_on(q.write_immediate(view("/now", 2))).unwrap();

        assert!(stored(&store, "/now").is_some());
        assert!(stored(&store, "/queued").is_none());
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.stats().total_writes, 1);
    }
}
