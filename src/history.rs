//! Public facade over the store, write queue, retention and sync.
//!
//! `ViewHistory` is the only type hosts need. It never returns errors:
//! - store unavailable: reads are empty, writes are dropped;
//! - failed transaction: logged, treated as done;
//! - unreadable row: skipped;
//! - failed delivery: the record stays unsynced.
//!
//! Cloning is cheap and every clone drives the same history.

use crate::config::HistoryConfig;
use crate::platform;
use crate::queue::{WriteQueue, WriteStats};
use crate::record::{UnixMillis, ViewMetadata, ViewRecord};
use crate::retention::{RetentionEnforcer, SweepOutcome, SweepTrigger};
use crate::storage::{Direction, TimestampRange, ViewStore};
use crate::sync::{decode_rows, SyncCoordinator, SyncReport, ViewReporter};
use std::cell::Cell;
use std::rc::Rc;

pub struct ViewHistory<S, R> {
    store: S,
    config: Rc<HistoryConfig>,
    queue: Rc<WriteQueue<S>>,
    retention: Rc<RetentionEnforcer<S>>,
    sync: Rc<SyncCoordinator<S, R>>,
    available: Rc<Cell<bool>>,
}

impl<S: Clone, R> Clone for ViewHistory<S, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: Rc::clone(&self.config),
            queue: Rc::clone(&self.queue),
            retention: Rc::clone(&self.retention),
            sync: Rc::clone(&self.sync),
            available: Rc::clone(&self.available),
        }
    }
}

impl<S, R> ViewHistory<S, R>
where
    S: ViewStore + Clone + 'static,
    R: ViewReporter + 'static,
{
    /// Builds an unopened history. Call [`start`](Self::start) before use.
    pub fn new(store: S, reporter: R, config: HistoryConfig, online: bool) -> Self {
        let queue = WriteQueue::new(store.clone());
        let retention = RetentionEnforcer::new(store.clone(), config.clone());
        let sync = SyncCoordinator::new(store.clone(), reporter, Rc::clone(&queue), online);
        Self {
            store,
            config: Rc::new(config),
            queue,
            retention,
            sync,
            available: Rc::new(Cell::new(false)),
        }
    }

    /// Opens the store (running any schema upgrade and legacy migration).
    ///
    /// Returns `false` if the store is unavailable; the history then acts
    /// as empty for the rest of the session.
    pub async fn open(&self) -> bool {
        match self.store.open().await {
            Ok(()) => {
                self.available.set(true);
                true
            }
            Err(e) => {
                log::warn!("View history unavailable for this session: {}", e);
                self.available.set(false);
                false
            }
        }
    }

    /// Opens the store, then schedules the startup sweep and, when online,
    /// delivers anything left unsynced by earlier sessions.
    pub async fn start(&self) -> bool {
        if !self.open().await {
            return false;
        }
        self.retention.schedule(SweepTrigger::Startup);
        if self.sync.is_online() {
            self.spawn_resync();
        }
        true
    }

    pub fn is_available(&self) -> bool {
        self.available.get()
    }

    /// Records that `id` was just viewed.
    ///
    /// The write is batched; if online, a delivery attempt follows at once,
    /// whether or not the item was delivered before.
    pub fn record_view(&self, id: impl Into<String>, metadata: ViewMetadata) {
        let record = match ViewRecord::viewed_now(id, metadata) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Ignoring view: {}", e);
                return;
            }
        };
        if !self.enqueue(record.clone()) {
            return;
        }

        if self.sync.is_online() {
            let sync = Rc::clone(&self.sync);
            platform::spawn_local(async move {
                sync.deliver(&record).await;
            });
        }
    }

    /// Queues a write for the next batched flush.
    pub fn save_viewed(
        &self,
        id: impl Into<String>,
        timestamp: UnixMillis,
        synced: bool,
        metadata: ViewMetadata,
    ) {
        match ViewRecord::new(id, timestamp, synced, metadata) {
            Ok(record) => {
                self.enqueue(record);
            }
            Err(e) => log::warn!("Ignoring save: {}", e),
        }
    }

    /// Writes in its own transaction and resolves once it is durable.
    pub async fn save_viewed_immediate(
        &self,
        id: impl Into<String>,
        timestamp: UnixMillis,
        synced: bool,
        metadata: ViewMetadata,
    ) {
        if !self.available.get() {
            return;
        }
        let record = match ViewRecord::new(id, timestamp, synced, metadata) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Ignoring save: {}", e);
                return;
            }
        };
        if let Err(e) = self.queue.write_immediate(record).await {
            log::warn!("Immediate history write failed: {}", e);
        }
    }

    /// Every readable record, newest first.
    pub async fn get_all_viewed(&self) -> Vec<ViewRecord> {
        if !self.available.get() {
            return Vec::new();
        }
        match self
            .store
            .iterate_by_timestamp(Direction::Descending, TimestampRange::all(), None)
            .await
        {
            Ok(rows) => decode_rows(&rows),
            Err(e) => {
                log::warn!("Failed to read view history: {}", e);
                Vec::new()
            }
        }
    }

    /// Records still waiting for delivery, newest first.
    pub async fn get_unsynced_viewed(&self) -> Vec<ViewRecord> {
        if !self.available.get() {
            return Vec::new();
        }
        match self.sync.unsynced().await {
            Ok(mut records) => {
                records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                records
            }
            Err(e) => {
                log::warn!("Failed to read unsynced views: {}", e);
                Vec::new()
            }
        }
    }

    /// Marks `id` as delivered. Returns whether a record was found.
    pub async fn mark_as_synced(&self, id: &str) -> bool {
        if !self.available.get() {
            return false;
        }
        match self.sync.mark_as_synced(id).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Failed to mark {} synced: {}", id, e);
                false
            }
        }
    }

    /// Runs a retention sweep now.
    pub async fn enforce_retention(&self) -> Option<SweepOutcome> {
        if !self.available.get() {
            return None;
        }
        match self.retention.run(UnixMillis::now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Retention sweep failed: {}", e);
                None
            }
        }
    }

    /// Requests an idle-priority sweep. See [`RetentionEnforcer::schedule`].
    pub fn schedule_retention(&self, trigger: SweepTrigger) -> bool {
        self.available.get() && self.retention.schedule(trigger)
    }

    /// Commits pending writes without waiting for the flush timer.
    pub async fn flush(&self) -> usize {
        match self.queue.flush().await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Dropped batch of views: {}", e);
                0
            }
        }
    }

    pub fn stats(&self) -> WriteStats {
        self.queue.stats()
    }

    pub fn is_online(&self) -> bool {
        self.sync.is_online()
    }

    /// Feeds a connectivity change. Coming back online drains unsynced
    /// records and schedules a sweep.
    pub fn set_online(&self, online: bool) {
        if !self.sync.set_online(online) {
            return;
        }
        log::info!("Connectivity restored");
        if self.available.get() {
            self.spawn_resync();
            self.retention.schedule(SweepTrigger::ConnectivityRestored);
        }
    }

    /// The page was hidden: commit pending writes and schedule a sweep.
    pub fn on_visibility_hidden(&self) {
        if !self.available.get() {
            return;
        }
        if self.queue.pending_len() > 0 {
            let this = self.clone();
            platform::spawn_local(async move {
                this.flush().await;
            });
        }
        self.retention.schedule(SweepTrigger::VisibilityHidden);
    }

    /// Delivers every unsynced record now.
    pub async fn resync(&self) -> SyncReport {
        if !self.available.get() {
            return SyncReport::default();
        }
        match self.sync.resync().await {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Resync failed: {}", e);
                SyncReport::default()
            }
        }
    }

    fn spawn_resync(&self) {
        let this = self.clone();
        platform::spawn_local(async move {
            this.resync().await;
        });
    }

    /// Returns `false` if the write was dropped.
    fn enqueue(&self, record: ViewRecord) -> bool {
        if !self.available.get() {
            log::debug!("View history unavailable, dropping view of {}", record.id);
            return false;
        }
        if self.queue.enqueue(record) {
            let this = self.clone();
            platform::spawn_local(async move {
                platform::sleep_ms(this.config.flush_delay_ms).await;
                this.flush().await;
            });
        }
        true
    }
}
