//! Remote synchronization of view events.
//!
//! Each record moves one way, `unsynced -> synced`, and never back. A view
//! is written unsynced; if the device is online a delivery attempt follows
//! straight away, also for items the remote has already seen, so it learns
//! about every repeat view. Failures are logged and left for the next trigger (the
//! next view of that item or connectivity coming back); there is no retry
//! loop and a record is never dropped because delivery failed.
//!
//! Deliveries carry the record id and timestamp, so the remote can treat a
//! repeated delivery as the same event.

use crate::codec;
use crate::queue::WriteQueue;
use crate::record::{UnixMillis, ViewMetadata, ViewRecord};
use crate::storage::{StoreError, ViewStore};
use serde::Serialize;
use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("no sync endpoint configured")]
    NotConfigured,
    #[error("remote rejected view with status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to serialize view: {0}")]
    Serialization(String),
}

/// Body sent to the remote for one view.
#[derive(Debug, Serialize)]
pub struct DeliveryPayload<'a> {
    pub id: &'a str,
    pub timestamp: UnixMillis,
    #[serde(flatten)]
    pub payload: &'a ViewMetadata,
}

impl<'a> From<&'a ViewRecord> for DeliveryPayload<'a> {
    fn from(record: &'a ViewRecord) -> Self {
        Self {
            id: &record.id,
            timestamp: record.timestamp,
            payload: &record.payload,
        }
    }
}

/// Delivers view events to the remote service.
pub trait ViewReporter {
    fn deliver(&self, record: &ViewRecord) -> impl Future<Output = Result<(), SyncError>>;
}

/// Reporter for hosts without a remote. Every delivery fails with
/// `NotConfigured`, so records stay unsynced.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledReporter;

impl ViewReporter for DisabledReporter {
    async fn deliver(&self, _record: &ViewRecord) -> Result<(), SyncError> {
        Err(SyncError::NotConfigured)
    }
}

/// POSTs each view as JSON to an HTTP endpoint.
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Clone)]
pub struct HttpViewReporter {
    endpoint: Option<String>,
}

#[cfg(target_arch = "wasm32")]
impl HttpViewReporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
        }
    }

    /// Uses `sync_endpoint` from the tunables; without one nothing is sent.
    pub fn from_config(config: &crate::config::HistoryConfig) -> Self {
        Self {
            endpoint: config.sync_endpoint.clone(),
        }
    }
}

#[cfg(target_arch = "wasm32")]
impl ViewReporter for HttpViewReporter {
    async fn deliver(&self, record: &ViewRecord) -> Result<(), SyncError> {
        use wasm_bindgen::{JsCast, JsValue};
        use wasm_bindgen_futures::JsFuture;
        use web_sys::{Request, RequestInit, RequestMode, Response};

        let Some(endpoint) = self.endpoint.as_deref() else {
            return Err(SyncError::NotConfigured);
        };
        let net = |e: JsValue| SyncError::Network(format!("{:?}", e));

        let body = serde_json::to_string(&DeliveryPayload::from(record))
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let init = RequestInit::new();
        init.set_method("POST");
        init.set_mode(RequestMode::Cors);
        init.set_body(&JsValue::from_str(&body));

        let request = Request::new_with_str_and_init(endpoint, &init).map_err(net)?;
        request
            .headers()
            .set("Content-Type", "application/json")
            .map_err(net)?;
        let window =
            web_sys::window().ok_or_else(|| SyncError::Network("No window object".to_string()))?;

        let response: Response = JsFuture::from(window.fetch_with_request(&request))
            .await
            .map_err(net)?
            .dyn_into()
            .map_err(net)?;

        if response.ok() {
            Ok(())
        } else {
            Err(SyncError::Status(response.status()))
        }
    }
}

/// Result of draining unsynced records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: u32,
    pub delivered: u32,
    pub failed: u32,
}

/// Tracks connectivity and drives deliveries.
pub struct SyncCoordinator<S, R> {
    store: S,
    reporter: R,
    queue: Rc<WriteQueue<S>>,
    online: Cell<bool>,
    draining: Cell<bool>,
}

impl<S: ViewStore, R: ViewReporter> SyncCoordinator<S, R> {
    pub fn new(store: S, reporter: R, queue: Rc<WriteQueue<S>>, online: bool) -> Rc<Self> {
        Rc::new(Self {
            store,
            reporter,
            queue,
            online: Cell::new(online),
            draining: Cell::new(false),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.get()
    }

    /// Updates connectivity. Returns `true` on an offline to online edge.
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.online.replace(online);
        online && !was
    }

    /// Attempts one delivery if online. Returns whether it was delivered.
    pub async fn deliver(&self, record: &ViewRecord) -> bool {
        if !self.online.get() {
            return false;
        }

        match self.reporter.deliver(record).await {
            Ok(()) => {
                if let Err(e) = self.mark_as_synced(&record.id).await {
                    log::warn!("Delivered {} but could not mark it synced: {}", record.id, e);
                }
                true
            }
            Err(SyncError::NotConfigured) => false,
            Err(e) => {
                log::warn!("Delivery of {} failed, will retry later: {}", record.id, e);
                false
            }
        }
    }

    /// Flags `id` as delivered, both in the queue and on disk.
    ///
    /// The stored row is read and rewritten in one transaction, so a flush
    /// committing around it cannot undo the flag.
    ///
    /// Returns whether a record for `id` was found.
    pub async fn mark_as_synced(&self, id: &str) -> Result<bool, StoreError> {
        let queued = self.queue.mark_pending_synced(id);
        let found = Rc::new(Cell::new(false));

        let seen = found.clone();
        self.store
            .update_rows(vec![id.to_string()], move |id, stored| {
                let mut record = match codec::decode(&stored?) {
                    Ok(r) => r,
                    Err(e) => {
                        log::debug!("Cannot mark unreadable row {} synced: {}", id, e);
                        return None;
                    }
                };
                seen.set(true);
                if record.synced {
                    return None;
                }
                record.synced = true;
                match codec::encode_value(&record) {
                    Ok(row) => Some(row),
                    Err(e) => {
                        log::warn!("Cannot re-encode {} as synced: {}", id, e);
                        None
                    }
                }
            })
            .await?;

        Ok(queued || found.get())
    }

    /// Stored records still waiting for delivery.
    pub async fn unsynced(&self) -> Result<Vec<ViewRecord>, StoreError> {
        let rows = self.store.get_all().await?;
        Ok(decode_rows(&rows)
            .into_iter()
            .filter(|r| !r.synced)
            .collect())
    }

    /// Delivers every unsynced record. Skipped while offline or while a
    /// previous drain is still running.
    pub async fn resync(&self) -> Result<SyncReport, StoreError> {
        if !self.online.get() || self.draining.replace(true) {
            return Ok(SyncReport::default());
        }

        let result = self.drain().await;
        self.draining.set(false);
        result
    }

    async fn drain(&self) -> Result<SyncReport, StoreError> {
        let pending = self.unsynced().await?;
        let mut report = SyncReport::default();
        for record in &pending {
            report.attempted += 1;
            if self.deliver(record).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.attempted > 0 {
            log::info!(
                "Resync: {} delivered, {} still pending",
                report.delivered,
                report.failed
            );
        }
        Ok(report)
    }
}

/// Decodes stored rows, skipping any that are unreadable.
pub(crate) fn decode_rows(rows: &[serde_json::Value]) -> Vec<ViewRecord> {
    rows.iter()
        .filter_map(|row| match codec::decode(row) {
            Ok(r) => Some(r),
            Err(e) => {
                log::debug!("Skipping unreadable history row: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryViewStore;
    use futures_executor::block_on;
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Remote double: records deliveries, fails for ids in `reject`.
    #[derive(Clone, Default)]
    struct FakeRemote {
        delivered: Rc<RefCell<Vec<String>>>,
        reject: Rc<RefCell<HashSet<String>>>,
    }

    impl ViewReporter for FakeRemote {
        async fn deliver(&self, record: &ViewRecord) -> Result<(), SyncError> {
            if self.reject.borrow().contains(&record.id) {
                return Err(SyncError::Status(503));
            }
            self.delivered.borrow_mut().push(record.id.clone());
            Ok(())
        }
    }

    type Coordinator = Rc<SyncCoordinator<MemoryViewStore, FakeRemote>>;

    fn setup(online: bool) -> (MemoryViewStore, FakeRemote, Coordinator) {
        let store = MemoryViewStore::new();
        block_on(store.open()).unwrap();
        let remote = FakeRemote::default();
        let queue = WriteQueue::new(store.clone());
        let sync = SyncCoordinator::new(store.clone(), remote.clone(), queue, online);
        (store, remote, sync)
    }

    fn put(store: &MemoryViewStore, id: &str, ts: i64, synced: bool) {
        let record = ViewRecord::new(id, UnixMillis(ts), synced, ViewMetadata::default()).unwrap();
        block_on(store.put(codec::encode_value(&record).unwrap())).unwrap();
    }

    #[test]
    fn test_offline_then_restored() {
        let (store, remote, sync) = setup(false);
        put(&store, "/a", 1, false);

        let record = block_on(sync.unsynced()).unwrap().remove(0);
        assert!(!block_on(sync.deliver(&record)));
        assert!(remote.delivered.borrow().is_empty());

        assert!(sync.set_online(true));
        let report = block_on(sync.resync()).unwrap();
        assert_eq!(report.delivered, 1);
        assert!(block_on(sync.unsynced()).unwrap().is_empty());
    }

    #[test]
    fn test_failures_stay_pending() {
        let (store, remote, sync) = setup(true);
        put(&store, "/ok", 1, false);
        put(&store, "/flaky", 2, false);
        remote.reject.borrow_mut().insert("/flaky".to_string());

        let report = block_on(sync.resync()).unwrap();
        assert_eq!(
            report,
            SyncReport {
                attempted: 2,
                delivered: 1,
                failed: 1
            }
        );
        let left: Vec<_> = block_on(sync.unsynced())
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(left, vec!["/flaky"]);
        assert_eq!(block_on(store.count()).unwrap(), 2);

        remote.reject.borrow_mut().clear();
        assert_eq!(block_on(sync.resync()).unwrap().delivered, 1);
        assert!(block_on(sync.unsynced()).unwrap().is_empty());
    }

    #[test]
    fn test_repeat_view_of_synced_item_is_delivered_again() {
        let (store, remote, sync) = setup(true);
        put(&store, "/seen", 1, true);
        let fresh = ViewRecord::new("/seen", UnixMillis(2), false, ViewMetadata::default()).unwrap();
        assert!(block_on(sync.deliver(&fresh)));
        assert_eq!(*remote.delivered.borrow(), vec!["/seen".to_string()]);

        remote.reject.borrow_mut().insert("/seen".to_string());
        assert!(!block_on(sync.deliver(&fresh)));
        let record = codec::decode(&block_on(store.get("/seen")).unwrap().unwrap()).unwrap();
        assert!(record.synced);
    }

    #[test]
    fn test_mark_as_synced_covers_queued_and_stored_copies() {
        let store = MemoryViewStore::new();
        block_on(store.open()).unwrap();
        let queue = WriteQueue::new(store.clone());
        let sync = SyncCoordinator::new(store.clone(), FakeRemote::default(), queue.clone(), true);
        put(&store, "/a", 1, false);
        queue.enqueue(ViewRecord::new("/a", UnixMillis(2), false, ViewMetadata::default()).unwrap());

        assert!(block_on(sync.mark_as_synced("/a")).unwrap());
        assert!(queue.pending_for("/a").unwrap().synced);
        block_on(queue.flush()).unwrap();

        let record = codec::decode(&block_on(store.get("/a")).unwrap().unwrap()).unwrap();
        assert!(record.synced);
        assert_eq!(record.timestamp, UnixMillis(2));
    }

    #[test]
    fn test_synced_records_are_not_resent() {
        let (store, remote, sync) = setup(true);
        put(&store, "/done", 1, true);
        let report = block_on(sync.resync()).unwrap();
        assert_eq!(report.attempted, 0);
        assert!(remote.delivered.borrow().is_empty());
    }

    #[test]
    fn test_online_edges() {
        let (_, _, sync) = setup(false);
        assert!(!sync.set_online(false));
        assert!(sync.set_online(true));
        assert!(!sync.set_online(true));
        assert!(!sync.set_online(false));
        assert!(!sync.is_online());
    }

    #[test]
    fn test_mark_as_synced_keeps_timestamp() {
        let (store, _, sync) = setup(true);
        put(&store, "/a", 42, false);
        assert!(block_on(sync.mark_as_synced("/a")).unwrap());
        assert!(!block_on(sync.mark_as_synced("/missing")).unwrap());

        let record = codec::decode(&block_on(store.get("/a")).unwrap().unwrap()).unwrap();
        assert!(record.synced);
        assert_eq!(record.timestamp, UnixMillis(42));
    }

    #[test]
    fn test_disabled_reporter_leaves_records_pending() {
        let store = MemoryViewStore::new();
        block_on(store.open()).unwrap();
        let queue = WriteQueue::new(store.clone());
        let sync = SyncCoordinator::new(store.clone(), DisabledReporter, queue, true);
        put(&store, "/a", 1, false);

        let report = block_on(sync.resync()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(block_on(sync.unsynced()).unwrap().len(), 1);
    }

    #[test]
    fn test_delivery_payload_shape() {
        let record = ViewRecord::new(
            "/a",
            UnixMillis(5),
            false,
            ViewMetadata::named("A").with_cover("c.jpg"),
        )
        .unwrap();
        let json = serde_json::to_value(DeliveryPayload::from(&record)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "id": "/a", "timestamp": 5, "name": "A", "cover": "c.jpg" })
        );
    }
}
