//! IndexedDB-backed `ViewStore` for WASM targets.
//!
//! Wraps the low-level web-sys bindings in the async `ViewStore` interface.
//!
//! ## Upgrade
//!
//! The `onupgradeneeded` handler runs inside the version-change transaction:
//! 1. create the `viewed` store (keyPath `id`) if missing
//! 2. create the `by_timestamp` index if missing
//! 3. write the re-encoded legacy rows into the new store
//!
//! Each step checks for existing structures, so re-running an upgrade is
//! harmless. The legacy localStorage blob is removed only after the open
//! request succeeds, i.e. after the version-change transaction committed.
//!
//! ## Cursors
//!
//! Cursor walks are driven entirely from the request's `onsuccess` handler
//! so that `continue()`/`delete()` are always issued while the transaction
//! is active.

use super::{legacy, Direction, StoreConfig, StoreError, TimestampRange, ViewStore};
use js_sys::Array;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{
    IdbCursorDirection, IdbCursorWithValue, IdbDatabase, IdbKeyRange, IdbObjectStore, IdbRequest,
    IdbTransaction, IdbTransactionMode,
};

/// IndexedDB view store.
///
/// Cloning shares the underlying database handle.
#[derive(Clone)]
pub struct IndexedDbViewStore {
    config: StoreConfig,
    db: Rc<RefCell<Option<IdbDatabase>>>,
}

impl Default for IndexedDbViewStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl IndexedDbViewStore {
    /// Creates a store; the database is opened by `open()`.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            db: Rc::new(RefCell::new(None)),
        }
    }

    fn get_db(&self) -> Result<IdbDatabase, StoreError> {
        self.db
            .borrow()
            .clone()
            .ok_or_else(|| StoreError::Unavailable("Database not open".to_string()))
    }

    fn transaction(&self, mode: IdbTransactionMode) -> Result<IdbTransaction, StoreError> {
        self.get_db()?
            .transaction_with_str_and_mode(&self.config.store_name, mode)
            .map_err(|e| js_err("Failed to create transaction", e))
    }

    fn object_store(&self, tx: &IdbTransaction) -> Result<IdbObjectStore, StoreError> {
        tx.object_store(&self.config.store_name)
            .map_err(|e| js_err("Failed to get store", e))
    }

    /// Opens a cursor over the timestamp index.
    fn open_index_cursor(
        &self,
        store: &IdbObjectStore,
        direction: Direction,
        range: TimestampRange,
    ) -> Result<IdbRequest, StoreError> {
        let index = store
            .index(&self.config.index_name)
            .map_err(|e| js_err("Failed to get index", e))?;
        let key_range = key_range(range)?;
        let direction = match direction {
            Direction::Ascending => IdbCursorDirection::Next,
            Direction::Descending => IdbCursorDirection::Prev,
        };
        index
            .open_cursor_with_range_and_direction(&key_range, direction)
            .map_err(|e| js_err("Failed to open cursor", e))
    }
}

impl ViewStore for IndexedDbViewStore {
    async fn open(&self) -> Result<(), StoreError> {
        if self.db.borrow().is_some() {
            return Ok(());
        }

        let (db, upgraded) = open_database(&self.config).await?;
        *self.db.borrow_mut() = Some(db);

        if upgraded {
            legacy::clear_legacy_blob(&self.config.legacy_key);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let tx = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&tx)?;

        let request = store
            .get(&JsValue::from_str(id))
            .map_err(|e| js_err("Failed to get row", e))?;

        let result = wait_for_request(&request).await?;
        Ok(js_to_row(&result))
    }

    async fn put(&self, row: Value) -> Result<(), StoreError> {
        self.put_batch(vec![row]).await
    }

    async fn put_batch(&self, rows: Vec<Value>) -> Result<(), StoreError> {
        // Convert up front so a bad row cannot leave a partial batch behind.
        let values = rows.iter().map(row_to_js).collect::<Result<Vec<_>, _>>()?;

        let tx = self.transaction(IdbTransactionMode::Readwrite)?;
        let store = self.object_store(&tx)?;

        for js in &values {
            if let Err(e) = store.put(js) {
                let _ = tx.abort();
                return Err(js_err("Failed to put row", e));
            }
        }

        wait_for_transaction(&tx).await
    }

    async fn update_rows<F>(&self, ids: Vec<String>, update: F) -> Result<u32, StoreError>
    where
        F: FnMut(&str, Option<Value>) -> Option<Value> + 'static,
    {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.transaction(IdbTransactionMode::Readwrite)?;
        let store = self.object_store(&tx)?;
        let update = Rc::new(RefCell::new(update));
        let written = Rc::new(Cell::new(0u32));
        let failure: Rc<RefCell<Option<StoreError>>> = Rc::new(RefCell::new(None));

        // Each put is issued from its get's onsuccess, while the transaction
        // is still active.
        let mut handlers = Vec::with_capacity(ids.len());
        for id in ids {
            let request = match store.get(&JsValue::from_str(&id)) {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.abort();
                    return Err(js_err("Failed to read row", e));
                }
            };

            let store = store.clone();
            let abort_tx = tx.clone();
            let update = update.clone();
            let written = written.clone();
            let failure = failure.clone();
            let onsuccess = Closure::wrap(Box::new(move |event: web_sys::Event| {
                let stored = event
                    .target()
                    .and_then(|t| t.dyn_into::<IdbRequest>().ok())
                    .and_then(|r| r.result().ok())
                    .and_then(|v| js_to_row(&v));

                let Some(row) = (&mut *update.borrow_mut())(id.as_str(), stored) else {
                    return;
                };
                let put = row_to_js(&row).and_then(|js| {
                    store
                        .put(&js)
                        .map(|_| ())
                        .map_err(|e| js_err("Failed to put row", e))
                });
                match put {
                    Ok(()) => written.set(written.get() + 1),
                    Err(e) => {
                        failure.borrow_mut().get_or_insert(e);
                        let _ = abort_tx.abort();
                    }
                }
            }) as Box<dyn FnMut(_)>);

            request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
            handlers.push(onsuccess);
        }

        let result = wait_for_transaction(&tx).await;
        drop(handlers);

        if let Some(e) = failure.borrow_mut().take() {
            return Err(e);
        }
        result.map(|()| written.get())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let tx = self.transaction(IdbTransactionMode::Readwrite)?;
        let store = self.object_store(&tx)?;

        store
            .delete(&JsValue::from_str(id))
            .map_err(|e| js_err("Failed to delete row", e))?;

        wait_for_transaction(&tx).await
    }

    async fn count(&self) -> Result<u32, StoreError> {
        let tx = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&tx)?;

        let request = store.count().map_err(|e| js_err("Failed to count", e))?;
        let result = wait_for_request(&request).await?;
        Ok(result.as_f64().unwrap_or(0.0) as u32)
    }

    async fn iterate_by_timestamp(
        &self,
        direction: Direction,
        range: TimestampRange,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, StoreError> {
        let tx = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&tx)?;
        let request = self.open_index_cursor(&store, direction, range)?;

        let rows = Rc::new(RefCell::new(Vec::new()));
        let sink = rows.clone();
        walk_cursor(&request, limit, move |cursor| {
            let value = cursor.value().map_err(|e| js_err("Failed to read cursor", e))?;
            if let Some(row) = js_to_row(&value) {
                sink.borrow_mut().push(row);
            }
            Ok(())
        })
        .await?;

        let rows: Vec<Value> = rows.borrow_mut().drain(..).collect();
        Ok(rows)
    }

    async fn delete_by_timestamp(&self, range: TimestampRange, limit: u32) -> Result<u32, StoreError> {
        if limit == 0 {
            return Ok(0);
        }

        let tx = self.transaction(IdbTransactionMode::Readwrite)?;
        let store = self.object_store(&tx)?;
        let request = self.open_index_cursor(&store, Direction::Ascending, range)?;

        let deleted = walk_cursor(&request, Some(limit), |cursor| {
            cursor
                .delete()
                .map(|_| ())
                .map_err(|e| js_err("Failed to delete at cursor", e))
        })
        .await?;

        wait_for_transaction(&tx).await?;
        Ok(deleted)
    }

    async fn get_all(&self) -> Result<Vec<Value>, StoreError> {
        let tx = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&tx)?;

        let request = store
            .get_all()
            .map_err(|e| js_err("Failed to get all", e))?;
        let result = wait_for_request(&request).await?;

        let array = Array::from(&result);
        let mut rows = Vec::with_capacity(array.length() as usize);
        for i in 0..array.length() {
            if let Some(row) = js_to_row(&array.get(i)) {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn js_err(context: &str, e: JsValue) -> StoreError {
    StoreError::Transaction(format!("{}: {:?}", context, e))
}

fn key_range(range: TimestampRange) -> Result<JsValue, StoreError> {
    let bound = |v: i64| JsValue::from_f64(v as f64);
    let range = match (range.lower, range.upper) {
        (None, None) => return Ok(JsValue::NULL),
        (Some(l), None) => IdbKeyRange::lower_bound(&bound(l)),
        (None, Some(u)) => IdbKeyRange::upper_bound_with_open(&bound(u), true),
        (Some(l), Some(u)) => {
            IdbKeyRange::bound_with_lower_open_and_upper_open(&bound(l), &bound(u), false, true)
        }
    };
    range
        .map(JsValue::from)
        .map_err(|e| js_err("Invalid key range", e))
}

fn row_to_js(row: &Value) -> Result<JsValue, StoreError> {
    let json =
        serde_json::to_string(row).map_err(|e| StoreError::Serialization(e.to_string()))?;
    js_sys::JSON::parse(&json).map_err(|e| StoreError::Serialization(format!("{:?}", e)))
}

/// Converts a stored JS value to a row via JSON. `None` for absent values.
fn js_to_row(value: &JsValue) -> Option<Value> {
    if value.is_undefined() || value.is_null() {
        return None;
    }
    let json_str = js_sys::JSON::stringify(value).ok()?;
    let s = json_str.as_string()?;
    serde_json::from_str(&s).ok()
}

/// Opens the database, upgrading the schema as needed.
///
/// Returns the handle and whether an upgrade consumed a legacy blob.
async fn open_database(config: &StoreConfig) -> Result<(IdbDatabase, bool), StoreError> {
    let window = web_sys::window()
        .ok_or_else(|| StoreError::Unavailable("No window object".to_string()))?;

    let idb_factory = window
        .indexed_db()
        .map_err(|e| StoreError::Unavailable(format!("{:?}", e)))?
        .ok_or_else(|| StoreError::Unavailable("IndexedDB not available".to_string()))?;

    let open_request = idb_factory
        .open_with_u32(&config.database_name, config.version)
        .map_err(|e| StoreError::Unavailable(format!("{:?}", e)))?;

    // localStorage is synchronous, so the blob can be staged before the
    // upgrade handler runs and written inside the version-change transaction.
    let legacy_blob = legacy::read_legacy_blob(&config.legacy_key);
    let has_legacy = legacy_blob.is_some();
    let legacy_rows = legacy_blob
        .map(|blob| legacy::parse_legacy_blob(&blob))
        .unwrap_or_default();
    let upgraded = Rc::new(Cell::new(false));

    let upgrade_config = config.clone();
    let upgrade_done = upgraded.clone();
    let onupgradeneeded = Closure::once(move |event: web_sys::IdbVersionChangeEvent| {
        match upgrade_schema(&event, &upgrade_config, legacy_rows) {
            Ok(()) => upgrade_done.set(true),
            Err(e) => {
                log::error!("IndexedDB upgrade failed: {:?}", e);
                // Aborting fails the open request, so the session runs without history.
                if let Some(tx) = event
                    .target()
                    .and_then(|t| t.dyn_into::<IdbRequest>().ok())
                    .and_then(|r| r.transaction())
                {
                    let _ = tx.abort();
                }
            }
        }
    });

    open_request.set_onupgradeneeded(Some(onupgradeneeded.as_ref().unchecked_ref()));

    let db_result = wait_for_request(&open_request).await;
    open_request.set_onupgradeneeded(None);
    drop(onupgradeneeded);

    let db: IdbDatabase = db_result
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .dyn_into()
        .map_err(|_| StoreError::Unavailable("Failed to cast to IdbDatabase".to_string()))?;

    log::info!(
        "Opened IndexedDB database: {} v{}",
        config.database_name,
        config.version
    );

    Ok((db, has_legacy && upgraded.get()))
}

fn upgrade_schema(
    event: &web_sys::IdbVersionChangeEvent,
    config: &StoreConfig,
    legacy_rows: Vec<Value>,
) -> Result<(), JsValue> {
    let request: IdbRequest = event
        .target()
        .ok_or_else(|| JsValue::from_str("upgrade event has no target"))?
        .dyn_into()?;
    let db: IdbDatabase = request.result()?.dyn_into()?;

    log::info!(
        "Upgrading IndexedDB {} from v{} to v{}",
        config.database_name,
        event.old_version(),
        config.version
    );

    let store = if db.object_store_names().contains(&config.store_name) {
        request
            .transaction()
            .ok_or_else(|| JsValue::from_str("no version-change transaction"))?
            .object_store(&config.store_name)?
    } else {
        let params = web_sys::IdbObjectStoreParameters::new();
        params.set_key_path(&JsValue::from_str("id"));
        let store = db.create_object_store_with_optional_parameters(&config.store_name, &params)?;
        log::info!("Created IndexedDB object store: {}", config.store_name);
        store
    };

    if !store.index_names().contains(&config.index_name) {
        store.create_index_with_str(&config.index_name, "timestamp")?;
        log::info!("Created IndexedDB index: {}", config.index_name);
    }

    if legacy_rows.is_empty() {
        return Ok(());
    }

    let mut written = 0u32;
    for row in &legacy_rows {
        let js = match row_to_js(row) {
            Ok(js) => js,
            Err(e) => {
                log::debug!("Skipping legacy row: {}", e);
                continue;
            }
        };
        store.put(&js)?;
        written += 1;
    }
    log::info!("Migrated {} legacy history entries", written);
    Ok(())
}

/// Drives a cursor request to completion, calling `visit` on each position.
///
/// Stops after `limit` visits when given. Returns the number of visits.
async fn walk_cursor<F>(
    request: &IdbRequest,
    limit: Option<u32>,
    mut visit: F,
) -> Result<u32, StoreError>
where
    F: FnMut(&IdbCursorWithValue) -> Result<(), StoreError> + 'static,
{
    let (tx, rx) = futures_channel::oneshot::channel::<Result<u32, StoreError>>();
    let tx = Rc::new(RefCell::new(Some(tx)));
    let visited = Rc::new(Cell::new(0u32));

    let tx_success = tx.clone();
    let onsuccess = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let finish = |result: Result<u32, StoreError>| {
            if let Some(tx) = tx_success.borrow_mut().take() {
                let _ = tx.send(result);
            }
        };

        let cursor = event
            .target()
            .and_then(|t| t.dyn_into::<IdbRequest>().ok())
            .and_then(|r| r.result().ok())
            .and_then(|v| v.dyn_into::<IdbCursorWithValue>().ok());

        let Some(cursor) = cursor else {
            finish(Ok(visited.get()));
            return;
        };

        if let Err(e) = visit(&cursor) {
            finish(Err(e));
            return;
        }
        visited.set(visited.get() + 1);

        if limit.is_some_and(|l| visited.get() >= l) {
            finish(Ok(visited.get()));
            return;
        }
        if let Err(e) = cursor.continue_() {
            finish(Err(js_err("Failed to advance cursor", e)));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_error = tx;
    let onerror = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let error_msg = request_error_message(&event);
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err(StoreError::Transaction(error_msg)));
        }
    }) as Box<dyn FnMut(_)>);

    request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
    request.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    let result = rx
        .await
        .map_err(|_| StoreError::Transaction("Channel closed".to_string()))?;

    request.set_onsuccess(None);
    request.set_onerror(None);

    drop(onsuccess);
    drop(onerror);

    result
}

fn request_error_message(event: &web_sys::Event) -> String {
    event
        .target()
        .and_then(|t| t.dyn_into::<IdbRequest>().ok())
        .and_then(|r| r.error().ok().flatten())
        .map(|e| e.message())
        .unwrap_or_else(|| "Unknown error".to_string())
}

/// Waits for an IDB request to complete and returns the result.
async fn wait_for_request(request: &IdbRequest) -> Result<JsValue, StoreError> {
    let (tx, rx) = futures_channel::oneshot::channel::<Result<JsValue, StoreError>>();
    let tx = Rc::new(RefCell::new(Some(tx)));

    let tx_success = tx.clone();
    let onsuccess = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let result = event
            .target()
            .and_then(|t| t.dyn_into::<IdbRequest>().ok())
            .and_then(|r| r.result().ok())
            .unwrap_or(JsValue::UNDEFINED);

        if let Some(tx) = tx_success.borrow_mut().take() {
            let _ = tx.send(Ok(result));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_error = tx;
    let onerror = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let error_msg = request_error_message(&event);
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err(StoreError::Transaction(error_msg)));
        }
    }) as Box<dyn FnMut(_)>);

    request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
    request.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    // Keep closures alive until the request completes
    let result = rx
        .await
        .map_err(|_| StoreError::Transaction("Channel closed".to_string()))?;

    request.set_onsuccess(None);
    request.set_onerror(None);

    drop(onsuccess);
    drop(onerror);

    result
}

/// Waits for an IDB transaction to commit.
///
/// Quota exhaustion surfaces as `abort`, so both `error` and `abort` fail.
async fn wait_for_transaction(tx: &IdbTransaction) -> Result<(), StoreError> {
    let (sender, rx) = futures_channel::oneshot::channel::<Result<(), StoreError>>();
    let sender = Rc::new(RefCell::new(Some(sender)));

    let tx_complete = sender.clone();
    let oncomplete = Closure::wrap(Box::new(move |_: web_sys::Event| {
        if let Some(tx) = tx_complete.borrow_mut().take() {
            let _ = tx.send(Ok(()));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_failed = sender;
    let onfailed = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let error_msg = format!("Transaction {}", event.type_());
        if let Some(tx) = tx_failed.borrow_mut().take() {
            let _ = tx.send(Err(StoreError::Transaction(error_msg)));
        }
    }) as Box<dyn FnMut(_)>);

    tx.set_oncomplete(Some(oncomplete.as_ref().unchecked_ref()));
    tx.set_onerror(Some(onfailed.as_ref().unchecked_ref()));
    tx.set_onabort(Some(onfailed.as_ref().unchecked_ref()));

    let result = rx
        .await
        .map_err(|_| StoreError::Transaction("Channel closed".to_string()))?;

    tx.set_oncomplete(None);
    tx.set_onerror(None);
    tx.set_onabort(None);

    drop(oncomplete);
    drop(onfailed);

    result
}
