//! Retention enforcement.
//!
//! A sweep runs two passes over the timestamp index, oldest first:
//!
//! 1. **Age**: delete rows older than `now - max_age_ms`.
//! 2. **Count**: if more than `max_records` rows remain, delete the oldest
//!    excess.
//!
//! Each pass deletes at most `sweep_batch_cap` rows, which bounds the cost
//! of a single sweep; anything left over is caught by the next one.
//!
//! Sweeps are scheduled rather than continuous (startup, tab hidden,
//! connectivity restored, a recurring timer) and run at idle priority. One
//! scheduled sweep at a time: requests while one is pending are dropped.

use crate::config::HistoryConfig;
use crate::limits::{resolve_with_overrides, DeviceCapability, RetentionLimits};
use crate::platform;
use crate::record::UnixMillis;
use crate::storage::{StoreError, TimestampRange, ViewStore};
use std::cell::Cell;
use std::rc::Rc;

/// Why a sweep was requested. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTrigger {
    Startup,
    VisibilityHidden,
    ConnectivityRestored,
    Interval,
    Manual,
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Rows removed by the age pass.
    pub expired: u32,
    /// Rows removed by the count pass.
    pub trimmed: u32,
    /// Rows left afterwards.
    pub remaining: u32,
    /// Caps this sweep enforced.
    pub limits: RetentionLimits,
}

pub struct RetentionEnforcer<S> {
    store: S,
    config: HistoryConfig,
    capability: Cell<DeviceCapability>,
    scheduled: Cell<bool>,
    running: Cell<bool>,
}

impl<S: ViewStore + 'static> RetentionEnforcer<S> {
    pub fn new(store: S, config: HistoryConfig) -> Rc<Self> {
        Self::with_capability(store, config, DeviceCapability::detect())
    }

    pub fn with_capability(
        store: S,
        config: HistoryConfig,
        capability: DeviceCapability,
    ) -> Rc<Self> {
        Rc::new(Self {
            store,
            config,
            capability: Cell::new(capability),
            scheduled: Cell::new(false),
            running: Cell::new(false),
        })
    }

    /// Caps the next sweep will use.
    pub fn limits(&self) -> RetentionLimits {
        resolve_with_overrides(self.capability.get(), &self.config)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    /// Requests an idle-priority sweep.
    ///
    /// Returns `false` if one is already pending or running.
    pub fn schedule(self: &Rc<Self>, trigger: SweepTrigger) -> bool {
        if self.scheduled.get() || self.running.get() {
            log::debug!("Retention sweep already pending, ignoring {:?}", trigger);
            return false;
        }
        self.scheduled.set(true);

        let this = Rc::clone(self);
        platform::run_when_idle(
            self.config.idle_timeout_ms,
            self.config.idle_fallback_ms,
            async move {
                this.scheduled.set(false);
                match this.run(UnixMillis::now()).await {
                    Ok(Some(outcome)) => log_outcome(trigger, &outcome),
                    Ok(None) => {}
                    Err(e) => log::warn!("Retention sweep ({:?}) failed: {}", trigger, e),
                }
            },
        );
        true
    }

    /// Runs a sweep now unless one is already running.
    ///
    /// Returns `Ok(None)` when skipped.
    pub async fn run(&self, now: UnixMillis) -> Result<Option<SweepOutcome>, StoreError> {
        if self.running.replace(true) {
            return Ok(None);
        }
        let result = self.sweep(now).await;
        self.running.set(false);
        result.map(Some)
    }

    async fn sweep(&self, now: UnixMillis) -> Result<SweepOutcome, StoreError> {
        let limits = self.limits();
        let cap = self.config.sweep_batch_cap;

        let cutoff = now.0.saturating_sub(limits.max_age_ms);
        let expired = self
            .store
            .delete_by_timestamp(TimestampRange::before(cutoff), cap)
            .await?;

        let count = self.store.count().await?;
        let mut trimmed = 0;
        if count > limits.max_records {
            let excess = count - limits.max_records;
            trimmed = self
                .store
                .delete_by_timestamp(TimestampRange::all(), cap.min(excess))
                .await?;
        }

        Ok(SweepOutcome {
            expired,
            trimmed,
            remaining: count - trimmed,
            limits,
        })
    }
}

fn log_outcome(trigger: SweepTrigger, outcome: &SweepOutcome) {
    if outcome.expired > 0 || outcome.trimmed > 0 {
        log::info!(
            "Retention sweep ({:?}): {} expired, {} trimmed, {} remaining",
            trigger,
            outcome.expired,
            outcome.trimmed,
            outcome.remaining
        );
    } else {
        log::debug!(
            "Retention sweep ({:?}): nothing to do, {} rows",
            trigger,
            outcome.remaining
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::record::{ViewMetadata, ViewRecord};
    use crate::storage::{Direction, MemoryViewStore};
    use futures_executor::block_on;

    const NOW: i64 = 1_700_000_000_000;
    const DAY: i64 = 24 * 60 * 60 * 1000;

    fn store_with(rows: &[(&str, i64)]) -> MemoryViewStore {
        let store = MemoryViewStore::new();
        block_on(store.open()).unwrap();
        for (id, ts) in rows {
            let record = ViewRecord::new(*id, UnixMillis(*ts), false, ViewMetadata::default()).unwrap();
            block_on(store.put(codec::encode_value(&record).unwrap())).unwrap();
        }
        store
    }

    fn ids(store: &MemoryViewStore) -> Vec<String> {
        block_on(store.iterate_by_timestamp(Direction::Ascending, TimestampRange::all(), None))
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_count_cap_keeps_most_recent() {
        let store = store_with(&[("a", NOW - 3), ("b", NOW - 2), ("c", NOW - 1)]);
        let enforcer = RetentionEnforcer::with_capability(
            store.clone(),
            HistoryConfig::new().with_max_records(2),
            DeviceCapability::default(),
        );

        let outcome = block_on(enforcer.run(UnixMillis(NOW))).unwrap().unwrap();
        assert_eq!(outcome.trimmed, 1);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(ids(&store), vec!["b", "c"]);
    }

    #[test]
    fn test_age_pass_removes_expired() {
        let store = store_with(&[("old", NOW - 40 * DAY), ("edge", NOW - 10 * DAY), ("new", NOW)]);
        let enforcer = RetentionEnforcer::with_capability(
            store.clone(),
            HistoryConfig::new().with_max_age_ms(10 * DAY),
            DeviceCapability::default(),
        );

        let outcome = block_on(enforcer.run(UnixMillis(NOW))).unwrap().unwrap();
        assert_eq!(outcome.expired, 1);
        assert_eq!(outcome.trimmed, 0);
        // Exactly at the cutoff is not older than it.
        assert_eq!(ids(&store), vec!["edge", "new"]);
    }

    #[test]
    fn test_sweeps_converge_under_batch_cap() {
        let rows: Vec<(String, i64)> = (0..250)
            .map(|i| (format!("/old/{}", i), NOW - 100 * DAY + i))
            .chain((0..30).map(|i| (format!("/new/{}", i), NOW - i)))
            .collect();
        let borrowed: Vec<(&str, i64)> = rows.iter().map(|(id, ts)| (id.as_str(), *ts)).collect();
        let store = store_with(&borrowed);

        let config = HistoryConfig::new()
            .with_max_age_ms(30 * DAY)
            .with_max_records(20)
            .with_sweep_batch_cap(100);
        let enforcer =
            RetentionEnforcer::with_capability(store.clone(), config, DeviceCapability::default());

        let first = block_on(enforcer.run(UnixMillis(NOW))).unwrap().unwrap();
        assert_eq!(first.expired, 100);
        // Count pass is also capped.
        assert_eq!(first.trimmed, 100);

        for _ in 0..5 {
            block_on(enforcer.run(UnixMillis(NOW))).unwrap();
        }

        let remaining = block_on(store.iterate_by_timestamp(
            Direction::Ascending,
            TimestampRange::all(),
            None,
        ))
        .unwrap();
        assert_eq!(remaining.len(), 20);
        for row in &remaining {
            let ts = codec::timestamp_of(row).unwrap();
            assert!(NOW - ts <= 30 * DAY);
        }
        // The survivors are the 20 newest.
        assert!(remaining
            .iter()
            .all(|r| r["id"].as_str().unwrap().starts_with("/new/")));
    }

    #[test]
    fn test_limits_follow_device_tier() {
        let store = store_with(&[]);
        let low = RetentionEnforcer::with_capability(
            store.clone(),
            HistoryConfig::new(),
            DeviceCapability {
                memory_gb: Some(1.0),
                cores: Some(2),
            },
        );
        assert_eq!(low.limits(), RetentionLimits::LOW);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_schedule_is_guarded() {
        let store = store_with(&[("a", NOW - 2), ("b", NOW - 1), ("c", NOW)]);
        let enforcer = RetentionEnforcer::with_capability(
            store.clone(),
            HistoryConfig::new()
                .with_max_records(1)
                .with_max_age_ms(100 * 365 * DAY),
            DeviceCapability::default(),
        );

        assert!(enforcer.schedule(SweepTrigger::Startup));
        assert!(!enforcer.schedule(SweepTrigger::VisibilityHidden));
        assert!(enforcer.is_scheduled());

        platform::run_until_stalled();
        assert!(!enforcer.is_scheduled());
        assert_eq!(block_on(store.count()).unwrap(), 1);

        assert!(enforcer.schedule(SweepTrigger::Interval));
        platform::run_until_stalled();
    }

    #[test]
    fn test_failing_store_reports_error() {
        let store = store_with(&[("a", 1)]);
        store.fail_writes(true);
        let enforcer = RetentionEnforcer::with_capability(
            store,
            HistoryConfig::new(),
            DeviceCapability::default(),
        );
        assert!(block_on(enforcer.run(UnixMillis(NOW))).is_err());
        // The guard is released after a failure.
        assert!(block_on(enforcer.run(UnixMillis(NOW))).is_err());
    }
}
