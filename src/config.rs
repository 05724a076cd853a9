//! Tunables for the view history.
//!
//! Every field has a built-in default. A host can override any subset by
//! passing a JSON object, or by storing one in localStorage under
//! `view_history_tunables` so it survives reloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid tunables JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Write batching, retention scheduling and sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Delay between the first queued view and the batched commit.
    pub flush_delay_ms: u32,
    /// Upper bound on how long an idle-scheduled sweep may wait.
    pub idle_timeout_ms: u32,
    /// Delay used instead of idle scheduling when the host has none.
    pub idle_fallback_ms: u32,
    /// Period of the recurring retention sweep.
    pub sweep_interval_ms: u32,
    /// Most rows a single age or count pass may delete.
    pub sweep_batch_cap: u32,
    /// Pins the record cap instead of deriving it from the device.
    pub max_records: Option<u32>,
    /// Pins the age cap instead of deriving it from the device.
    pub max_age_ms: Option<i64>,
    /// Remote endpoint receiving view events. No endpoint, no delivery.
    pub sync_endpoint: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: 25,
            idle_timeout_ms: 2_000,
            idle_fallback_ms: 50,
            sweep_interval_ms: 5 * 60 * 1000,
            sweep_batch_cap: 100,
            max_records: None,
            max_age_ms: None,
            sync_endpoint: None,
        }
    }
}

impl HistoryConfig {
    /// localStorage key for persisted tunables.
    const STORAGE_KEY: &'static str = "view_history_tunables";

    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a (possibly partial) tunables object.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Load tunables from localStorage, falling back to defaults.
    #[cfg(target_arch = "wasm32")]
    pub fn load() -> Self {
        let window = match web_sys::window() {
            Some(w) => w,
            None => return Self::default(),
        };

        let storage = match window.local_storage() {
            Ok(Some(s)) => s,
            _ => return Self::default(),
        };

        let json = match storage.get_item(Self::STORAGE_KEY) {
            Ok(Some(s)) => s,
            _ => return Self::default(),
        };

        match Self::from_json(&json) {
            Ok(config) => {
                log::info!("Loaded view history tunables from localStorage");
                config
            }
            Err(e) => {
                log::warn!("Failed to parse view history tunables: {}", e);
                Self::default()
            }
        }
    }

    /// Native builds have no localStorage.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load() -> Self {
        log::debug!("No {} on native, using defaults", Self::STORAGE_KEY);
        Self::default()
    }

    pub fn with_flush_delay_ms(mut self, ms: u32) -> Self {
        self.flush_delay_ms = ms;
        self
    }

    pub fn with_max_records(mut self, max: u32) -> Self {
        self.max_records = Some(max);
        self
    }

    /// Non-positive ages are ignored, like in `from_json`.
    pub fn with_max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self.sanitized()
    }

    /// A cap of 0 is ignored, like in `from_json`.
    pub fn with_sweep_batch_cap(mut self, cap: u32) -> Self {
        self.sweep_batch_cap = cap;
        self.sanitized()
    }

    pub fn with_sync_endpoint(mut self, url: impl Into<String>) -> Self {
        self.sync_endpoint = Some(url.into());
        self
    }

    /// Replaces values that would stall sweeps or never expire anything.
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.sweep_batch_cap == 0 {
            log::warn!("sweep_batch_cap of 0 ignored");
            self.sweep_batch_cap = defaults.sweep_batch_cap;
        }
        if self.sweep_interval_ms == 0 {
            log::warn!("sweep_interval_ms of 0 ignored");
            self.sweep_interval_ms = defaults.sweep_interval_ms;
        }
        if self.max_age_ms.is_some_and(|age| age <= 0) {
            log::warn!("non-positive max_age_ms ignored");
            self.max_age_ms = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_override_keeps_defaults() {
        let config = HistoryConfig::from_json(r#"{"flush_delay_ms": 100}"#).unwrap();
        assert_eq!(config.flush_delay_ms, 100);
        assert_eq!(config.idle_timeout_ms, 2_000);
        assert_eq!(config.sweep_interval_ms, 300_000);
        assert_eq!(config.max_records, None);
    }

    #[test]
    fn test_degenerate_values_are_replaced() {
        let config = HistoryConfig::from_json(
            r#"{"sweep_batch_cap": 0, "sweep_interval_ms": 0, "max_age_ms": -1}"#,
        )
        .unwrap();
        assert_eq!(config.sweep_batch_cap, 100);
        assert_eq!(config.sweep_interval_ms, 300_000);
        assert_eq!(config.max_age_ms, None);
    }

    #[test]
    fn test_builders_replace_degenerate_values() {
        let config = HistoryConfig::new()
            .with_sweep_batch_cap(0)
            .with_max_age_ms(-5);
        assert_eq!(config.sweep_batch_cap, 100);
        assert_eq!(config.max_age_ms, None);

        let config = HistoryConfig::new()
            .with_sweep_batch_cap(7)
            .with_max_age_ms(60_000);
        assert_eq!(config.sweep_batch_cap, 7);
        assert_eq!(config.max_age_ms, Some(60_000));
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(HistoryConfig::from_json("{flush").is_err());
        assert!(HistoryConfig::from_json(r#"{"flush_delay_ms": "soon"}"#).is_err());
    }
}
