//! Retention caps derived from device capability.
//!
//! Lower-end devices keep a shorter, smaller history. The resolver is pure;
//! reading the hint from the browser happens in [`DeviceCapability::detect`].

use crate::config::HistoryConfig;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// What the host reports about the device. Missing fields mean unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceCapability {
    /// Approximate RAM in GiB (`navigator.deviceMemory`).
    pub memory_gb: Option<f64>,
    /// Logical cores (`navigator.hardwareConcurrency`).
    pub cores: Option<u32>,
}

/// Caps enforced by one retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLimits {
    pub max_records: u32,
    pub max_age_ms: i64,
}

impl RetentionLimits {
    pub const LOW: Self = Self {
        max_records: 250,
        max_age_ms: 14 * DAY_MS,
    };
    pub const MID: Self = Self {
        max_records: 500,
        max_age_ms: 30 * DAY_MS,
    };
    pub const HIGH: Self = Self {
        max_records: 1000,
        max_age_ms: 60 * DAY_MS,
    };
}

/// Picks caps for a device.
///
/// Either a small memory figure or a low core count is enough to drop a
/// tier. With no hint at all, the middle tier is used.
pub fn resolve_limits(hint: DeviceCapability) -> RetentionLimits {
    if hint.memory_gb.is_none() && hint.cores.is_none() {
        return RetentionLimits::MID;
    }

    let memory = hint.memory_gb.unwrap_or(f64::MAX);
    let cores = hint.cores.unwrap_or(u32::MAX);

    if memory <= 2.0 || cores <= 2 {
        RetentionLimits::LOW
    } else if memory <= 4.0 || cores <= 4 {
        RetentionLimits::MID
    } else {
        RetentionLimits::HIGH
    }
}

/// Applies caps pinned in the tunables on top of the device tier.
pub fn resolve_with_overrides(hint: DeviceCapability, config: &HistoryConfig) -> RetentionLimits {
    let mut limits = resolve_limits(hint);
    if let Some(max) = config.max_records {
        limits.max_records = max;
    }
    if let Some(age) = config.max_age_ms {
        limits.max_age_ms = age;
    }
    limits
}

impl DeviceCapability {
    /// Reads the hint from `navigator`.
    #[cfg(target_arch = "wasm32")]
    pub fn detect() -> Self {
        let Some(navigator) = web_sys::window().map(|w| w.navigator()) else {
            return Self::default();
        };

        // deviceMemory is Chromium-only and not in web-sys.
        let memory_gb = js_sys::Reflect::get(&navigator, &"deviceMemory".into())
            .ok()
            .and_then(|v| v.as_f64())
            .filter(|m| *m > 0.0);
        let cores = Some(navigator.hardware_concurrency() as u32).filter(|c| *c > 0);

        Self { memory_gb, cores }
    }

    /// Native builds report nothing, which resolves to the middle tier.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn detect() -> Self {
        Self::default()
    }
}
