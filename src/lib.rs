#![warn(clippy::all)]

//! View History - an offline-first record of which items a user has viewed.
//!
//! Views are written to an on-device store in short batches, pruned by age
//! and count on an idle schedule, and reported to a remote service whenever
//! the device is online. Rows at rest are lightly obfuscated.
//!
//! On WASM the store is IndexedDB and the remote is reached with `fetch`;
//! [`browser::start_browser_history`] sets up both. Native builds use the
//! in-memory store and a thread-local task pool driven by
//! [`platform::run_until_stalled`].

pub mod codec;
pub mod config;
pub mod history;
pub mod limits;
pub mod platform;
pub mod queue;
pub mod record;
pub mod retention;
pub mod storage;
pub mod sync;

#[cfg(target_arch = "wasm32")]
pub mod browser;

pub use config::HistoryConfig;
pub use history::ViewHistory;
pub use limits::{resolve_limits, DeviceCapability, RetentionLimits};
pub use queue::WriteStats;
pub use record::{UnixMillis, ViewMetadata, ViewRecord};
pub use retention::{SweepOutcome, SweepTrigger};
pub use storage::{MemoryViewStore, StoreConfig, StoreError, ViewStore};
pub use sync::{DisabledReporter, SyncError, SyncReport, ViewReporter};

#[cfg(target_arch = "wasm32")]
pub use storage::IndexedDbViewStore;
#[cfg(target_arch = "wasm32")]
pub use sync::HttpViewReporter;
