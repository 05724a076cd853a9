//! Browser wiring for a [`ViewHistory`].
//!
//! Hooks the history up to `online`/`offline`, `visibilitychange` and a
//! recurring sweep timer. Listeners live for the lifetime of the page.

use crate::config::HistoryConfig;
use crate::history::ViewHistory;
use crate::retention::SweepTrigger;
use crate::storage::{IndexedDbViewStore, StoreConfig, ViewStore};
use crate::sync::{HttpViewReporter, ViewReporter};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::VisibilityState;

/// History backed by IndexedDB that reports views over HTTP.
pub type BrowserViewHistory = ViewHistory<IndexedDbViewStore, HttpViewReporter>;

/// Builds, starts and wires up the default browser history.
///
/// Tunables come from localStorage. Returns the history even when
/// IndexedDB is unavailable; it then behaves as empty.
pub async fn start_browser_history() -> BrowserViewHistory {
    let config = HistoryConfig::load();
    let reporter = HttpViewReporter::from_config(&config);
    let history = ViewHistory::new(
        IndexedDbViewStore::new(StoreConfig::default()),
        reporter,
        config.clone(),
        navigator_online(),
    );

    if history.start().await {
        log::info!("View history ready");
    }
    install_listeners(&history, &config);
    history
}

/// Current `navigator.onLine`, assuming online when unknown.
pub fn navigator_online() -> bool {
    web_sys::window()
        .map(|w| w.navigator().on_line())
        .unwrap_or(true)
}

/// Registers the connectivity, visibility and interval hooks.
pub fn install_listeners<S, R>(history: &ViewHistory<S, R>, config: &HistoryConfig)
where
    S: ViewStore + Clone + 'static,
    R: ViewReporter + 'static,
{
    let Some(window) = web_sys::window() else {
        log::warn!("No window, view history listeners not installed");
        return;
    };

    for (event, online) in [("online", true), ("offline", false)] {
        let h = history.clone();
        let listener = Closure::wrap(Box::new(move |_: web_sys::Event| {
            h.set_online(online);
        }) as Box<dyn FnMut(_)>);
        if let Err(e) =
            window.add_event_listener_with_callback(event, listener.as_ref().unchecked_ref())
        {
            log::warn!("Failed to listen for {}: {:?}", event, e);
        }
        listener.forget();
    }

    if let Some(document) = window.document() {
        let h = history.clone();
        let doc = document.clone();
        let listener = Closure::wrap(Box::new(move |_: web_sys::Event| {
            if doc.visibility_state() == VisibilityState::Hidden {
                h.on_visibility_hidden();
            }
        }) as Box<dyn FnMut(_)>);
        if let Err(e) = document
            .add_event_listener_with_callback("visibilitychange", listener.as_ref().unchecked_ref())
        {
            log::warn!("Failed to listen for visibilitychange: {:?}", e);
        }
        listener.forget();
    }

    let h = history.clone();
    let tick = Closure::wrap(Box::new(move || {
        h.schedule_retention(SweepTrigger::Interval);
    }) as Box<dyn FnMut()>);
    match window.set_interval_with_callback_and_timeout_and_arguments_0(
        tick.as_ref().unchecked_ref(),
        config.sweep_interval_ms.min(i32::MAX as u32) as i32,
    ) {
        Ok(_) => tick.forget(),
        Err(e) => log::warn!("Failed to start retention timer: {:?}", e),
    }
}
