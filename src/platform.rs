//! Clock, task and timer primitives.
//!
//! On WASM everything runs on the browser event loop: tasks go through
//! `wasm_bindgen_futures::spawn_local`, delays through `setTimeout`, and idle
//! work through `requestIdleCallback` when the browser has it.
//!
//! Native builds have no event loop of their own, so tasks are queued on a
//! thread-local `LocalPool` that the host (or a test) drives with
//! [`run_until_stalled`]. Delays resolve on the next pool turn.

use std::future::Future;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    #[cfg(target_arch = "wasm32")]
    {
        js_sys::Date::now() as i64
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Spawns a fire-and-forget task on the current thread.
pub fn spawn_local<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    #[cfg(target_arch = "wasm32")]
    {
        wasm_bindgen_futures::spawn_local(future);
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        native::spawn(future);
    }
}

/// Runs queued native tasks until none can make progress.
#[cfg(not(target_arch = "wasm32"))]
pub fn run_until_stalled() {
    native::run_until_stalled();
}

/// Sleeps for `ms` milliseconds.
#[cfg(target_arch = "wasm32")]
pub async fn sleep_ms(ms: u32) {
    use wasm_bindgen::prelude::*;

    #[wasm_bindgen]
    extern "C" {
        #[wasm_bindgen(js_name = setTimeout)]
        fn set_timeout(closure: &Closure<dyn FnMut()>, millis: u32) -> i32;
    }

    let (tx, rx) = futures_channel::oneshot::channel::<()>();
    let closure = Closure::once(move || {
        let _ = tx.send(());
    });
    set_timeout(&closure, ms);
    let _ = rx.await;
}

/// Native stand-in: yields once so the delay ends on the next pool turn.
#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep_ms(_ms: u32) {
    native::YieldNow::default().await;
}

/// Runs `task` when the host is idle, or after `timeout_ms` at the latest.
///
/// Falls back to a plain `fallback_ms` delay where no idle primitive exists.
pub fn run_when_idle<F>(timeout_ms: u32, fallback_ms: u32, task: F)
where
    F: Future<Output = ()> + 'static,
{
    #[cfg(target_arch = "wasm32")]
    {
        idle::schedule(timeout_ms, fallback_ms, task);
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        let _ = timeout_ms;
        spawn_local(async move {
            sleep_ms(fallback_ms).await;
            task.await;
        });
    }
}

#[cfg(target_arch = "wasm32")]
mod idle {
    use std::future::Future;
    use wasm_bindgen::prelude::*;

    #[wasm_bindgen]
    extern "C" {
        #[wasm_bindgen(js_name = requestIdleCallback, catch)]
        fn request_idle_callback(
            closure: &Closure<dyn FnMut()>,
            options: &JsValue,
        ) -> Result<u32, JsValue>;
    }

    pub(super) fn schedule<F>(timeout_ms: u32, fallback_ms: u32, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let (tx, rx) = futures_channel::oneshot::channel::<()>();
        let closure = Closure::once(move || {
            let _ = tx.send(());
        });

        let options = js_sys::Object::new();
        let _ = js_sys::Reflect::set(
            &options,
            &JsValue::from_str("timeout"),
            &JsValue::from_f64(timeout_ms as f64),
        );

        match request_idle_callback(&closure, &options) {
            Ok(_) => {
                wasm_bindgen_futures::spawn_local(async move {
                    let _keep_alive = closure;
                    let _ = rx.await;
                    task.await;
                });
            }
            Err(_) => {
                log::debug!("requestIdleCallback unavailable, deferring {}ms", fallback_ms);
                wasm_bindgen_futures::spawn_local(async move {
                    super::sleep_ms(fallback_ms).await;
                    task.await;
                });
            }
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use futures_executor::{LocalPool, LocalSpawner};
    use futures_util::task::LocalSpawnExt;
    use std::cell::RefCell;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct Executor {
        pool: RefCell<LocalPool>,
        spawner: LocalSpawner,
    }

    impl Executor {
        fn new() -> Self {
            let pool = LocalPool::new();
            let spawner = pool.spawner();
            Self {
                pool: RefCell::new(pool),
                spawner,
            }
        }
    }

    thread_local! {
        static EXECUTOR: Executor = Executor::new();
    }

    pub(super) fn spawn<F>(future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        EXECUTOR.with(|executor| {
            if let Err(e) = executor.spawner.spawn_local(future) {
                log::warn!("Failed to spawn local task: {}", e);
            }
        });
    }

    pub(super) fn run_until_stalled() {
        EXECUTOR.with(|executor| match executor.pool.try_borrow_mut() {
            Ok(mut pool) => pool.run_until_stalled(),
            Err(_) => log::debug!("Local pool already running"),
        });
    }

    /// Returns `Pending` once, waking itself so the pool polls it again.
    #[derive(Default)]
    pub(super) struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                return Poll::Ready(());
            }
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
