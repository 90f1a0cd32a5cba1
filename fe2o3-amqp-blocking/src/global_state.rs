//! Process-wide lifecycle of the engine execution context

use std::{fmt, io, sync::OnceLock};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// Number of worker threads servicing engine I/O and callbacks
pub const ENGINE_WORKER_THREADS: usize = 2;

static GLOBAL_STATE: OnceLock<GlobalState> = OnceLock::new();

#[derive(Debug, Default)]
struct Inner {
    ref_count: usize,
    runtime: Option<Runtime>,
}

/// Reference counted owner of the engine execution context
///
/// The first [`acquire`](GlobalState::acquire) builds the runtime on which every engine
/// callback executes. Releasing the last [`GlobalStateGuard`] tears the runtime down
/// again. Every connection, engine transport and blocking wait holds a guard for as
/// long as it needs the engine, so a non-zero count after all of them are dropped
/// indicates a leak.
#[derive(Debug, Default)]
pub struct GlobalState {
    inner: Mutex<Inner>,
}

impl GlobalState {
    /// Creates a standalone state, mostly useful for testing
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance
    pub fn instance() -> &'static GlobalState {
        GLOBAL_STATE.get_or_init(GlobalState::new)
    }

    /// Increments the reference count, initializing the engine on the 0 -> 1 transition
    pub fn acquire(&self) -> Result<GlobalStateGuard<'_>, io::Error> {
        let mut inner = self.inner.lock();
        let handle = match &inner.runtime {
            Some(runtime) => runtime.handle().clone(),
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(ENGINE_WORKER_THREADS)
                    .thread_name("fe2o3-amqp-engine")
                    .enable_all()
                    .build()?;
                debug!("Engine initialized");
                let handle = runtime.handle().clone();
                inner.runtime = Some(runtime);
                handle
            }
        };
        inner.ref_count += 1;
        Ok(GlobalStateGuard {
            state: self,
            handle,
        })
    }

    fn release(&self) {
        let runtime = {
            let mut inner = self.inner.lock();
            inner.ref_count = inner.ref_count.saturating_sub(1);
            match inner.ref_count {
                0 => inner.runtime.take(),
                _ => None,
            }
        };

        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!("Engine torn down");
        }
    }

    /// Current number of outstanding guards
    pub fn ref_count(&self) -> usize {
        self.inner.lock().ref_count
    }

    /// Whether no guard is outstanding
    pub fn is_idle(&self) -> bool {
        self.ref_count() == 0
    }

    /// Panics if any guard is still outstanding
    pub fn assert_idle(&self) {
        let ref_count = self.ref_count();
        assert!(
            ref_count == 0,
            "Engine resources leaked: {} global state references outstanding",
            ref_count
        );
    }
}

/// Keeps the engine execution context alive
pub struct GlobalStateGuard<'a> {
    state: &'a GlobalState,
    handle: Handle,
}

impl<'a> fmt::Debug for GlobalStateGuard<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalStateGuard").finish_non_exhaustive()
    }
}

impl<'a> GlobalStateGuard<'a> {
    /// Handle to the engine execution context
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl<'a> Clone for GlobalStateGuard<'a> {
    fn clone(&self) -> Self {
        self.state.inner.lock().ref_count += 1;
        Self {
            state: self.state,
            handle: self.handle.clone(),
        }
    }
}

impl<'a> Drop for GlobalStateGuard<'a> {
    fn drop(&mut self) {
        self.state.release()
    }
}

#[cfg(test)]
mod tests {
    use super::GlobalState;

    #[test]
    fn acquire_and_release_balance() {
        let state = GlobalState::new();
        state.assert_idle();

        let first = state.acquire().unwrap();
        let second = state.acquire().unwrap();
        assert_eq!(state.ref_count(), 2);

        drop(first);
        assert_eq!(state.ref_count(), 1);
        drop(second);
        state.assert_idle();
    }

    #[test]
    fn clone_holds_a_reference() {
        let state = GlobalState::new();
        let guard = state.acquire().unwrap();
        let cloned = guard.clone();
        drop(guard);
        assert!(!state.is_idle());
        drop(cloned);
        assert!(state.is_idle());
    }

    #[test]
    fn engine_is_reinitialized_after_teardown() {
        let state = GlobalState::new();
        let guard = state.acquire().unwrap();
        let value = guard.handle().block_on(async { 7 });
        assert_eq!(value, 7);
        drop(guard);

        let guard = state.acquire().unwrap();
        let value = guard.handle().block_on(async { 11 });
        assert_eq!(value, 11);
    }

    #[test]
    #[should_panic(expected = "Engine resources leaked")]
    fn assert_idle_panics_on_leak() {
        let state = GlobalState::new();
        let guard = state.acquire().unwrap();
        std::mem::forget(guard);
        state.assert_idle();
    }
}
