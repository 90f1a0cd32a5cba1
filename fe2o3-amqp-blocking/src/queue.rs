//! Completion queue bridging engine callbacks to blocking callers

use std::{collections::VecDeque, fmt, io};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::Notify};

use crate::{
    context::{Context, ContextError},
    global_state::GlobalState,
};

/// Error returned by [`AsyncOperationQueue::wait_for_result`]
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The context was cancelled or its deadline passed
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The wait was issued from a thread that drives an async runtime, which would
    /// deadlock if the result is posted from the same execution context
    #[error("A blocking wait cannot be issued from within an async execution context")]
    InsideEngineContext,

    /// The engine execution context could not be started
    #[error("Engine execution context is unavailable {0:?}")]
    Runtime(#[from] io::Error),
}

impl WaitError {
    /// Whether the wait ended because of cancellation or a deadline
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitError::Context(_))
    }
}

/// A multi-item completion channel
///
/// Producers (engine callbacks) push one item per completed operation with
/// [`complete_operation`](AsyncOperationQueue::complete_operation), which never blocks.
/// A consumer blocks in [`wait_for_result`](AsyncOperationQueue::wait_for_result) until
/// an item is available or its [`Context`] fires. Items are never dropped: if no
/// consumer shows up they stay queued until the queue itself is dropped.
pub struct AsyncOperationQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> fmt::Debug for AsyncOperationQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperationQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Default for AsyncOperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncOperationQueue<T> {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Posts the result of a completed operation
    pub fn complete_operation(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Takes the oldest item without blocking
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Discards stale results before a new operation is issued
    pub fn clear(&self) {
        self.items.lock().clear()
    }

    /// Waits asynchronously for the next item
    pub async fn recv(&self, ctx: &Context) -> Result<T, ContextError> {
        loop {
            if let Some(item) = self.try_pop() {
                return Ok(item);
            }

            tokio::select! {
                biased;
                _ = self.notify.notified() => {},
                reason = ctx.done() => {
                    // A result posted right before cancellation still wins
                    return self.try_pop().ok_or(reason)
                },
            }
        }
    }

    /// Blocks the calling thread until an item is available or `ctx` fires
    ///
    /// This must not be called from an engine callback. A call made from a thread
    /// that is driving an async runtime fails with [`WaitError::InsideEngineContext`]
    /// unless a result is already queued.
    pub fn wait_for_result(&self, ctx: &Context) -> Result<T, WaitError> {
        if let Some(item) = self.try_pop() {
            return Ok(item);
        }
        ctx.check()?;

        if Handle::try_current().is_ok() {
            return Err(WaitError::InsideEngineContext);
        }

        let guard = GlobalState::instance().acquire()?;
        guard
            .handle()
            .block_on(self.recv(ctx))
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use tokio_test::{assert_err, assert_ok};

    use crate::context::{Context, ContextError};

    use super::{AsyncOperationQueue, WaitError};

    #[test]
    fn queued_item_is_returned_immediately() {
        let queue = AsyncOperationQueue::new();
        queue.complete_operation(1u32);
        queue.complete_operation(2u32);
        assert_eq!(queue.len(), 2);

        let first = assert_ok!(queue.wait_for_result(&Context::new()));
        assert_eq!(first, 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn waiter_is_woken_by_producer() {
        let queue = Arc::new(AsyncOperationQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.complete_operation("done");
            })
        };

        let ctx = Context::new().with_timeout(Duration::from_secs(5));
        let item = assert_ok!(queue.wait_for_result(&ctx));
        assert_eq!(item, "done");
        producer.join().unwrap();
    }

    #[test]
    fn deadline_unblocks_waiter() {
        let queue = AsyncOperationQueue::<()>::new();
        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        let err = assert_err!(queue.wait_for_result(&ctx));
        assert!(matches!(
            err,
            WaitError::Context(ContextError::DeadlineExceeded)
        ));
    }

    #[test]
    fn cancellation_unblocks_waiter() {
        let queue = AsyncOperationQueue::<()>::new();
        let ctx = Context::new();
        let canceller = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                ctx.cancel();
            })
        };

        let err = assert_err!(queue.wait_for_result(&ctx));
        assert!(err.is_cancelled());
        canceller.join().unwrap();
    }

    #[test]
    fn results_posted_without_consumer_are_kept() {
        let queue = AsyncOperationQueue::new();
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        assert_err!(queue.wait_for_result(&ctx));

        queue.complete_operation(42);
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn waiting_inside_async_context_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let queue = AsyncOperationQueue::<()>::new();
        let result = rt.block_on(async { queue.wait_for_result(&Context::new()) });
        assert!(matches!(result, Err(WaitError::InsideEngineContext)));
    }
}
