//! Cancellation and deadline context accepted by every blocking call

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Reason a [`Context`] stopped a blocking call
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context was cancelled explicitly
    #[error("The operation was cancelled")]
    Cancelled,

    /// The deadline of the context has passed
    #[error("The context deadline was exceeded")]
    DeadlineExceeded,
}

/// A cancellation token with an optional deadline
///
/// Deriving a context with [`with_timeout`](Context::with_timeout) or
/// [`with_deadline`](Context::with_deadline) creates a child: cancelling the parent
/// cancels the child, but not the other way around. The effective deadline of a
/// child is never later than the deadline of its parent.
///
/// | Field | Default Value |
/// |-------|---------------|
/// | deadline | `None` |
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context that is never cancelled unless [`cancel`](Context::cancel) is called
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derives a child context that expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context that expires at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// The deadline of the context
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this context and all contexts derived from it
    pub fn cancel(&self) {
        self.token.cancel()
    }

    /// Whether the context is cancelled or past its deadline
    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Returns an error if the context is cancelled or past its deadline
    pub fn check(&self) -> Result<(), ContextError> {
        if self.token.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves when the context is cancelled or its deadline passes
    ///
    /// This must be polled within a runtime with the time driver enabled.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline.into()) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{Context, ContextError};

    #[test]
    fn default_context_is_live() {
        let ctx = Context::default();
        assert!(ctx.check().is_ok());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let parent = Context::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.check(), Err(ContextError::Cancelled));
    }

    #[test]
    fn cancelling_child_leaves_parent_live() {
        let parent = Context::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_deadline_never_extends_parent() {
        let parent = Context::new().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn expired_deadline_is_reported() {
        let ctx = Context::new().with_deadline(Instant::now());
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
    }

    #[test]
    fn done_resolves_on_deadline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        let reason = rt.block_on(ctx.done());
        assert_eq!(reason, ContextError::DeadlineExceeded);
    }
}
