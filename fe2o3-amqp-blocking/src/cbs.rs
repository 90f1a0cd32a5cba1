//! Claims-based security client
//!
//! The exchange with the `$cbs` node is carried out by the engine's
//! [`CbsTransport`]. This module only drives it and blocks on the results.

use std::{
    fmt,
    sync::{Arc, OnceLock, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use fe2o3_amqp_cbs::token::CbsToken;
use parking_lot::Mutex;
use serde_amqp::primitives::Timestamp;
use tracing::{debug, instrument, warn};

use crate::{
    context::Context,
    engine::{CbsEvents, CbsTransport, PutTokenError, TransportError},
    queue::{AsyncOperationQueue, WaitError},
    session::{Session, SessionImpl},
};

/// States of a [`ClaimsBasedSecurity`] client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbsState {
    /// Created but not opened
    Idle,

    /// Waiting for the links to attach
    Opening,

    /// Tokens can be put
    Open,

    /// Closed, or the links failed
    Closed,
}

/// Error of a claims-based security exchange
#[derive(Debug, thiserror::Error)]
pub enum CbsError {
    /// The client is not in a state that allows the request
    #[error("Illegal CBS client state {0:?}")]
    IllegalState(CbsState),

    /// The engine failed to carry the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The node refused the token
    #[error("Status {code}: {description:?}")]
    Status {
        /// Status code of the response
        code: i32,

        /// Status description of the response
        description: Option<String>,
    },

    /// The wait for the node was cancelled
    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl From<PutTokenError> for CbsError {
    fn from(err: PutTokenError) -> Self {
        match err {
            PutTokenError::Status { code, description } => CbsError::Status { code, description },
            PutTokenError::Transport(err) => CbsError::Transport(err),
        }
    }
}

struct CbsImpl {
    session: Arc<SessionImpl>,
    transport: OnceLock<Box<dyn CbsTransport>>,
    state: Mutex<CbsState>,
    open_queue: AsyncOperationQueue<Result<(), TransportError>>,
    put_token_queue: AsyncOperationQueue<Result<(), PutTokenError>>,
    close_queue: AsyncOperationQueue<Result<(), TransportError>>,
}

impl CbsImpl {
    fn transport(&self) -> Result<&dyn CbsTransport, TransportError> {
        self.transport
            .get()
            .map(|transport| transport.as_ref())
            .ok_or(TransportError::IllegalState)
    }

    fn set_state(&self, state: CbsState) {
        *self.state.lock() = state;
    }

    fn open(self: &Arc<Self>, ctx: &Context) -> Result<(), CbsError> {
        {
            let _lock = self.session.connection().lock();
            let mut state = self.state.lock();
            if *state != CbsState::Idle {
                return Err(CbsError::IllegalState(*state));
            }
            *state = CbsState::Opening;
            drop(state);

            let weak = Arc::downgrade(self);
            let events: Weak<dyn CbsEvents> = weak;
            let opened = self
                .session
                .transport()
                .and_then(|session| session.create_cbs(events))
                .and_then(|transport| {
                    let transport = self.transport.get_or_init(|| transport);
                    transport.open()
                });
            if let Err(err) = opened {
                self.set_state(CbsState::Closed);
                return Err(CbsError::Transport(err));
            }
        }

        let result = self.open_queue.wait_for_result(ctx);
        match result {
            Ok(Ok(())) => {
                self.set_state(CbsState::Open);
                Ok(())
            }
            Ok(Err(err)) => {
                self.set_state(CbsState::Closed);
                Err(CbsError::Transport(err))
            }
            Err(err) => {
                warn!(?err, "CBS open abandoned");
                self.set_state(CbsState::Closed);
                Err(CbsError::Wait(err))
            }
        }
    }

    fn put_token(&self, audience: &str, token: CbsToken<'static>, ctx: &Context) -> Result<(), CbsError> {
        {
            let _lock = self.session.connection().lock();
            let state = *self.state.lock();
            if state != CbsState::Open {
                return Err(CbsError::IllegalState(state));
            }
            self.put_token_queue.clear();
            self.transport()?.put_token(audience.to_string(), token)?;
        }

        self.put_token_queue.wait_for_result(ctx)??;
        debug!(audience, "Token accepted");
        Ok(())
    }

    fn close(&self, ctx: &Context) -> Result<(), CbsError> {
        {
            let _lock = self.session.connection().lock();
            let mut state = self.state.lock();
            if *state != CbsState::Open {
                return Err(CbsError::IllegalState(*state));
            }
            *state = CbsState::Closed;
            drop(state);

            self.close_queue.clear();
            self.transport()?.close()?;
        }

        self.close_queue.wait_for_result(ctx)??;
        Ok(())
    }
}

impl CbsEvents for CbsImpl {
    fn on_cbs_opened(&self, result: Result<(), TransportError>) {
        engine_event!(
            self.session.connection().trace_enabled(),
            ok = result.is_ok(),
            "CBS opened"
        );
        self.open_queue.complete_operation(result);
    }

    fn on_token_put(&self, result: Result<(), PutTokenError>) {
        engine_event!(
            self.session.connection().trace_enabled(),
            ok = result.is_ok(),
            "Token put"
        );
        self.put_token_queue.complete_operation(result);
    }

    fn on_cbs_closed(&self, result: Result<(), TransportError>) {
        engine_event!(
            self.session.connection().trace_enabled(),
            ok = result.is_ok(),
            "CBS closed"
        );
        self.close_queue.complete_operation(result);
    }
}

impl Drop for CbsImpl {
    fn drop(&mut self) {
        if *self.state.get_mut() == CbsState::Open {
            if let Some(transport) = self.transport.get() {
                let _ = transport.close();
            }
        }
    }
}

/// CBS client
///
/// The client talks to the `$cbs` node without authenticating itself, so it can
/// run before any token is put. Several clients may share a session.
pub struct ClaimsBasedSecurity {
    inner: Arc<CbsImpl>,
}

impl fmt::Debug for ClaimsBasedSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimsBasedSecurity")
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl ClaimsBasedSecurity {
    /// Creates a client on `session`. Nothing is attached until [`Self::open`]
    pub fn new(session: &Session) -> Self {
        Self {
            inner: Arc::new(CbsImpl {
                session: session.inner.clone(),
                transport: OnceLock::new(),
                state: Mutex::new(CbsState::Idle),
                open_queue: AsyncOperationQueue::new(),
                put_token_queue: AsyncOperationQueue::new(),
                close_queue: AsyncOperationQueue::new(),
            }),
        }
    }

    /// Attaches the request and response links
    pub fn open(&self, ctx: &Context) -> Result<(), CbsError> {
        self.inner.open(ctx)
    }

    /// Puts `token` for `audience` and waits for the node's verdict
    #[instrument(skip(self, token, ctx))]
    pub fn put_token(
        &self,
        token_type: &str,
        audience: &str,
        token: &str,
        expires_on: SystemTime,
        ctx: &Context,
    ) -> Result<(), CbsError> {
        let token = CbsToken::new(
            token.to_string(),
            token_type.to_string(),
            Some(to_timestamp(expires_on)),
        );
        self.inner.put_token(audience, token, ctx)
    }

    /// Detaches both links
    pub fn close(&self, ctx: &Context) -> Result<(), CbsError> {
        self.inner.close(ctx)
    }

    /// Current state
    pub fn state(&self) -> CbsState {
        *self.inner.state.lock()
    }
}

fn to_timestamp(time: SystemTime) -> Timestamp {
    let millis = match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(err) => -i64::try_from(err.duration().as_millis()).unwrap_or(i64::MAX),
    };
    Timestamp::from_milliseconds(millis)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{to_timestamp, CbsError};
    use crate::engine::{PutTokenError, TransportError};

    #[test]
    fn timestamp_is_unix_milliseconds() {
        let time = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(to_timestamp(time).milliseconds(), 1_500);
    }

    #[test]
    fn refused_token_keeps_its_status() {
        let err = CbsError::from(PutTokenError::Status {
            code: 401,
            description: Some("Unauthorized".to_string()),
        });
        assert!(matches!(err, CbsError::Status { code: 401, .. }));

        let err = CbsError::from(PutTokenError::Transport(TransportError::Closed));
        assert!(matches!(err, CbsError::Transport(TransportError::Closed)));
    }
}
