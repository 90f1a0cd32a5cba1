//! Implements AMQP1.0 Connection

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use fe2o3_amqp_types::definitions::{ConnectionError, ErrorCondition, Fields};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use slab::Slab;
use tracing::{debug, instrument, warn};

use crate::{
    cbs::ClaimsBasedSecurity,
    constants::TOKEN_REFRESH_MARGIN,
    context::Context,
    credential::{AccessToken, TokenCredential, TokenRequestContext},
    engine::{
        ConnectionEvents, ConnectionTransport, Engine, IncomingSession, OpenParams, RemoteOpen,
        TransportError,
    },
    error::AmqpError,
    global_state::{GlobalState, GlobalStateGuard},
    queue::AsyncOperationQueue,
    session::{Session, SessionImpl, SessionOptions},
};

mod builder;
mod error;

pub use builder::{Builder, ConnectionOptions};
pub use error::*;

/// Connection states
///
/// See Figure 2.23 of the AMQP 1.0 specification. `Opening` covers the open
/// handshake, `CloseSent` a locally initiated close waiting for the peer and
/// `Closing` a close started by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection has not been opened yet
    Unstarted,

    /// `open` was sent and the peer has not answered yet
    Opening,

    /// Both peers exchanged `open`
    Open,

    /// `close` was sent and the peer has not answered yet
    CloseSent,

    /// `close` was received from the peer
    Closing,

    /// Both peers exchanged `close`
    Closed,

    /// The transport failed or the connection was abandoned
    Error,
}

/// Connection level notifications
///
/// Every method runs on the engine execution context and must not block.
pub trait ConnectionEventHandler: Send + Sync {
    /// The connection state changed
    fn on_state_changed(&self, _new_state: ConnectionState, _old_state: ConnectionState) {}

    /// The peer began a session, which can be taken with [`Connection::accept_session`]
    fn on_new_session(&self) {}

    /// The transport failed
    fn on_io_error(&self, _error: &TransportError) {}
}

type TokenSlot = Arc<Mutex<Option<AccessToken>>>;

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    remote_open: Option<RemoteOpen>,
    remote_close: Option<AmqpError>,
    error: Option<AmqpError>,
    open_pending: bool,
    close_pending: bool,
}

pub(crate) struct ConnectionImpl {
    scheme: String,
    host: String,
    port: u16,
    options: ConnectionOptions,
    engine: Arc<dyn Engine>,
    credential: Option<Arc<dyn TokenCredential>>,
    event_handler: Option<Arc<dyn ConnectionEventHandler>>,

    /// Serializes every request made to the engine handles of this connection and
    /// of its sessions and links
    engine_lock: ReentrantMutex<()>,
    transport: OnceLock<Box<dyn ConnectionTransport>>,
    inner: Mutex<Inner>,

    open_queue: AsyncOperationQueue<Result<(), AmqpError>>,
    close_queue: AsyncOperationQueue<Option<AmqpError>>,
    new_session_queue: AsyncOperationQueue<Box<dyn IncomingSession>>,

    sessions: Mutex<Slab<Weak<SessionImpl>>>,
    tokens: Mutex<HashMap<String, TokenSlot>>,

    _guard: GlobalStateGuard<'static>,
}

impl fmt::Debug for ConnectionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionImpl")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("container_id", &self.options.container_id)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl ConnectionImpl {
    fn new(
        scheme: String,
        host: String,
        port: u16,
        options: ConnectionOptions,
        engine: Arc<dyn Engine>,
        credential: Option<Arc<dyn TokenCredential>>,
        event_handler: Option<Arc<dyn ConnectionEventHandler>>,
    ) -> Result<Arc<Self>, BuildError> {
        let guard = GlobalState::instance().acquire()?;
        Ok(Arc::new(Self {
            scheme,
            host,
            port,
            options,
            engine,
            credential,
            event_handler,
            engine_lock: ReentrantMutex::new(()),
            transport: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Unstarted,
                remote_open: None,
                remote_close: None,
                error: None,
                open_pending: false,
                close_pending: false,
            }),
            open_queue: AsyncOperationQueue::new(),
            close_queue: AsyncOperationQueue::new(),
            new_session_queue: AsyncOperationQueue::new(),
            sessions: Mutex::new(Slab::new()),
            tokens: Mutex::new(HashMap::new()),
            _guard: guard,
        }))
    }

    /// Registers the connection with the engine
    ///
    /// This must run before the connection is handed out, since the engine only
    /// learns about the connection through the weak reference created here.
    fn finish_construction(self: &Arc<Self>) -> Result<(), BuildError> {
        let weak = Arc::downgrade(self);
        let events: Weak<dyn ConnectionEvents> = weak;
        let params = OpenParams {
            container_id: self.options.container_id.clone(),
            hostname: self
                .options
                .hostname
                .clone()
                .unwrap_or_else(|| self.host.clone()),
            max_frame_size: self.options.max_frame_size,
            channel_max: self.options.channel_max,
            idle_timeout: self.options.idle_time_out,
            properties: self.options.properties.clone(),
        };
        let transport = self
            .engine
            .create_connection(&self.host, self.port, params, events)?;
        if self.transport.set(transport).is_err() {
            return Err(BuildError::Transport(TransportError::IllegalState));
        }
        Ok(())
    }

    pub(crate) fn transport(&self) -> Result<&dyn ConnectionTransport, TransportError> {
        self.transport
            .get()
            .map(|transport| transport.as_ref())
            .ok_or(TransportError::IllegalState)
    }

    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.engine_lock.lock()
    }

    pub(crate) fn trace_enabled(&self) -> bool {
        self.options.enable_trace
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub(crate) fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub(crate) fn container_id(&self) -> &str {
        &self.options.container_id
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn audience_for(&self, address: &str) -> String {
        match address.contains("://") {
            true => address.to_string(),
            false => format!(
                "{}://{}/{}",
                self.scheme,
                self.host,
                address.trim_start_matches('/')
            ),
        }
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        let local = self.options.max_frame_size;
        match &self.inner.lock().remote_open {
            Some(remote) => local.min(remote.max_frame_size),
            None => local,
        }
    }

    pub(crate) fn max_channel(&self) -> u16 {
        let local = self.options.channel_max;
        match &self.inner.lock().remote_open {
            Some(remote) => local.min(remote.channel_max),
            None => local,
        }
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        let local = self.options.idle_time_out;
        let remote = self
            .inner
            .lock()
            .remote_open
            .as_ref()
            .and_then(|remote| remote.idle_timeout);
        match (local, remote) {
            (Some(local), Some(remote)) => Some(local.min(remote)),
            (local, remote) => local.or(remote),
        }
    }

    pub(crate) fn properties(&self) -> Option<Fields> {
        self.inner
            .lock()
            .remote_open
            .as_ref()
            .and_then(|remote| remote.properties.clone())
    }

    #[instrument(skip_all, fields(host = %self.host, port = self.port))]
    pub(crate) fn open(&self, ctx: &Context) -> Result<(), OpenError> {
        {
            let _lock = self.lock();
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Unstarted => {}
                state => return Err(OpenError::IllegalState(state)),
            }
            inner.state = ConnectionState::Opening;
            inner.open_pending = true;
            drop(inner);

            self.open_queue.clear();
            if let Err(err) = self.transport().and_then(|t| t.open()) {
                let mut inner = self.inner.lock();
                inner.state = ConnectionState::Error;
                inner.open_pending = false;
                return Err(OpenError::Transport(err));
            }
        }

        match self.open_queue.wait_for_result(ctx) {
            Ok(Ok(())) => {
                debug!("Connection opened");
                Ok(())
            }
            Ok(Err(error)) => Err(OpenError::Remote(error)),
            Err(err) => {
                warn!(?err, "Open abandoned");
                let mut inner = self.inner.lock();
                inner.open_pending = false;
                inner.state = ConnectionState::Error;
                Err(OpenError::Wait(err))
            }
        }
    }

    #[instrument(skip_all, fields(host = %self.host, port = self.port))]
    pub(crate) fn close(&self, error: Option<AmqpError>, ctx: &Context) -> Result<(), CloseError> {
        let (send_result, open_abandoned) = {
            let _lock = self.lock();
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Opening | ConnectionState::Open => {}
                ConnectionState::Error => {
                    inner.state = ConnectionState::Closed;
                    drop(inner);
                    debug!("Releasing errored connection");
                    if let Ok(transport) = self.transport() {
                        let _ = transport.close(error);
                    }
                    self.invalidate_sessions(&AmqpError::new(
                        ConnectionError::ConnectionForced,
                        Some("The connection was closed".to_string()),
                    ));
                    return Ok(());
                }
                state => return Err(CloseError::IllegalState(state)),
            }
            inner.state = ConnectionState::CloseSent;
            inner.close_pending = true;
            let open_abandoned = std::mem::take(&mut inner.open_pending);
            drop(inner);

            self.close_queue.clear();
            (
                self.transport().and_then(|t| t.close(error)),
                open_abandoned,
            )
        };

        let closed = AmqpError::new(
            ConnectionError::ConnectionForced,
            Some("The connection was closed".to_string()),
        );
        if open_abandoned {
            self.open_queue.complete_operation(Err(closed.clone()));
        }
        self.invalidate_sessions(&closed);

        if let Err(err) = send_result {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Closed;
            inner.close_pending = false;
            return Err(CloseError::Transport(err));
        }

        let result = self.close_queue.wait_for_result(ctx);
        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Closed;
            inner.close_pending = false;
        }
        match result {
            Ok(None) => {
                debug!("Connection closed");
                Ok(())
            }
            Ok(Some(error)) => Err(CloseError::Remote(error)),
            Err(err) => {
                warn!(?err, "Close abandoned, local resources released");
                Err(CloseError::Wait(err))
            }
        }
    }

    pub(crate) fn create_session(
        self: &Arc<Self>,
        options: SessionOptions,
    ) -> Result<Arc<SessionImpl>, CreateSessionError> {
        match self.state() {
            ConnectionState::Closed | ConnectionState::Error => {
                return Err(CreateSessionError::IllegalState(self.state()))
            }
            _ => {}
        }
        let session = SessionImpl::new(self.clone(), options);
        session.finish_construction()?;
        Ok(session)
    }

    pub(crate) fn accept_session(
        self: &Arc<Self>,
        options: SessionOptions,
        ctx: &Context,
    ) -> Result<Arc<SessionImpl>, AcceptSessionError> {
        let incoming = self.new_session_queue.wait_for_result(ctx)?;
        let session = SessionImpl::new(self.clone(), options);
        session.finish_incoming(incoming, ctx)?;
        Ok(session)
    }

    pub(crate) fn register_session(
        &self,
        session: Weak<SessionImpl>,
    ) -> Result<usize, CreateSessionError> {
        let mut sessions = self.sessions.lock();
        if sessions.len() > self.max_channel() as usize {
            return Err(CreateSessionError::ChannelMaxReached);
        }
        Ok(sessions.insert(session))
    }

    pub(crate) fn unregister_session(&self, key: usize) {
        let mut sessions = self.sessions.lock();
        if sessions.contains(key) {
            sessions.remove(key);
        }
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn invalidate_sessions(&self, error: &AmqpError) {
        let sessions: Vec<Arc<SessionImpl>> = self
            .sessions
            .lock()
            .iter()
            .filter_map(|(_, session)| session.upgrade())
            .collect();
        for session in sessions {
            session.on_connection_lost(error);
        }
    }

    /// Returns a token for `audience`, performing a put-token exchange over `session`
    /// unless a cached token is still fresh
    #[instrument(skip(self, session, ctx))]
    pub(crate) fn authenticate_audience(
        &self,
        session: &Session,
        audience: &str,
        ctx: &Context,
    ) -> Result<AccessToken, AuthenticationError> {
        let credential = self
            .credential
            .as_ref()
            .ok_or(AuthenticationError::CredentialNotFound)?;

        let slot = self
            .tokens
            .lock()
            .entry(audience.to_string())
            .or_default()
            .clone();
        let mut cached = slot.lock();
        if let Some(token) = cached.as_ref() {
            if !token.expires_within(TOKEN_REFRESH_MARGIN) {
                debug!("Using cached token");
                return Ok(token.clone());
            }
        }

        let scopes = match self.options.authentication_scopes.is_empty() {
            true => vec![audience.to_string()],
            false => self.options.authentication_scopes.clone(),
        };
        let token = credential.get_token(&TokenRequestContext { scopes }, ctx)?;

        let cbs = ClaimsBasedSecurity::new(session);
        cbs.open(ctx)?;
        let result = cbs.put_token(
            credential.token_type(),
            audience,
            &token.token,
            token.expires_on,
            ctx,
        );
        if let Err(err) = cbs.close(ctx) {
            warn!(?err, "Failed to close the claims-based security links");
        }
        result?;

        debug!("Audience authenticated");
        *cached = Some(token.clone());
        Ok(token)
    }
}

impl ConnectionEvents for ConnectionImpl {
    fn on_state_changed(&self, new_state: ConnectionState, old_state: ConnectionState) {
        engine_event!(
            self.trace_enabled(),
            ?new_state,
            ?old_state,
            "Connection state changed"
        );

        let mut lost = None;
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ConnectionState::Closed | ConnectionState::Error) {
                return;
            }
            inner.state = new_state;
            match new_state {
                ConnectionState::Open => {
                    if std::mem::take(&mut inner.open_pending) {
                        self.open_queue.complete_operation(Ok(()));
                    }
                }
                ConnectionState::Error => {
                    let error = inner.error.clone().unwrap_or_else(|| {
                        AmqpError::new(
                            ConnectionError::ConnectionForced,
                            Some("The connection entered the error state".to_string()),
                        )
                    });
                    if std::mem::take(&mut inner.open_pending) {
                        self.open_queue.complete_operation(Err(error.clone()));
                    }
                    if std::mem::take(&mut inner.close_pending) {
                        self.close_queue.complete_operation(Some(error.clone()));
                    }
                    lost = Some(error);
                }
                ConnectionState::Closed => {
                    let remote = inner.remote_close.take();
                    if std::mem::take(&mut inner.close_pending) {
                        self.close_queue.complete_operation(remote);
                    } else {
                        let error = remote.unwrap_or_else(|| {
                            AmqpError::new(
                                ConnectionError::ConnectionForced,
                                Some("The connection was closed by the peer".to_string()),
                            )
                        });
                        if std::mem::take(&mut inner.open_pending) {
                            self.open_queue.complete_operation(Err(error.clone()));
                        }
                        inner.error = Some(error.clone());
                        lost = Some(error);
                    }
                }
                _ => {}
            }
        }

        if let Some(error) = lost {
            warn!(%error, "Connection lost");
            self.invalidate_sessions(&error);
        }
        if let Some(handler) = &self.event_handler {
            handler.on_state_changed(new_state, old_state);
        }
    }

    fn on_remote_open(&self, remote: RemoteOpen) {
        engine_event!(self.trace_enabled(), open = ?remote, "Remote open");
        self.inner.lock().remote_open = Some(remote);
    }

    fn on_remote_close(&self, error: Option<AmqpError>) {
        engine_event!(self.trace_enabled(), ?error, "Remote close");
        self.inner.lock().remote_close = error;
    }

    fn on_io_error(&self, error: TransportError) {
        warn!(?error, "Connection transport failed");
        self.inner.lock().error = Some(error.to_amqp_error());
        if let Some(handler) = &self.event_handler {
            handler.on_io_error(&error);
        }
    }

    fn on_new_session(&self, session: Box<dyn IncomingSession>) {
        engine_event!(self.trace_enabled(), begin = ?session.remote_begin(), "Remote begin");
        self.new_session_queue.complete_operation(session);
        if let Some(handler) = &self.event_handler {
            handler.on_new_session();
        }
    }
}

impl Drop for ConnectionImpl {
    fn drop(&mut self) {
        let state = self.inner.get_mut().state;
        if matches!(state, ConnectionState::Opening | ConnectionState::Open) {
            if let Some(transport) = self.transport.get() {
                let _ = transport.close(None);
            }
        }
    }
}

/// A connection to an AMQP peer
///
/// Cloning a [`Connection`] yields another handle to the same connection. The
/// connection stays alive as long as any handle or any [`Session`] created from it
/// exists.
///
/// # Example
///
/// ```rust,no_run
/// use fe2o3_amqp_blocking::{engine::fe2o3::Fe2o3Engine, Connection, Context};
///
/// let connection = Connection::builder()
///     .container_id("connection-1")
///     .engine(Fe2o3Engine::new())
///     .open("localhost", &Context::new())
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionImpl>,
}

impl Connection {
    /// Creates a [`Builder`] for [`Connection`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Opens the connection, blocking until the peer answers or `ctx` fires
    ///
    /// Opening an open connection is a no-op. If `ctx` fires first, the connection
    /// is left in [`ConnectionState::Error`].
    pub fn open(&self, ctx: &Context) -> Result<(), OpenError> {
        self.inner.open(ctx)
    }

    /// Closes the connection without an error condition
    ///
    /// A close abandoned because `ctx` fired still releases every local resource.
    pub fn close(&self, ctx: &Context) -> Result<(), CloseError> {
        self.inner.close(None, ctx)
    }

    /// Closes the connection, attaching an error condition to the `close` frame
    pub fn close_with_error(
        &self,
        condition: impl Into<ErrorCondition>,
        description: impl Into<Option<String>>,
        info: Option<Fields>,
        ctx: &Context,
    ) -> Result<(), CloseError> {
        let error = AmqpError::new(condition, description).with_info(info);
        self.inner.close(Some(error), ctx)
    }

    /// Host the connection targets
    pub fn host(&self) -> &str {
        self.inner.host()
    }

    /// Port the connection targets
    pub fn port(&self) -> u16 {
        self.inner.port()
    }

    /// Container id of the local peer
    pub fn container_id(&self) -> &str {
        self.inner.container_id()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether the connection is open
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Negotiated max frame size, or the local value before the connection is open
    pub fn max_frame_size(&self) -> u32 {
        self.inner.max_frame_size()
    }

    /// Negotiated channel max, or the local value before the connection is open
    pub fn max_channel(&self) -> u16 {
        self.inner.max_channel()
    }

    /// Negotiated idle timeout, or the local value before the connection is open
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.idle_timeout()
    }

    /// Connection properties sent by the peer
    pub fn properties(&self) -> Option<Fields> {
        self.inner.properties()
    }

    /// Number of live sessions on this connection
    pub fn session_count(&self) -> usize {
        self.inner.session_count()
    }

    /// Creates a session. The session must be begun before links can be created on it
    pub fn create_session(&self, options: SessionOptions) -> Result<Session, CreateSessionError> {
        self.inner.create_session(options).map(Session::from)
    }

    /// Waits for the peer to begin a session and accepts it
    pub fn accept_session(
        &self,
        options: SessionOptions,
        ctx: &Context,
    ) -> Result<Session, AcceptSessionError> {
        self.inner
            .accept_session(options, ctx)
            .map(Session::from)
    }

    /// Obtains a token for `audience` from the connection credential and presents it
    /// to the peer over `session`
    ///
    /// A token that does not expire within five minutes is served from the cache
    /// without contacting the peer. Calls for different audiences proceed concurrently.
    pub fn authenticate_audience(
        &self,
        session: &Session,
        audience: &str,
        ctx: &Context,
    ) -> Result<AccessToken, AuthenticationError> {
        self.inner.authenticate_audience(session, audience, ctx)
    }

    /// The audience presented for a node address on this connection
    pub fn audience_for(&self, address: &str) -> String {
        self.inner.audience_for(address)
    }
}
