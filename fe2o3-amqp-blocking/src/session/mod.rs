//! Implements AMQP1.0 Session

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, OnceLock, Weak,
    },
};

use fe2o3_amqp_types::definitions::{DeliveryNumber, ErrorCondition, Fields, Role};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, instrument, warn};

use crate::{
    connection::{AcceptSessionError, Connection, ConnectionImpl, CreateSessionError},
    constants::{DEFAULT_HANDLE_MAX, DEFAULT_INCOMING_WINDOW, DEFAULT_OUTGOING_WINDOW},
    context::Context,
    engine::{BeginParams, IncomingSession, RemoteBegin, SessionEvents, SessionTransport, TransportError},
    error::AmqpError,
    link::{Link, LinkImpl, LinkOptions, LinkOwner},
    queue::AsyncOperationQueue,
    receiver::{MessageReceiver, MessageReceiverEvents, MessageReceiverOptions},
    sender::{MessageSender, MessageSenderEvents, MessageSenderOptions},
    terminus::{MessageSource, MessageTarget},
};

mod error;

pub use error::*;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session has not been begun
    Unstarted,

    /// `begin` was sent and the peer has not answered yet
    BeginSent,

    /// Both peers exchanged `begin`
    Begun,

    /// `end` was sent and the peer has not answered yet
    EndSent,

    /// Both peers exchanged `end`
    Ended,

    /// The session failed or was ended by the peer
    Error,
}

/// Options of a session
///
/// | Option | Default |
/// |--------|---------|
/// | `maximum_link_count` | `u32::MAX` |
/// | `initial_incoming_window_size` | 1 |
/// | `initial_outgoing_window_size` | 1 |
/// | `properties` | `None` |
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Maximum number of links that can be live on the session, sent as handle-max
    pub maximum_link_count: Option<u32>,

    /// Incoming window sent in `begin`
    pub initial_incoming_window_size: Option<u32>,

    /// Outgoing window sent in `begin`
    pub initial_outgoing_window_size: Option<u32>,

    /// Session properties
    pub properties: Option<Fields>,
}

impl SessionOptions {
    /// Maximum number of links that can be live on the session
    pub fn maximum_link_count(mut self, value: u32) -> Self {
        self.maximum_link_count = Some(value);
        self
    }

    /// Incoming window sent in `begin`
    pub fn initial_incoming_window_size(mut self, value: u32) -> Self {
        self.initial_incoming_window_size = Some(value);
        self
    }

    /// Outgoing window sent in `begin`
    pub fn initial_outgoing_window_size(mut self, value: u32) -> Self {
        self.initial_outgoing_window_size = Some(value);
        self
    }

    /// Session properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    is_begun: bool,
    remote_begin: Option<RemoteBegin>,
    error: Option<AmqpError>,
    begin_pending: bool,
    end_pending: bool,
}

pub(crate) struct SessionImpl {
    connection: Arc<ConnectionImpl>,
    options: SessionOptions,
    transport: OnceLock<Box<dyn SessionTransport>>,
    inner: Mutex<Inner>,

    begin_queue: AsyncOperationQueue<Result<(), AmqpError>>,
    end_queue: AsyncOperationQueue<Option<AmqpError>>,

    links: Mutex<Slab<(String, Weak<LinkImpl>)>>,
    key: OnceLock<usize>,

    /// Delivery ids are unique across the links of a session
    next_delivery_id: AtomicU32,
}

impl fmt::Debug for SessionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionImpl")
            .field("options", &self.options)
            .field("state", &self.inner.lock().state)
            .field("links", &self.links.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionImpl {
    pub(crate) fn new(connection: Arc<ConnectionImpl>, options: SessionOptions) -> Arc<Self> {
        Arc::new(Self {
            connection,
            options,
            transport: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: SessionState::Unstarted,
                is_begun: false,
                remote_begin: None,
                error: None,
                begin_pending: false,
                end_pending: false,
            }),
            begin_queue: AsyncOperationQueue::new(),
            end_queue: AsyncOperationQueue::new(),
            links: Mutex::new(Slab::new()),
            key: OnceLock::new(),
            next_delivery_id: AtomicU32::new(0),
        })
    }

    fn events(self: &Arc<Self>) -> Weak<dyn SessionEvents> {
        let weak = Arc::downgrade(self);
        weak
    }

    fn begin_params(&self) -> BeginParams {
        BeginParams {
            incoming_window: self.incoming_window(),
            outgoing_window: self.outgoing_window(),
            handle_max: self.handle_max(),
            properties: self.options.properties.clone(),
        }
    }

    /// Registers the session with its connection and the engine
    pub(crate) fn finish_construction(self: &Arc<Self>) -> Result<(), CreateSessionError> {
        let key = self.connection.register_session(Arc::downgrade(self))?;
        let _ = self.key.set(key);

        let transport = {
            let _lock = self.connection.lock();
            self.connection
                .transport()?
                .create_session(self.begin_params(), self.events())?
        };
        let _ = self.transport.set(transport);
        Ok(())
    }

    /// Registers a session begun by the peer and waits until it is usable
    pub(crate) fn finish_incoming(
        self: &Arc<Self>,
        incoming: Box<dyn IncomingSession>,
        ctx: &Context,
    ) -> Result<(), AcceptSessionError> {
        let key = self.connection.register_session(Arc::downgrade(self))?;
        let _ = self.key.set(key);

        {
            let mut inner = self.inner.lock();
            inner.is_begun = true;
            inner.state = SessionState::BeginSent;
            inner.begin_pending = true;
            inner.remote_begin = Some(incoming.remote_begin().clone());
        }
        self.begin_queue.clear();

        let accepted = {
            let _lock = self.connection.lock();
            incoming.accept(self.begin_params(), self.events())
        };
        let transport = match accepted {
            Ok(transport) => transport,
            Err(err) => {
                self.fail_pending_begin();
                return Err(AcceptSessionError::Transport(err));
            }
        };
        let _ = self.transport.set(transport);

        match self.begin_queue.wait_for_result(ctx) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(AcceptSessionError::Remote(error)),
            Err(err) => {
                self.fail_pending_begin();
                Err(AcceptSessionError::Wait(err))
            }
        }
    }

    fn fail_pending_begin(&self) {
        let mut inner = self.inner.lock();
        inner.begin_pending = false;
        inner.state = SessionState::Error;
    }

    pub(crate) fn transport(&self) -> Result<&dyn SessionTransport, TransportError> {
        self.transport
            .get()
            .map(|transport| transport.as_ref())
            .ok_or(TransportError::IllegalState)
    }

    pub(crate) fn connection(&self) -> &Arc<ConnectionImpl> {
        &self.connection
    }

    /// Allocates the id of an outgoing delivery. Wraps around at `u32::MAX`
    pub(crate) fn next_delivery_id(&self) -> DeliveryNumber {
        self.next_delivery_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub(crate) fn is_begun(&self) -> bool {
        self.inner.lock().is_begun
    }

    pub(crate) fn incoming_window(&self) -> u32 {
        self.options
            .initial_incoming_window_size
            .unwrap_or(DEFAULT_INCOMING_WINDOW)
    }

    pub(crate) fn outgoing_window(&self) -> u32 {
        self.options
            .initial_outgoing_window_size
            .unwrap_or(DEFAULT_OUTGOING_WINDOW)
    }

    pub(crate) fn handle_max(&self) -> u32 {
        self.options.maximum_link_count.unwrap_or(DEFAULT_HANDLE_MAX)
    }

    pub(crate) fn remote_begin(&self) -> Option<RemoteBegin> {
        self.inner.lock().remote_begin.clone()
    }

    #[instrument(skip_all, fields(container_id = %self.connection.container_id()))]
    pub(crate) fn begin(&self, ctx: &Context) -> Result<(), BeginError> {
        {
            let _lock = self.connection.lock();
            let mut inner = self.inner.lock();
            if inner.is_begun || inner.state != SessionState::Unstarted {
                return Err(BeginError::IllegalState(inner.state));
            }
            inner.is_begun = true;
            inner.state = SessionState::BeginSent;
            inner.begin_pending = true;
            drop(inner);

            self.begin_queue.clear();
            if let Err(err) = self.transport().and_then(|t| t.begin()) {
                self.fail_pending_begin();
                return Err(BeginError::Transport(err));
            }
        }

        match self.begin_queue.wait_for_result(ctx) {
            Ok(Ok(())) => {
                debug!("Session begun");
                Ok(())
            }
            Ok(Err(error)) => Err(BeginError::Remote(error)),
            Err(err) => {
                warn!(?err, "Begin abandoned");
                self.fail_pending_begin();
                Err(BeginError::Wait(err))
            }
        }
    }

    #[instrument(skip_all, fields(container_id = %self.connection.container_id()))]
    pub(crate) fn end(&self, error: Option<AmqpError>, ctx: &Context) -> Result<(), EndError> {
        let (send_result, begin_abandoned) = {
            let _lock = self.connection.lock();
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Unstarted => return Err(EndError::NotBegun),
                SessionState::EndSent | SessionState::Ended => return Err(EndError::AlreadyEnded),
                SessionState::Error => {
                    inner.state = SessionState::Ended;
                    drop(inner);
                    debug!("Releasing errored session");
                    let ended = error
                        .clone()
                        .unwrap_or_else(|| AmqpError::detach_forced("The session was ended"));
                    self.invalidate_links(&ended);
                    if let Ok(transport) = self.transport() {
                        let _ = transport.end(error);
                    }
                    return Ok(());
                }
                SessionState::BeginSent | SessionState::Begun => {}
            }
            inner.state = SessionState::EndSent;
            inner.end_pending = true;
            let begin_abandoned = std::mem::take(&mut inner.begin_pending);
            drop(inner);

            self.end_queue.clear();
            (
                self.transport().and_then(|t| t.end(error.clone())),
                begin_abandoned,
            )
        };

        let ended = error.unwrap_or_else(|| AmqpError::detach_forced("The session was ended"));
        if begin_abandoned {
            self.begin_queue.complete_operation(Err(ended.clone()));
        }
        self.invalidate_links(&ended);

        if let Err(err) = send_result {
            self.mark_ended();
            return Err(EndError::Transport(err));
        }

        let result = self.end_queue.wait_for_result(ctx);
        self.mark_ended();
        match result {
            Ok(None) => {
                debug!("Session ended");
                Ok(())
            }
            Ok(Some(error)) => Err(EndError::Remote(error)),
            Err(err) => {
                warn!(?err, "End abandoned, local resources released");
                Err(EndError::Wait(err))
            }
        }
    }

    fn mark_ended(&self) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Ended;
        inner.end_pending = false;
    }

    /// Creates a link on this session. The session must be begun
    pub(crate) fn create_link(
        self: &Arc<Self>,
        role: Role,
        source: Option<MessageSource>,
        target: Option<MessageTarget>,
        options: LinkOptions,
        owner: Weak<dyn LinkOwner>,
    ) -> Result<Arc<LinkImpl>, AllocLinkError> {
        let link = LinkImpl::new(self.clone(), role, source, target, options, owner);
        link.finish_construction()?;
        Ok(link)
    }

    pub(crate) fn allocate_link(
        &self,
        name: &str,
        link: Weak<LinkImpl>,
    ) -> Result<usize, AllocLinkError> {
        let state = self.state();
        if state != SessionState::Begun {
            return Err(AllocLinkError::IllegalState(state));
        }

        let mut links = self.links.lock();
        if links.iter().any(|(_, (existing, _))| existing == name) {
            return Err(AllocLinkError::DuplicatedLinkName);
        }
        if links.len() as u64 >= u64::from(self.handle_max()) {
            return Err(AllocLinkError::HandleMaxReached);
        }
        Ok(links.insert((name.to_string(), link)))
    }

    pub(crate) fn deallocate_link(&self, key: usize) {
        let mut links = self.links.lock();
        if links.contains(key) {
            links.remove(key);
        }
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    fn invalidate_links(&self, error: &AmqpError) {
        let links: Vec<Arc<LinkImpl>> = self
            .links
            .lock()
            .iter()
            .filter_map(|(_, (_, link))| link.upgrade())
            .collect();
        for link in links {
            link.on_session_lost(error);
        }
    }

    /// Fails the session after its connection closed or failed
    pub(crate) fn on_connection_lost(&self, error: &AmqpError) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::BeginSent | SessionState::Begun | SessionState::EndSent => {}
                _ => return,
            }
            inner.state = SessionState::Error;
            inner.error = Some(error.clone());
            if std::mem::take(&mut inner.begin_pending) {
                self.begin_queue.complete_operation(Err(error.clone()));
            }
            if std::mem::take(&mut inner.end_pending) {
                self.end_queue.complete_operation(Some(error.clone()));
            }
        }
        self.invalidate_links(error);
    }
}

impl SessionEvents for SessionImpl {
    fn on_state_changed(&self, new_state: SessionState, old_state: SessionState) {
        engine_event!(
            self.connection.trace_enabled(),
            ?new_state,
            ?old_state,
            "Session state changed"
        );

        let lost = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Ended | SessionState::Error) {
                return;
            }
            match new_state {
                SessionState::Begun => {
                    if inner.state == SessionState::BeginSent {
                        inner.state = SessionState::Begun;
                    }
                    if std::mem::take(&mut inner.begin_pending) {
                        self.begin_queue.complete_operation(Ok(()));
                    }
                    None
                }
                SessionState::Error => {
                    inner.state = SessionState::Error;
                    let error = inner.error.clone().unwrap_or_else(|| {
                        AmqpError::detach_forced("The session entered the error state")
                    });
                    if std::mem::take(&mut inner.begin_pending) {
                        self.begin_queue.complete_operation(Err(error.clone()));
                    }
                    if std::mem::take(&mut inner.end_pending) {
                        self.end_queue.complete_operation(Some(error.clone()));
                    }
                    Some(error)
                }
                state => {
                    inner.state = state;
                    None
                }
            }
        };

        if let Some(error) = lost {
            warn!(%error, "Session lost");
            self.invalidate_links(&error);
        }
    }

    fn on_remote_begin(&self, remote: RemoteBegin) {
        engine_event!(self.connection.trace_enabled(), begin = ?remote, "Remote begin");
        self.inner.lock().remote_begin = Some(remote);
    }

    fn on_remote_end(&self, error: Option<AmqpError>) {
        engine_event!(self.connection.trace_enabled(), ?error, "Remote end");

        let error = {
            let mut inner = self.inner.lock();
            if std::mem::take(&mut inner.end_pending) {
                self.end_queue.complete_operation(error);
                return;
            }
            if !matches!(inner.state, SessionState::BeginSent | SessionState::Begun) {
                return;
            }

            let error = error.unwrap_or_else(|| {
                AmqpError::detach_forced("The session was ended by the peer")
            });
            inner.state = SessionState::Error;
            inner.error = Some(error.clone());
            if std::mem::take(&mut inner.begin_pending) {
                self.begin_queue.complete_operation(Err(error.clone()));
            }
            error
        };

        warn!(%error, "Session ended by the peer");
        self.invalidate_links(&error);
    }
}

impl Drop for SessionImpl {
    fn drop(&mut self) {
        if let Some(key) = self.key.get() {
            self.connection.unregister_session(*key);
        }
        let state = self.inner.get_mut().state;
        if matches!(state, SessionState::BeginSent | SessionState::Begun) {
            if let Some(transport) = self.transport.get() {
                let _ = transport.end(None);
            }
        }
    }
}

/// An AMQP session
///
/// Cloning a [`Session`] yields another handle to the same session. A session keeps
/// its [`Connection`] alive, and every link created on it keeps the session alive.
/// Dropping the last handle of a begun session ends it without waiting for the peer.
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionImpl>,
}

impl From<Arc<SessionImpl>> for Session {
    fn from(inner: Arc<SessionImpl>) -> Self {
        Self { inner }
    }
}

impl Session {
    /// Begins the session, blocking until the peer answers or `ctx` fires
    ///
    /// A session can only be begun once.
    pub fn begin(&self, ctx: &Context) -> Result<(), BeginError> {
        self.inner.begin(ctx)
    }

    /// Ends the session without an error condition, invalidating every link on it
    ///
    /// Ending a session that was never begun, or ending it twice, fails.
    pub fn end(&self, ctx: &Context) -> Result<(), EndError> {
        self.inner.end(None, ctx)
    }

    /// Ends the session, attaching an error condition to the `end` frame
    pub fn end_with_error(
        &self,
        condition: impl Into<ErrorCondition>,
        description: impl Into<Option<String>>,
        ctx: &Context,
    ) -> Result<(), EndError> {
        self.inner
            .end(Some(AmqpError::new(condition, description)), ctx)
    }

    /// The connection the session belongs to
    pub fn connection(&self) -> Connection {
        Connection {
            inner: self.inner.connection.clone(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Whether [`begin`](Session::begin) was called
    pub fn is_begun(&self) -> bool {
        self.inner.is_begun()
    }

    /// Incoming window sent in `begin`
    pub fn incoming_window(&self) -> u32 {
        self.inner.incoming_window()
    }

    /// Outgoing window sent in `begin`
    pub fn outgoing_window(&self) -> u32 {
        self.inner.outgoing_window()
    }

    /// Handle max sent in `begin`
    pub fn handle_max(&self) -> u32 {
        self.inner.handle_max()
    }

    /// Incoming window of the peer, once the session is begun
    pub fn remote_incoming_window(&self) -> Option<u32> {
        self.inner.remote_begin().map(|remote| remote.incoming_window)
    }

    /// Outgoing window of the peer, once the session is begun
    pub fn remote_outgoing_window(&self) -> Option<u32> {
        self.inner.remote_begin().map(|remote| remote.outgoing_window)
    }

    /// Number of live links on this session
    pub fn link_count(&self) -> usize {
        self.inner.link_count()
    }

    /// Creates a link that is driven directly through [`Link`]
    pub fn create_link(
        &self,
        role: Role,
        source: impl Into<Option<MessageSource>>,
        target: impl Into<Option<MessageTarget>>,
        options: LinkOptions,
    ) -> Result<Link, AllocLinkError> {
        Link::create(&self.inner, role, source.into(), target.into(), options)
    }

    /// Creates a sender for the node `target`. The link is created when the sender
    /// is opened
    pub fn create_message_sender(
        &self,
        target: impl Into<MessageTarget>,
        options: MessageSenderOptions,
        events: Option<Arc<dyn MessageSenderEvents>>,
    ) -> MessageSender {
        MessageSender::new(self.inner.clone(), target.into(), options, events)
    }

    /// Creates a receiver for the node `source`. The link is created when the
    /// receiver is opened
    pub fn create_message_receiver(
        &self,
        source: impl Into<MessageSource>,
        options: MessageReceiverOptions,
        events: Option<Arc<dyn MessageReceiverEvents>>,
    ) -> MessageReceiver {
        MessageReceiver::new(self.inner.clone(), source.into(), options, events)
    }
}
