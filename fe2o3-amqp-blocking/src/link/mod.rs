//! Implements AMQP1.0 Link

use std::{
    fmt,
    sync::{Arc, OnceLock, Weak},
};

use fe2o3_amqp_types::definitions::{
    DeliveryNumber, ErrorCondition, Fields, ReceiverSettleMode, Role, SenderSettleMode,
};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    context::Context,
    engine::{AttachParams, LinkEvents, LinkTransport, RemoteAttach, TransportError},
    error::AmqpError,
    message::{AmqpMessage, DeliveryOutcome},
    queue::AsyncOperationQueue,
    session::{AllocLinkError, Session, SessionImpl},
    terminus::{MessageSource, MessageTarget},
};

mod error;

pub use error::*;

/// Link states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The link is not attached. A detached link can be attached again
    Detached,

    /// `attach` was sent and the peer has not answered yet
    Attaching,

    /// Both peers exchanged `attach`
    Attached,

    /// `detach` was sent and the peer has not answered yet
    DetachSent,

    /// Both peers exchanged `detach` with the closed flag set
    Closed,

    /// The link was detached out of band
    Error,
}

/// Options of a link
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Link name, generated when `None`
    pub name: Option<String>,

    /// Settlement policy of the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Settlement policy of the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    /// Largest message the local peer accepts, `None` for no limit
    pub max_message_size: Option<u64>,

    /// Link properties
    pub properties: Option<Fields>,
}

impl LinkOptions {
    /// Link name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Largest message the local peer accepts
    pub fn max_message_size(mut self, max_message_size: u64) -> Self {
        self.max_message_size = Some(max_message_size);
        self
    }
}

/// Endpoint built on top of a link, notified of what happens on it
///
/// Every method runs on the engine execution context and must not block.
pub(crate) trait LinkOwner: Send + Sync {
    fn on_link_state_changed(&self, _new_state: LinkState, _old_state: LinkState) {}

    /// The link was detached out of band
    fn on_link_detached(&self, _error: &AmqpError) {}

    fn on_delivery_settled(&self, _delivery_id: DeliveryNumber, _outcome: DeliveryOutcome) {}

    fn on_message_received(&self, _delivery_id: DeliveryNumber, _message: AmqpMessage) {}
}

struct NoOwner;

impl LinkOwner for NoOwner {}

#[derive(Debug)]
struct Inner {
    state: LinkState,
    remote_attach: Option<RemoteAttach>,
    error: Option<AmqpError>,
    attach_pending: bool,
    detach_pending: bool,
}

pub(crate) struct LinkImpl {
    session: Arc<SessionImpl>,
    name: String,
    role: Role,
    source: Option<MessageSource>,
    target: Option<MessageTarget>,
    options: LinkOptions,
    owner: Weak<dyn LinkOwner>,

    transport: OnceLock<Box<dyn LinkTransport>>,
    inner: Mutex<Inner>,
    attach_queue: AsyncOperationQueue<Result<(), AmqpError>>,
    detach_queue: AsyncOperationQueue<Option<AmqpError>>,
    key: OnceLock<usize>,
}

impl fmt::Debug for LinkImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkImpl")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl LinkImpl {
    pub(crate) fn new(
        session: Arc<SessionImpl>,
        role: Role,
        source: Option<MessageSource>,
        target: Option<MessageTarget>,
        options: LinkOptions,
        owner: Weak<dyn LinkOwner>,
    ) -> Arc<Self> {
        let name = options.name.clone().unwrap_or_else(|| {
            let prefix = match role {
                Role::Sender => "sender",
                Role::Receiver => "receiver",
            };
            format!("{}-{}", prefix, Uuid::new_v4())
        });
        Arc::new(Self {
            session,
            name,
            role,
            source,
            target,
            options,
            owner,
            transport: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: LinkState::Detached,
                remote_attach: None,
                error: None,
                attach_pending: false,
                detach_pending: false,
            }),
            attach_queue: AsyncOperationQueue::new(),
            detach_queue: AsyncOperationQueue::new(),
            key: OnceLock::new(),
        })
    }

    /// Registers the link with its session and the engine
    pub(crate) fn finish_construction(self: &Arc<Self>) -> Result<(), AllocLinkError> {
        let key = self.session.allocate_link(&self.name, Arc::downgrade(self))?;
        let _ = self.key.set(key);

        let weak = Arc::downgrade(self);
        let events: Weak<dyn LinkEvents> = weak;
        let params = AttachParams {
            name: self.name.clone(),
            role: self.role.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            snd_settle_mode: self.options.snd_settle_mode.clone(),
            rcv_settle_mode: self.options.rcv_settle_mode.clone(),
            max_message_size: self.options.max_message_size,
            properties: self.options.properties.clone(),
        };
        let transport = {
            let _lock = self.session.connection().lock();
            self.session.transport()?.create_link(params, events)?
        };
        let _ = self.transport.set(transport);
        Ok(())
    }

    fn transport(&self) -> Result<&dyn LinkTransport, TransportError> {
        self.transport
            .get()
            .map(|transport| transport.as_ref())
            .ok_or(TransportError::IllegalState)
    }

    fn trace_enabled(&self) -> bool {
        self.session.connection().trace_enabled()
    }

    pub(crate) fn session(&self) -> &Arc<SessionImpl> {
        &self.session
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// The smaller of the local and remote limits, `None` when neither side
    /// sets one. Zero means no limit
    pub(crate) fn max_message_size(&self) -> Option<u64> {
        let local = self.options.max_message_size.filter(|size| *size > 0);
        let remote = self
            .inner
            .lock()
            .remote_attach
            .as_ref()
            .and_then(|remote| remote.max_message_size)
            .filter(|size| *size > 0);
        match (local, remote) {
            (Some(local), Some(remote)) => Some(local.min(remote)),
            (local, remote) => local.or(remote),
        }
    }

    pub(crate) fn error(&self) -> Option<AmqpError> {
        self.inner.lock().error.clone()
    }

    pub(crate) fn properties(&self) -> Option<Fields> {
        self.inner
            .lock()
            .remote_attach
            .as_ref()
            .and_then(|remote| remote.properties.clone())
    }

    /// Sends `attach` without waiting for the peer
    pub(crate) fn issue_attach(&self) -> Result<(), AttachError> {
        let _lock = self.session.connection().lock();
        let mut inner = self.inner.lock();
        if inner.state != LinkState::Detached {
            return Err(AttachError::IllegalState(inner.state));
        }
        inner.state = LinkState::Attaching;
        inner.attach_pending = true;
        drop(inner);

        self.attach_queue.clear();
        self.transport().and_then(|t| t.attach()).map_err(|err| {
            let mut inner = self.inner.lock();
            inner.state = LinkState::Error;
            inner.attach_pending = false;
            AttachError::Transport(err)
        })
    }

    pub(crate) fn wait_for_attach(&self, ctx: &Context) -> Result<(), AttachError> {
        match self.attach_queue.wait_for_result(ctx) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(AttachError::Remote(error)),
            Err(err) => {
                warn!(name = %self.name, ?err, "Attach abandoned");
                let mut inner = self.inner.lock();
                inner.attach_pending = false;
                inner.state = LinkState::Error;
                Err(AttachError::Wait(err))
            }
        }
    }

    #[instrument(skip_all, fields(name = %self.name))]
    pub(crate) fn attach(&self, ctx: &Context) -> Result<(), AttachError> {
        self.issue_attach()?;
        self.wait_for_attach(ctx)?;
        debug!("Link attached");
        Ok(())
    }

    #[instrument(skip_all, fields(name = %self.name, closed = closed))]
    pub(crate) fn detach(
        &self,
        closed: bool,
        error: Option<AmqpError>,
        ctx: &Context,
    ) -> Result<(), DetachError> {
        let send_result = {
            let _lock = self.session.connection().lock();
            let mut inner = self.inner.lock();
            if !matches!(inner.state, LinkState::Attaching | LinkState::Attached) {
                return Err(DetachError::IllegalState(inner.state));
            }
            inner.state = LinkState::DetachSent;
            inner.detach_pending = true;
            if std::mem::take(&mut inner.attach_pending) {
                self.attach_queue.complete_operation(Err(AmqpError::detach_forced(
                    "The link was detached while attaching",
                )));
            }
            drop(inner);

            self.detach_queue.clear();
            self.transport().and_then(|t| t.detach(closed, error))
        };

        let final_state = match closed {
            true => LinkState::Closed,
            false => LinkState::Detached,
        };
        if let Err(err) = send_result {
            self.mark_detached(final_state);
            return Err(DetachError::Transport(err));
        }

        let result = self.detach_queue.wait_for_result(ctx);
        self.mark_detached(final_state);
        match result {
            Ok(None) => {
                debug!("Link detached");
                Ok(())
            }
            Ok(Some(error)) => Err(DetachError::Remote(error)),
            Err(err) => {
                warn!(?err, "Detach abandoned, local resources released");
                Err(DetachError::Wait(err))
            }
        }
    }

    fn mark_detached(&self, state: LinkState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.detach_pending = false;
    }

    pub(crate) fn transfer(
        &self,
        delivery_id: DeliveryNumber,
        message: AmqpMessage,
        settled: bool,
    ) -> Result<(), TransportError> {
        let _lock = self.session.connection().lock();
        self.transport()?.transfer(delivery_id, message, settled)
    }

    pub(crate) fn flow(&self, link_credit: u32) -> Result<(), TransportError> {
        let _lock = self.session.connection().lock();
        self.transport()?.flow(link_credit)
    }

    pub(crate) fn disposition(
        &self,
        delivery_id: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError> {
        let _lock = self.session.connection().lock();
        self.transport()?.disposition(delivery_id, outcome)
    }

    /// Fails the link after its session ended or its connection was lost
    pub(crate) fn on_session_lost(&self, error: &AmqpError) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                LinkState::Attaching | LinkState::Attached | LinkState::DetachSent => {}
                _ => return,
            }
            inner.state = LinkState::Error;
            inner.error = Some(error.clone());
            if std::mem::take(&mut inner.attach_pending) {
                self.attach_queue.complete_operation(Err(error.clone()));
            }
            if std::mem::take(&mut inner.detach_pending) {
                self.detach_queue.complete_operation(Some(error.clone()));
            }
        }
        debug!(name = %self.name, %error, "Link invalidated");
        if let Some(owner) = self.owner.upgrade() {
            owner.on_link_detached(error);
        }
    }
}

impl LinkEvents for LinkImpl {
    fn on_state_changed(&self, new_state: LinkState, old_state: LinkState) {
        engine_event!(
            self.trace_enabled(),
            name = %self.name,
            ?new_state,
            ?old_state,
            "Link state changed"
        );

        {
            let mut inner = self.inner.lock();
            match inner.state {
                LinkState::Closed | LinkState::Error => return,
                LinkState::Detached if new_state != LinkState::Attaching => return,
                _ => {}
            }
            if inner.detach_pending && new_state == LinkState::Attached {
                return;
            }
            inner.state = new_state;
            if new_state == LinkState::Attached && std::mem::take(&mut inner.attach_pending) {
                self.attach_queue.complete_operation(Ok(()));
            }
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.on_link_state_changed(new_state, old_state);
        }
    }

    fn on_remote_attach(&self, remote: RemoteAttach) {
        engine_event!(self.trace_enabled(), name = %self.name, attach = ?remote, "Remote attach");
        self.inner.lock().remote_attach = Some(remote);
    }

    fn on_remote_detach(&self, closed: bool, error: Option<AmqpError>) {
        engine_event!(self.trace_enabled(), name = %self.name, closed, ?error, "Remote detach");

        let error = {
            let mut inner = self.inner.lock();
            if std::mem::take(&mut inner.detach_pending) {
                self.detach_queue.complete_operation(error);
                return;
            }
            if !matches!(inner.state, LinkState::Attaching | LinkState::Attached) {
                return;
            }

            let error = error.unwrap_or_else(|| {
                AmqpError::detach_forced("The link was detached by the peer")
            });
            inner.state = LinkState::Error;
            inner.error = Some(error.clone());
            if std::mem::take(&mut inner.attach_pending) {
                self.attach_queue.complete_operation(Err(error.clone()));
            }
            error
        };

        warn!(name = %self.name, %error, "Link detached by the peer");
        if let Some(owner) = self.owner.upgrade() {
            owner.on_link_detached(&error);
        }
    }

    fn on_transfer(&self, delivery_id: DeliveryNumber, message: AmqpMessage) {
        engine_event!(self.trace_enabled(), name = %self.name, delivery_id, "Transfer");
        if let Some(owner) = self.owner.upgrade() {
            owner.on_message_received(delivery_id, message);
        }
    }

    fn on_disposition(&self, delivery_id: DeliveryNumber, outcome: DeliveryOutcome) {
        engine_event!(
            self.trace_enabled(),
            name = %self.name,
            delivery_id,
            ?outcome,
            "Disposition"
        );
        if let Some(owner) = self.owner.upgrade() {
            owner.on_delivery_settled(delivery_id, outcome);
        }
    }
}

impl Drop for LinkImpl {
    fn drop(&mut self) {
        if let Some(key) = self.key.get() {
            self.session.deallocate_link(*key);
        }
        let state = self.inner.get_mut().state;
        if matches!(state, LinkState::Attaching | LinkState::Attached) {
            if let Some(transport) = self.transport.get() {
                let _ = transport.detach(true, None);
            }
        }
    }
}

/// An AMQP link driven directly, without the sender or receiver state machine
///
/// Transfers and dispositions are not surfaced through a [`Link`]; use
/// [`MessageSender`](crate::MessageSender) or [`MessageReceiver`](crate::MessageReceiver)
/// to move messages.
#[derive(Debug, Clone)]
pub struct Link {
    inner: Arc<LinkImpl>,
}

impl Link {
    pub(crate) fn create(
        session: &Arc<SessionImpl>,
        role: Role,
        source: Option<MessageSource>,
        target: Option<MessageTarget>,
        options: LinkOptions,
    ) -> Result<Self, AllocLinkError> {
        let owner: Weak<dyn LinkOwner> = Weak::<NoOwner>::new();
        let inner = session.create_link(role, source, target, options, owner)?;
        Ok(Self { inner })
    }

    /// Attaches the link, blocking until the peer answers or `ctx` fires
    pub fn attach(&self, ctx: &Context) -> Result<(), AttachError> {
        self.inner.attach(ctx)
    }

    /// Detaches and closes the link
    pub fn detach(&self, ctx: &Context) -> Result<(), DetachError> {
        self.inner.detach(true, None, ctx)
    }

    /// Detaches and closes the link, attaching an error condition to the `detach` frame
    pub fn detach_with_error(
        &self,
        condition: impl Into<ErrorCondition>,
        description: impl Into<Option<String>>,
        ctx: &Context,
    ) -> Result<(), DetachError> {
        self.inner
            .detach(true, Some(AmqpError::new(condition, description)), ctx)
    }

    /// The session the link belongs to
    pub fn session(&self) -> Session {
        Session::from(self.inner.session().clone())
    }

    /// Link name
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Role of the local peer
    pub fn role(&self) -> &Role {
        &self.inner.role
    }

    /// Source terminus
    pub fn source(&self) -> Option<&MessageSource> {
        self.inner.source.as_ref()
    }

    /// Target terminus
    pub fn target(&self) -> Option<&MessageTarget> {
        self.inner.target.as_ref()
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    /// Negotiated max message size, `None` for no limit
    pub fn max_message_size(&self) -> Option<u64> {
        self.inner.max_message_size()
    }

    /// The error that detached the link out of band
    pub fn error(&self) -> Option<AmqpError> {
        self.inner.error()
    }

    /// Link properties sent by the peer
    pub fn properties(&self) -> Option<Fields> {
        self.inner.properties()
    }
}
