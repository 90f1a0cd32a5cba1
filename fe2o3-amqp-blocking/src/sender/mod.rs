//! Message sender built on a sending link

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use fe2o3_amqp_types::{
    definitions::{DeliveryNumber, Fields, Role, SenderSettleMode},
    messaging::{Accepted, Outcome},
};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    context::Context,
    error::AmqpError,
    link::{LinkImpl, LinkOptions, LinkOwner, LinkState},
    message::{AmqpMessage, DeliveryOutcome},
    queue::AsyncOperationQueue,
    session::{Session, SessionImpl},
    terminus::{MessageSource, MessageTarget, TerminusAddress},
};

mod error;

pub use error::*;

/// Sender states
///
/// `Error` is reachable from every state but `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSenderState {
    /// The sender was created but not opened
    Idle,

    /// The link is being attached
    Opening,

    /// Messages can be sent
    Open,

    /// The link is being detached
    Closing,

    /// The sender was closed
    Closed,

    /// The link failed or was detached out of band
    Error,
}

/// Sender notifications
///
/// Every method runs on the thread that caused the change, which is often the
/// engine execution context, and must not block.
pub trait MessageSenderEvents: Send + Sync {
    /// The sender state changed
    fn on_state_changed(&self, _new_state: MessageSenderState, _old_state: MessageSenderState) {}

    /// The link was detached out of band
    fn on_detached(&self, _error: &AmqpError) {}
}

/// Options of a sender
///
/// | Option | Default |
/// |--------|---------|
/// | `name` | `sender-<uuid>` |
/// | `source_address` | the link name |
/// | `settle_mode` | [`SenderSettleMode::Unsettled`] |
/// | `max_message_size` | `None`, no local limit |
/// | `authenticate` | `true`, effective only when the connection has a credential |
/// | `properties` | `None` |
#[derive(Debug, Clone)]
pub struct MessageSenderOptions {
    /// Link name
    pub name: Option<String>,

    /// Address of the source terminus
    pub source_address: Option<String>,

    /// Settlement mode. A [`SenderSettleMode::Settled`] sender completes a send as
    /// soon as the message is handed to the engine
    pub settle_mode: SenderSettleMode,

    /// Largest message the local peer accepts
    pub max_message_size: Option<u64>,

    /// Authenticates the target address before the link is attached
    pub authenticate: bool,

    /// Link properties
    pub properties: Option<Fields>,
}

impl Default for MessageSenderOptions {
    fn default() -> Self {
        Self {
            name: None,
            source_address: None,
            settle_mode: SenderSettleMode::Unsettled,
            max_message_size: None,
            authenticate: true,
            properties: None,
        }
    }
}

impl MessageSenderOptions {
    /// Link name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Settlement mode
    pub fn settle_mode(mut self, settle_mode: SenderSettleMode) -> Self {
        self.settle_mode = settle_mode;
        self
    }

    /// Largest message the local peer accepts
    pub fn max_message_size(mut self, max_message_size: u64) -> Self {
        self.max_message_size = Some(max_message_size);
        self
    }

    /// Whether the target address is authenticated on open
    pub fn authenticate(mut self, authenticate: bool) -> Self {
        self.authenticate = authenticate;
        self
    }
}

type SendCallback = Box<dyn FnOnce(Result<DeliveryOutcome, SendError>) + Send + 'static>;

struct Inner {
    state: MessageSenderState,
    error: Option<AmqpError>,
    in_flight: BTreeMap<DeliveryNumber, SendCallback>,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), SendError> {
        match self.state {
            MessageSenderState::Open => Ok(()),
            MessageSenderState::Error => match &self.error {
                Some(error) => Err(SendError::Detached(error.clone())),
                None => Err(SendError::IllegalState(MessageSenderState::Error)),
            },
            state => Err(SendError::IllegalState(state)),
        }
    }
}

pub(crate) struct MessageSenderImpl {
    session: Arc<SessionImpl>,
    name: String,
    target: MessageTarget,
    options: MessageSenderOptions,
    events: Option<Arc<dyn MessageSenderEvents>>,

    link: Mutex<Option<Arc<LinkImpl>>>,
    inner: Mutex<Inner>,
    open_queue: AsyncOperationQueue<Option<AmqpError>>,
}

impl fmt::Debug for MessageSenderImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MessageSenderImpl")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("state", &inner.state)
            .field("in_flight", &inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl MessageSenderImpl {
    fn new(
        session: Arc<SessionImpl>,
        target: MessageTarget,
        options: MessageSenderOptions,
        events: Option<Arc<dyn MessageSenderEvents>>,
    ) -> Arc<Self> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("sender-{}", Uuid::new_v4()));
        Arc::new(Self {
            session,
            name,
            target,
            options,
            events,
            link: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: MessageSenderState::Idle,
                error: None,
                in_flight: BTreeMap::new(),
            }),
            open_queue: AsyncOperationQueue::new(),
        })
    }

    fn state(&self) -> MessageSenderState {
        self.inner.lock().state
    }

    fn notify_state(&self, new_state: MessageSenderState, old_state: MessageSenderState) {
        if new_state == old_state {
            return;
        }
        debug!(name = %self.name, ?new_state, ?old_state, "Sender state changed");
        if let Some(events) = &self.events {
            events.on_state_changed(new_state, old_state);
        }
    }

    fn link(&self) -> Option<Arc<LinkImpl>> {
        self.link.lock().clone()
    }

    #[instrument(skip_all, fields(name = %self.name, target = %self.target.address_str()))]
    fn open(self: &Arc<Self>, blocking: bool, ctx: &Context) -> Result<(), SenderOpenError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != MessageSenderState::Idle {
                return Err(SenderOpenError::IllegalState(inner.state));
            }
            inner.state = MessageSenderState::Opening;
        }
        self.notify_state(MessageSenderState::Opening, MessageSenderState::Idle);
        self.open_queue.clear();

        if let Err(err) = self.create_and_attach(ctx) {
            warn!(?err, "Failed to open sender");
            self.link.lock().take();
            let old_state =
                std::mem::replace(&mut self.inner.lock().state, MessageSenderState::Error);
            self.notify_state(MessageSenderState::Error, old_state);
            return Err(err);
        }

        match blocking {
            true => self.wait_for_open(ctx),
            false => Ok(()),
        }
    }

    fn create_and_attach(self: &Arc<Self>, ctx: &Context) -> Result<(), SenderOpenError> {
        let connection = self.session.connection();
        if self.options.authenticate && connection.has_credential() {
            let audience = connection.audience_for(self.target.address_str());
            let session = Session::from(self.session.clone());
            connection.authenticate_audience(&session, &audience, ctx)?;
        }

        let weak = Arc::downgrade(self);
        let owner: Weak<dyn LinkOwner> = weak;
        let source = self
            .options
            .source_address
            .clone()
            .unwrap_or_else(|| self.name.clone());
        let options = LinkOptions {
            name: Some(self.name.clone()),
            snd_settle_mode: self.options.settle_mode.clone(),
            rcv_settle_mode: Default::default(),
            max_message_size: self.options.max_message_size,
            properties: self.options.properties.clone(),
        };
        let link = self.session.create_link(
            Role::Sender,
            Some(MessageSource::from(source)),
            Some(self.target.clone()),
            options,
            owner,
        )?;
        *self.link.lock() = Some(link.clone());
        link.issue_attach()?;
        Ok(())
    }

    fn wait_for_open(&self, ctx: &Context) -> Result<(), SenderOpenError> {
        // The result may already have been taken by `poll_open`
        {
            let inner = self.inner.lock();
            match (inner.state, &inner.error) {
                (MessageSenderState::Open, _) => return Ok(()),
                (MessageSenderState::Error, Some(error)) => {
                    return Err(SenderOpenError::Remote(error.clone()))
                }
                (MessageSenderState::Idle, _) | (MessageSenderState::Closed, _) => {
                    return Err(SenderOpenError::IllegalState(inner.state))
                }
                _ => {}
            }
        }

        match self.open_queue.wait_for_result(ctx) {
            Ok(None) => Ok(()),
            Ok(Some(error)) => Err(SenderOpenError::Remote(error)),
            Err(err) => {
                warn!(name = %self.name, ?err, "Open abandoned");
                let old_state = {
                    let mut inner = self.inner.lock();
                    match inner.state {
                        MessageSenderState::Opening => {
                            std::mem::replace(&mut inner.state, MessageSenderState::Error)
                        }
                        state => state,
                    }
                };
                self.notify_state(self.state(), old_state);
                Err(SenderOpenError::Wait(err))
            }
        }
    }

    fn poll_open(&self) -> Option<Result<(), SenderOpenError>> {
        if let Some(result) = self.open_queue.try_pop() {
            return Some(match result {
                None => Ok(()),
                Some(error) => Err(SenderOpenError::Remote(error)),
            });
        }
        let inner = self.inner.lock();
        match inner.state {
            MessageSenderState::Open => Some(Ok(())),
            MessageSenderState::Error => inner
                .error
                .clone()
                .map(|error| Err(SenderOpenError::Remote(error))),
            _ => None,
        }
    }

    fn queue_send(&self, message: AmqpMessage, on_complete: SendCallback) {
        let link = match self.link() {
            Some(link) => link,
            None => return on_complete(Err(SendError::IllegalState(self.state()))),
        };
        if let Some(max) = link.max_message_size() {
            let size = match message.encoded_size() {
                Ok(size) => size,
                Err(err) => return on_complete(Err(SendError::Encode(err))),
            };
            if size > max {
                return on_complete(Err(SendError::MessageSizeExceeded { size, max }));
            }
        }

        let settled = matches!(self.options.settle_mode, SenderSettleMode::Settled);
        let (delivery_id, on_complete) = {
            let mut inner = self.inner.lock();
            if let Err(err) = inner.ensure_open() {
                drop(inner);
                return on_complete(Err(err));
            }
            let delivery_id = self.session.next_delivery_id();
            match settled {
                true => (delivery_id, Some(on_complete)),
                false => {
                    inner.in_flight.insert(delivery_id, on_complete);
                    (delivery_id, None)
                }
            }
        };

        trace!(name = %self.name, delivery_id, settled, "Sending message");
        match link.transfer(delivery_id, message, settled) {
            Ok(()) => {
                if let Some(on_complete) = on_complete {
                    on_complete(Ok(Outcome::Accepted(Accepted {})))
                }
            }
            Err(err) => {
                let on_complete =
                    on_complete.or_else(|| self.inner.lock().in_flight.remove(&delivery_id));
                if let Some(on_complete) = on_complete {
                    on_complete(Err(SendError::Transport(err)))
                }
            }
        }
    }

    fn send(&self, message: AmqpMessage, ctx: &Context) -> Result<DeliveryOutcome, SendError> {
        let queue: Arc<AsyncOperationQueue<Result<DeliveryOutcome, SendError>>> =
            Arc::new(AsyncOperationQueue::new());
        let producer = queue.clone();
        self.queue_send(
            message,
            Box::new(move |result: Result<DeliveryOutcome, SendError>| {
                producer.complete_operation(result)
            }),
        );
        queue.wait_for_result(ctx)?
    }

    #[instrument(skip_all, fields(name = %self.name))]
    fn close(&self, ctx: &Context) -> Result<(), SenderCloseError> {
        let old_state = {
            let mut inner = self.inner.lock();
            match inner.state {
                MessageSenderState::Idle
                | MessageSenderState::Closing
                | MessageSenderState::Closed => {
                    return Err(SenderCloseError::IllegalState(inner.state))
                }
                state => {
                    inner.state = MessageSenderState::Closing;
                    state
                }
            }
        };
        self.notify_state(MessageSenderState::Closing, old_state);

        let closed = AmqpError::detach_forced("The sender was closed");
        if old_state == MessageSenderState::Opening {
            self.open_queue.complete_operation(Some(closed.clone()));
        }

        let link = self.link.lock().take();
        let result = match link {
            Some(link) if old_state != MessageSenderState::Error => link
                .detach(true, None, ctx)
                .map_err(SenderCloseError::from),
            _ => Ok(()),
        };

        let pending = {
            let mut inner = self.inner.lock();
            inner.state = MessageSenderState::Closed;
            std::mem::take(&mut inner.in_flight)
        };
        for (_, on_complete) in pending {
            on_complete(Err(SendError::Detached(closed.clone())));
        }
        self.notify_state(MessageSenderState::Closed, MessageSenderState::Closing);
        result
    }
}

impl LinkOwner for MessageSenderImpl {
    fn on_link_state_changed(&self, new_state: LinkState, _old_state: LinkState) {
        if new_state != LinkState::Attached {
            return;
        }
        let opened = {
            let mut inner = self.inner.lock();
            match inner.state {
                MessageSenderState::Opening => {
                    inner.state = MessageSenderState::Open;
                    true
                }
                _ => false,
            }
        };
        if opened {
            self.open_queue.complete_operation(None);
            self.notify_state(MessageSenderState::Open, MessageSenderState::Opening);
        }
    }

    fn on_link_detached(&self, error: &AmqpError) {
        let (old_state, pending) = {
            let mut inner = self.inner.lock();
            let old_state = inner.state;
            if !matches!(
                old_state,
                MessageSenderState::Opening | MessageSenderState::Open
            ) {
                return;
            }
            inner.state = MessageSenderState::Error;
            inner.error = Some(error.clone());
            (old_state, std::mem::take(&mut inner.in_flight))
        };

        warn!(name = %self.name, %error, pending = pending.len(), "Sender link detached");
        if old_state == MessageSenderState::Opening {
            self.open_queue.complete_operation(Some(error.clone()));
        }
        for (_, on_complete) in pending {
            on_complete(Err(SendError::Detached(error.clone())));
        }
        self.notify_state(MessageSenderState::Error, old_state);
        if let Some(events) = &self.events {
            events.on_detached(error);
        }
    }

    fn on_delivery_settled(&self, delivery_id: DeliveryNumber, outcome: DeliveryOutcome) {
        let on_complete = self.inner.lock().in_flight.remove(&delivery_id);
        match on_complete {
            Some(on_complete) => on_complete(Ok(outcome)),
            None => trace!(name = %self.name, delivery_id, "Settlement for unknown delivery"),
        }
    }
}

/// Sends messages to a node
///
/// A sender is created with [`Session::create_message_sender`] and must be opened
/// before it can send. Cloning yields another handle to the same sender.
///
/// # Example
///
/// ```rust,ignore
/// let sender = session.create_message_sender("q1", Default::default(), None);
/// sender.open(true, &ctx)?;
/// let outcome = sender.send(AmqpMessage::with_value("hello"), &ctx)?;
/// assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));
/// sender.close(&ctx)?;
/// ```
#[derive(Debug, Clone)]
pub struct MessageSender {
    inner: Arc<MessageSenderImpl>,
}

impl MessageSender {
    pub(crate) fn new(
        session: Arc<SessionImpl>,
        target: MessageTarget,
        options: MessageSenderOptions,
        events: Option<Arc<dyn MessageSenderEvents>>,
    ) -> Self {
        Self {
            inner: MessageSenderImpl::new(session, target, options, events),
        }
    }

    /// Creates and attaches the link
    ///
    /// With `blocking` set, waits until the link is attached or `ctx` fires.
    /// Otherwise returns once `attach` is sent, and the outcome is observed with
    /// [`poll_open`](MessageSender::poll_open) or
    /// [`wait_for_open`](MessageSender::wait_for_open).
    pub fn open(&self, blocking: bool, ctx: &Context) -> Result<(), SenderOpenError> {
        self.inner.open(blocking, ctx)
    }

    /// Waits for a non-blocking open to complete
    pub fn wait_for_open(&self, ctx: &Context) -> Result<(), SenderOpenError> {
        self.inner.wait_for_open(ctx)
    }

    /// Outcome of the open, `None` while it is pending
    pub fn poll_open(&self) -> Option<Result<(), SenderOpenError>> {
        self.inner.poll_open()
    }

    /// Sends a message and blocks until the peer settles it or `ctx` fires
    ///
    /// A send made on a sender whose link was detached out of band fails with
    /// [`SendError::Detached`] carrying the detach error.
    pub fn send(&self, message: AmqpMessage, ctx: &Context) -> Result<DeliveryOutcome, SendError> {
        self.inner.send(message, ctx)
    }

    /// Sends a message and calls `on_complete` with the outcome
    ///
    /// `on_complete` runs exactly once, either on the calling thread or on the
    /// engine execution context, and must not block.
    pub fn queue_send(
        &self,
        message: AmqpMessage,
        on_complete: impl FnOnce(Result<DeliveryOutcome, SendError>) + Send + 'static,
    ) {
        self.inner.queue_send(message, Box::new(on_complete))
    }

    /// Detaches and closes the link. Sends still in flight fail with
    /// [`SendError::Detached`]
    pub fn close(&self, ctx: &Context) -> Result<(), SenderCloseError> {
        self.inner.close(ctx)
    }

    /// Current state
    pub fn state(&self) -> MessageSenderState {
        self.inner.state()
    }

    /// Link name
    pub fn link_name(&self) -> &str {
        &self.inner.name
    }

    /// Target terminus
    pub fn target(&self) -> &MessageTarget {
        &self.inner.target
    }

    /// Negotiated max message size once open, the local limit otherwise
    pub fn max_message_size(&self) -> Option<u64> {
        match self.inner.link() {
            Some(link) => link.max_message_size(),
            None => self.inner.options.max_message_size,
        }
    }

    /// The error that moved the sender to [`MessageSenderState::Error`]
    pub fn error(&self) -> Option<AmqpError> {
        self.inner.inner.lock().error.clone()
    }
}
