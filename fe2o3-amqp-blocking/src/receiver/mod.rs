//! Message receiver built on a receiving link

use std::{
    fmt,
    sync::{Arc, Weak},
};

use fe2o3_amqp_types::{
    definitions::{DeliveryNumber, Fields, ReceiverSettleMode, Role},
    messaging::{Accepted, Outcome},
};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    constants::DEFAULT_LINK_CREDIT,
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

/// Receiver states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageReceiverState {
    /// The receiver was created but not opened
    Idle,

    /// The link is being attached
    Opening,

    /// Messages are flowing
    Open,

    /// The link is being detached
    Closing,

    /// The receiver was closed
    Closed,

    /// The link failed or was detached out of band
    Error,
}

/// Receiver notifications
///
/// Every method runs on the engine execution context and must not block.
pub trait MessageReceiverEvents: Send + Sync {
    /// The receiver state changed
    fn on_state_changed(
        &self,
        _new_state: MessageReceiverState,
        _old_state: MessageReceiverState,
    ) {
    }

    /// The link was detached out of band
    fn on_detached(&self, _error: &AmqpError) {}

    /// A message arrived
    ///
    /// Returning an outcome settles the message with it and keeps it out of
    /// [`MessageReceiver::wait_for_incoming_message`]. Returning `None` queues the
    /// message and accepts it.
    fn on_message_received(&self, _message: &AmqpMessage) -> Option<DeliveryOutcome> {
        None
    }
}

/// Options of a receiver
///
/// | Option | Default |
/// |--------|---------|
/// | `name` | `receiver-<uuid>` |
/// | `target_address` | the link name |
/// | `settle_mode` | [`ReceiverSettleMode::First`] |
/// | `link_credit` | 1 |
/// | `max_message_size` | `None`, no local limit |
/// | `authenticate` | `true`, effective only when the connection has a credential |
/// | `properties` | `None` |
#[derive(Debug, Clone)]
pub struct MessageReceiverOptions {
    /// Link name
    pub name: Option<String>,

    /// Address of the target terminus
    pub target_address: Option<String>,

    /// Settlement mode
    pub settle_mode: ReceiverSettleMode,

    /// Credit issued whenever the previous credit is used up
    pub link_credit: u32,

    /// Largest message the local peer accepts
    pub max_message_size: Option<u64>,

    /// Authenticates the source address before the link is attached
    pub authenticate: bool,

    /// Link properties
    pub properties: Option<Fields>,
}

impl Default for MessageReceiverOptions {
    fn default() -> Self {
        Self {
            name: None,
            target_address: None,
            settle_mode: ReceiverSettleMode::First,
            link_credit: DEFAULT_LINK_CREDIT,
            max_message_size: None,
            authenticate: true,
            properties: None,
        }
    }
}

impl MessageReceiverOptions {
    /// Link name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Address of the target terminus
    pub fn target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = Some(address.into());
        self
    }

    /// Credit issued whenever the previous credit is used up
    pub fn link_credit(mut self, credit: u32) -> Self {
        self.link_credit = credit;
        self
    }

    /// Whether the source address is authenticated on open
    pub fn authenticate(mut self, authenticate: bool) -> Self {
        self.authenticate = authenticate;
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: MessageReceiverState,
    error: Option<AmqpError>,
    credit: u32,
}

pub(crate) struct MessageReceiverImpl {
    session: Arc<SessionImpl>,
    name: String,
    source: MessageSource,
    options: MessageReceiverOptions,
    events: Option<Arc<dyn MessageReceiverEvents>>,

    link: Mutex<Option<Arc<LinkImpl>>>,
    inner: Mutex<Inner>,
    open_queue: AsyncOperationQueue<Option<AmqpError>>,
    message_queue: AsyncOperationQueue<Result<AmqpMessage, AmqpError>>,
}

impl fmt::Debug for MessageReceiverImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiverImpl")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("inner", &*self.inner.lock())
            .field("queued", &self.message_queue.len())
            .finish_non_exhaustive()
    }
}

impl MessageReceiverImpl {
    fn new(
        session: Arc<SessionImpl>,
        source: MessageSource,
        options: MessageReceiverOptions,
        events: Option<Arc<dyn MessageReceiverEvents>>,
    ) -> Arc<Self> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("receiver-{}", Uuid::new_v4()));
        Arc::new(Self {
            session,
            name,
            source,
            options,
            events,
            link: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: MessageReceiverState::Idle,
                error: None,
                credit: 0,
            }),
            open_queue: AsyncOperationQueue::new(),
            message_queue: AsyncOperationQueue::new(),
        })
    }

    fn state(&self) -> MessageReceiverState {
        self.inner.lock().state
    }

    fn notify_state(&self, new_state: MessageReceiverState, old_state: MessageReceiverState) {
        if new_state == old_state {
            return;
        }
        debug!(name = %self.name, ?new_state, ?old_state, "Receiver state changed");
        if let Some(events) = &self.events {
            events.on_state_changed(new_state, old_state);
        }
    }

    fn link(&self) -> Option<Arc<LinkImpl>> {
        self.link.lock().clone()
    }

    #[instrument(skip_all, fields(name = %self.name, source = %self.source.address_str()))]
    fn open(self: &Arc<Self>, blocking: bool, ctx: &Context) -> Result<(), ReceiverOpenError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != MessageReceiverState::Idle {
                return Err(ReceiverOpenError::IllegalState(inner.state));
            }
            inner.state = MessageReceiverState::Opening;
        }
        self.notify_state(MessageReceiverState::Opening, MessageReceiverState::Idle);
        self.open_queue.clear();

        if let Err(err) = self.create_and_attach(ctx) {
            warn!(?err, "Failed to open receiver");
            self.link.lock().take();
            let old_state =
                std::mem::replace(&mut self.inner.lock().state, MessageReceiverState::Error);
            self.notify_state(MessageReceiverState::Error, old_state);
            return Err(err);
        }

        match blocking {
            true => self.wait_for_open(ctx),
            false => Ok(()),
        }
    }

    fn create_and_attach(self: &Arc<Self>, ctx: &Context) -> Result<(), ReceiverOpenError> {
        let connection = self.session.connection();
        if self.options.authenticate && connection.has_credential() {
            let audience = connection.audience_for(self.source.address_str());
            let session = Session::from(self.session.clone());
            connection.authenticate_audience(&session, &audience, ctx)?;
        }

        let weak = Arc::downgrade(self);
        let owner: Weak<dyn LinkOwner> = weak;
        let target = self
            .options
            .target_address
            .clone()
            .unwrap_or_else(|| self.name.clone());
        let options = LinkOptions {
            name: Some(self.name.clone()),
            snd_settle_mode: Default::default(),
            rcv_settle_mode: self.options.settle_mode.clone(),
            max_message_size: self.options.max_message_size,
            properties: self.options.properties.clone(),
        };
        let link = self.session.create_link(
            Role::Receiver,
            Some(self.source.clone()),
            Some(MessageTarget::from(target)),
            options,
            owner,
        )?;
        *self.link.lock() = Some(link.clone());
        link.issue_attach()?;
        Ok(())
    }

    fn wait_for_open(&self, ctx: &Context) -> Result<(), ReceiverOpenError> {
        // A second wait finds the result already consumed
        {
            let inner = self.inner.lock();
            match (inner.state, &inner.error) {
                (MessageReceiverState::Open, _) => return Ok(()),
                (MessageReceiverState::Error, Some(error)) => {
                    return Err(ReceiverOpenError::Remote(error.clone()))
                }
                (MessageReceiverState::Idle, _) | (MessageReceiverState::Closed, _) => {
                    return Err(ReceiverOpenError::IllegalState(inner.state))
                }
                _ => {}
            }
        }

        match self.open_queue.wait_for_result(ctx) {
            Ok(None) => Ok(()),
            Ok(Some(error)) => Err(ReceiverOpenError::Remote(error)),
            Err(err) => {
                warn!(name = %self.name, ?err, "Open abandoned");
                let old_state = {
                    let mut inner = self.inner.lock();
                    match inner.state {
                        MessageReceiverState::Opening => {
                            std::mem::replace(&mut inner.state, MessageReceiverState::Error)
                        }
                        state => state,
                    }
                };
                self.notify_state(self.state(), old_state);
                Err(ReceiverOpenError::Wait(err))
            }
        }
    }

    fn check_receivable(&self) -> Result<(), ReceiveError> {
        let inner = self.inner.lock();
        match inner.state {
            MessageReceiverState::Opening | MessageReceiverState::Open => Ok(()),
            MessageReceiverState::Error => match &inner.error {
                Some(error) => Err(ReceiveError::Detached(error.clone())),
                None => Err(ReceiveError::IllegalState(MessageReceiverState::Error)),
            },
            state => Err(ReceiveError::IllegalState(state)),
        }
    }

    fn wait_for_incoming_message(&self, ctx: &Context) -> Result<AmqpMessage, ReceiveError> {
        if let Some(item) = self.message_queue.try_pop() {
            return item.map_err(ReceiveError::Detached);
        }
        self.check_receivable()?;
        self.message_queue
            .wait_for_result(ctx)?
            .map_err(ReceiveError::Detached)
    }

    fn try_wait_for_incoming_message(&self) -> Result<Option<AmqpMessage>, ReceiveError> {
        match self.message_queue.try_pop() {
            Some(item) => item.map(Some).map_err(ReceiveError::Detached),
            None => self.check_receivable().map(|_| None),
        }
    }

    #[instrument(skip_all, fields(name = %self.name))]
    fn close(&self, ctx: &Context) -> Result<(), ReceiverCloseError> {
        let old_state = {
            let mut inner = self.inner.lock();
            match inner.state {
                MessageReceiverState::Idle
                | MessageReceiverState::Closing
                | MessageReceiverState::Closed => {
                    return Err(ReceiverCloseError::IllegalState(inner.state))
                }
                state => {
                    inner.state = MessageReceiverState::Closing;
                    state
                }
            }
        };
        self.notify_state(MessageReceiverState::Closing, old_state);

        if old_state == MessageReceiverState::Opening {
            self.open_queue.complete_operation(Some(AmqpError::detach_forced(
                "The receiver was closed",
            )));
        }

        let link = self.link.lock().take();
        let result = match link {
            Some(link) if old_state != MessageReceiverState::Error => link
                .detach(true, None, ctx)
                .map_err(ReceiverCloseError::from),
            _ => Ok(()),
        };

        self.inner.lock().state = MessageReceiverState::Closed;
        self.notify_state(MessageReceiverState::Closed, MessageReceiverState::Closing);
        result
    }

    fn issue_credit(&self, link: &LinkImpl) {
        let credit = self.options.link_credit;
        self.inner.lock().credit = credit;
        if let Err(err) = link.flow(credit) {
            warn!(name = %self.name, ?err, "Failed to issue link credit");
        }
    }
}

impl LinkOwner for MessageReceiverImpl {
    fn on_link_state_changed(&self, new_state: LinkState, _old_state: LinkState) {
        if new_state != LinkState::Attached {
            return;
        }
        let opened = {
            let mut inner = self.inner.lock();
            match inner.state {
                MessageReceiverState::Opening => {
                    inner.state = MessageReceiverState::Open;
                    true
                }
                _ => false,
            }
        };
        if opened {
            self.open_queue.complete_operation(None);
            self.notify_state(MessageReceiverState::Open, MessageReceiverState::Opening);
            if let Some(link) = self.link() {
                self.issue_credit(&link);
            }
        }
    }

    fn on_link_detached(&self, error: &AmqpError) {
        let old_state = {
            let mut inner = self.inner.lock();
            let old_state = inner.state;
            if !matches!(
                old_state,
                MessageReceiverState::Opening | MessageReceiverState::Open
            ) {
                return;
            }
            inner.state = MessageReceiverState::Error;
            inner.error = Some(error.clone());
            old_state
        };

        warn!(name = %self.name, %error, "Receiver link detached");
        if old_state == MessageReceiverState::Opening {
            self.open_queue.complete_operation(Some(error.clone()));
        }
        self.message_queue.complete_operation(Err(error.clone()));
        self.notify_state(MessageReceiverState::Error, old_state);
        if let Some(events) = &self.events {
            events.on_detached(error);
        }
    }

    fn on_message_received(&self, delivery_id: DeliveryNumber, message: AmqpMessage) {
        trace!(name = %self.name, delivery_id, "Message received");
        let decided = self
            .events
            .as_ref()
            .and_then(|events| events.on_message_received(&message));
        let outcome = match decided {
            Some(outcome) => outcome,
            None => {
                self.message_queue.complete_operation(Ok(message));
                Outcome::Accepted(Accepted {})
            }
        };

        let link = match self.link() {
            Some(link) => link,
            None => return,
        };
        if let Err(err) = link.disposition(delivery_id, outcome) {
            warn!(name = %self.name, delivery_id, ?err, "Failed to settle delivery");
        }

        let exhausted = {
            let mut inner = self.inner.lock();
            inner.credit = inner.credit.saturating_sub(1);
            inner.credit == 0 && inner.state == MessageReceiverState::Open
        };
        if exhausted {
            self.issue_credit(&link);
        }
    }
}

/// Receives messages from a node
///
/// A receiver is created with [`Session::create_message_receiver`] and must be
/// opened before messages flow. Incoming messages are accepted automatically unless
/// [`MessageReceiverEvents::on_message_received`] decides otherwise.
#[derive(Debug, Clone)]
pub struct MessageReceiver {
    inner: Arc<MessageReceiverImpl>,
}

impl MessageReceiver {
    pub(crate) fn new(
        session: Arc<SessionImpl>,
        source: MessageSource,
        options: MessageReceiverOptions,
        events: Option<Arc<dyn MessageReceiverEvents>>,
    ) -> Self {
        Self {
            inner: MessageReceiverImpl::new(session, source, options, events),
        }
    }

    /// Creates and attaches the link, then issues credit
    ///
    /// With `blocking` set, waits until the link is attached or `ctx` fires.
    pub fn open(&self, blocking: bool, ctx: &Context) -> Result<(), ReceiverOpenError> {
        self.inner.open(blocking, ctx)
    }

    /// Waits for a non-blocking open to complete
    pub fn wait_for_open(&self, ctx: &Context) -> Result<(), ReceiverOpenError> {
        self.inner.wait_for_open(ctx)
    }

    /// Blocks until a message arrives, the link is detached or `ctx` fires
    pub fn wait_for_incoming_message(&self, ctx: &Context) -> Result<AmqpMessage, ReceiveError> {
        self.inner.wait_for_incoming_message(ctx)
    }

    /// Takes a message that already arrived, without blocking
    pub fn try_wait_for_incoming_message(&self) -> Result<Option<AmqpMessage>, ReceiveError> {
        self.inner.try_wait_for_incoming_message()
    }

    /// Detaches and closes the link
    pub fn close(&self, ctx: &Context) -> Result<(), ReceiverCloseError> {
        self.inner.close(ctx)
    }

    /// Current state
    pub fn state(&self) -> MessageReceiverState {
        self.inner.state()
    }

    /// Link name
    pub fn link_name(&self) -> &str {
        &self.inner.name
    }

    /// Source terminus
    pub fn source(&self) -> &MessageSource {
        &self.inner.source
    }

    /// The error that moved the receiver to [`MessageReceiverState::Error`]
    pub fn error(&self) -> Option<AmqpError> {
        self.inner.inner.lock().error.clone()
    }
}
