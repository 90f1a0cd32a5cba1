//! The seam between the state machine and the protocol engine
//!
//! An [`Engine`] owns frame encoding, transport I/O and timers. The state machine
//! drives it through the `*Transport` traits and receives its callbacks through the
//! `*Events` traits, which the engine holds as [`Weak`] references so that it never
//! keeps an endpoint alive.
//!
//! # Callback contract
//!
//! All callbacks run on the engine execution context (see
//! [`GlobalState`](crate::global_state::GlobalState)) and are delivered in order per
//! connection. Callbacks must return promptly and must never block on an
//! [`AsyncOperationQueue`](crate::queue::AsyncOperationQueue).
//!
//! | Request | Callbacks |
//! |---------|-----------|
//! | [`ConnectionTransport::open`] | `on_remote_open`, then `on_state_changed(Open, Opening)`, or `on_io_error` and `on_state_changed(Error, _)` |
//! | [`ConnectionTransport::close`] | `on_state_changed(CloseSent, _)`, `on_remote_close`, then `on_state_changed(Closed, _)` |
//! | [`SessionTransport::begin`] | `on_remote_begin`, then `on_state_changed(Begun, BeginSent)` |
//! | [`SessionTransport::end`] | `on_state_changed(EndSent, _)`, `on_remote_end`, then `on_state_changed(Ended, _)` |
//! | [`LinkTransport::attach`] | `on_remote_attach`, then `on_state_changed(Attached, Attaching)`, or `on_remote_detach` with an error |
//! | [`LinkTransport::detach`] | `on_state_changed(DetachSent, _)`, `on_remote_detach`, then `on_state_changed(Detached or Closed, _)` |
//! | [`LinkTransport::transfer`] | `on_disposition` once the peer settles an unsettled delivery |
//! | [`CbsTransport::open`] | `on_cbs_opened` |
//! | [`CbsTransport::put_token`] | `on_token_put` |
//! | [`CbsTransport::close`] | `on_cbs_closed` |
//!
//! [`fe2o3::Fe2o3Engine`] runs the protocol over the network with `fe2o3-amqp`.

use std::{io, sync::Weak, time::Duration};

use fe2o3_amqp_cbs::token::CbsToken;
use fe2o3_amqp_types::definitions::{
    DeliveryNumber, Fields, ReceiverSettleMode, Role, SenderSettleMode,
};

use crate::{
    connection::ConnectionState,
    error::AmqpError,
    link::LinkState,
    message::{AmqpMessage, DeliveryOutcome},
    session::SessionState,
    terminus::{MessageSource, MessageTarget},
};

pub mod fe2o3;

#[cfg(any(test, feature = "test-broker"))]
pub mod local;

/// Error reported by an engine transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying I/O failure
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The endpoint is not in a state that allows the request
    #[error("Illegal transport state")]
    IllegalState,

    /// The endpoint has already been closed
    #[error("The transport has been closed")]
    Closed,

    /// The peer answered with an AMQP error
    #[error("AMQP error {0}")]
    Amqp(AmqpError),

    /// The engine failed without an AMQP error to report
    #[error("Engine error: {0}")]
    Engine(String),
}

impl TransportError {
    /// AMQP error equivalent to this transport error
    pub fn to_amqp_error(&self) -> AmqpError {
        use fe2o3_amqp_types::definitions::{AmqpError as Condition, ConnectionError};

        match self {
            TransportError::Io(err) => {
                AmqpError::new(ConnectionError::ConnectionForced, Some(err.to_string()))
            }
            TransportError::IllegalState => AmqpError::new(Condition::IllegalState, None),
            TransportError::Closed => AmqpError::new(
                Condition::IllegalState,
                Some("The transport has been closed".to_string()),
            ),
            TransportError::Amqp(err) => err.clone(),
            TransportError::Engine(description) => {
                AmqpError::new(Condition::InternalError, Some(description.clone()))
            }
        }
    }
}

/// Error of a put-token request
#[derive(Debug, thiserror::Error)]
pub enum PutTokenError {
    /// The CBS node refused the token
    #[error("Status {code}: {description:?}")]
    Status {
        /// Status code of the response
        code: i32,

        /// Status description of the response
        description: Option<String>,
    },

    /// The request could not be completed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Parameters of the `open` performative sent by the local peer
#[derive(Debug, Clone)]
pub struct OpenParams {
    /// Container id of the local peer
    pub container_id: String,

    /// Name of the host the connection targets
    pub hostname: String,

    /// Largest frame the local peer accepts
    pub max_frame_size: u32,

    /// Highest channel number the local peer accepts
    pub channel_max: u16,

    /// Idle timeout of the local peer
    pub idle_timeout: Option<Duration>,

    /// Connection properties
    pub properties: Option<Fields>,
}

/// Fields of the `open` performative received from the peer
#[derive(Debug, Clone)]
pub struct RemoteOpen {
    /// Container id of the remote peer
    pub container_id: String,

    /// Largest frame the remote peer accepts
    pub max_frame_size: u32,

    /// Highest channel number the remote peer accepts
    pub channel_max: u16,

    /// Idle timeout of the remote peer
    pub idle_timeout: Option<Duration>,

    /// Connection properties of the remote peer
    pub properties: Option<Fields>,
}

/// Parameters of the `begin` performative sent by the local peer
#[derive(Debug, Clone)]
pub struct BeginParams {
    /// Incoming window
    pub incoming_window: u32,

    /// Outgoing window
    pub outgoing_window: u32,

    /// Highest link handle
    pub handle_max: u32,

    /// Session properties
    pub properties: Option<Fields>,
}

/// Fields of the `begin` performative received from the peer
#[derive(Debug, Clone)]
pub struct RemoteBegin {
    /// Incoming window of the remote peer
    pub incoming_window: u32,

    /// Outgoing window of the remote peer
    pub outgoing_window: u32,

    /// Highest link handle of the remote peer
    pub handle_max: u32,

    /// Session properties of the remote peer
    pub properties: Option<Fields>,
}

/// Parameters of the `attach` performative sent by the local peer
#[derive(Debug, Clone)]
pub struct AttachParams {
    /// Link name
    pub name: String,

    /// Role of the local peer
    pub role: Role,

    /// Source terminus
    pub source: Option<MessageSource>,

    /// Target terminus
    pub target: Option<MessageTarget>,

    /// Settlement policy of the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Settlement policy of the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    /// Largest message the local peer accepts, `None` for no limit
    pub max_message_size: Option<u64>,

    /// Link properties
    pub properties: Option<Fields>,
}

/// Fields of the `attach` performative received from the peer
#[derive(Debug, Clone, Default)]
pub struct RemoteAttach {
    /// Largest message the remote peer accepts, `None` for no limit
    pub max_message_size: Option<u64>,

    /// Link properties of the remote peer
    pub properties: Option<Fields>,
}

/// Creates connections
pub trait Engine: Send + Sync + 'static {
    /// Creates the transport of a connection to `host:port`
    ///
    /// No I/O happens until [`ConnectionTransport::open`] is called.
    fn create_connection(
        &self,
        host: &str,
        port: u16,
        params: OpenParams,
        events: Weak<dyn ConnectionEvents>,
    ) -> Result<Box<dyn ConnectionTransport>, TransportError>;
}

/// Engine side of a connection
pub trait ConnectionTransport: Send + Sync {
    /// Starts the handshake
    fn open(&self) -> Result<(), TransportError>;

    /// Sends `close`, optionally carrying an error
    fn close(&self, error: Option<AmqpError>) -> Result<(), TransportError>;

    /// Creates the transport of a new session. No frame is sent until
    /// [`SessionTransport::begin`] is called.
    fn create_session(
        &self,
        params: BeginParams,
        events: Weak<dyn SessionEvents>,
    ) -> Result<Box<dyn SessionTransport>, TransportError>;
}

/// Engine side of a session
pub trait SessionTransport: Send + Sync {
    /// Sends `begin`
    fn begin(&self) -> Result<(), TransportError>;

    /// Sends `end`, optionally carrying an error
    fn end(&self, error: Option<AmqpError>) -> Result<(), TransportError>;

    /// Creates the transport of a new link. No frame is sent until
    /// [`LinkTransport::attach`] is called.
    fn create_link(
        &self,
        params: AttachParams,
        events: Weak<dyn LinkEvents>,
    ) -> Result<Box<dyn LinkTransport>, TransportError>;

    /// Creates a claims-based security client on this session. Nothing is attached
    /// until [`CbsTransport::open`] is called.
    fn create_cbs(
        &self,
        events: Weak<dyn CbsEvents>,
    ) -> Result<Box<dyn CbsTransport>, TransportError>;
}

/// Engine side of a claims-based security client
pub trait CbsTransport: Send + Sync {
    /// Attaches the request and response links to the `$cbs` node
    fn open(&self) -> Result<(), TransportError>;

    /// Puts `token` for the audience `name`
    fn put_token(&self, name: String, token: CbsToken<'static>) -> Result<(), TransportError>;

    /// Detaches both links
    fn close(&self) -> Result<(), TransportError>;
}

/// Engine side of a link
pub trait LinkTransport: Send + Sync {
    /// Sends `attach`
    fn attach(&self) -> Result<(), TransportError>;

    /// Sends `detach`, optionally closing the link and carrying an error
    fn detach(&self, closed: bool, error: Option<AmqpError>) -> Result<(), TransportError>;

    /// Sends `transfer`
    fn transfer(
        &self,
        delivery_id: DeliveryNumber,
        message: AmqpMessage,
        settled: bool,
    ) -> Result<(), TransportError>;

    /// Sends `flow`, setting the link credit of a receiving link
    fn flow(&self, link_credit: u32) -> Result<(), TransportError>;

    /// Sends `disposition` for a delivery received on this link
    fn disposition(
        &self,
        delivery_id: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError>;
}

/// A session begun by the peer, waiting to be accepted or rejected locally
pub trait IncomingSession: Send {
    /// The `begin` received from the peer
    fn remote_begin(&self) -> &RemoteBegin;

    /// Answers the peer's `begin` and creates the session transport
    fn accept(
        self: Box<Self>,
        params: BeginParams,
        events: Weak<dyn SessionEvents>,
    ) -> Result<Box<dyn SessionTransport>, TransportError>;

    /// Refuses the session
    fn reject(self: Box<Self>, error: Option<AmqpError>);
}

/// Connection callbacks
pub trait ConnectionEvents: Send + Sync {
    /// The connection state changed
    fn on_state_changed(&self, new_state: ConnectionState, old_state: ConnectionState);

    /// The peer sent `open`
    fn on_remote_open(&self, remote: RemoteOpen);

    /// The peer sent `close`
    fn on_remote_close(&self, error: Option<AmqpError>);

    /// The transport failed
    fn on_io_error(&self, error: TransportError);

    /// The peer began a new session
    fn on_new_session(&self, session: Box<dyn IncomingSession>);
}

/// Session callbacks
pub trait SessionEvents: Send + Sync {
    /// The session state changed
    fn on_state_changed(&self, new_state: SessionState, old_state: SessionState);

    /// The peer sent `begin`
    fn on_remote_begin(&self, remote: RemoteBegin);

    /// The peer sent `end`
    fn on_remote_end(&self, error: Option<AmqpError>);
}

/// Link callbacks
pub trait LinkEvents: Send + Sync {
    /// The link state changed
    fn on_state_changed(&self, new_state: LinkState, old_state: LinkState);

    /// The peer sent `attach`
    fn on_remote_attach(&self, remote: RemoteAttach);

    /// The peer sent `detach`
    fn on_remote_detach(&self, closed: bool, error: Option<AmqpError>);

    /// A message arrived on a receiving link
    fn on_transfer(&self, delivery_id: DeliveryNumber, message: AmqpMessage);

    /// The peer settled a delivery sent on this link
    fn on_disposition(&self, delivery_id: DeliveryNumber, outcome: DeliveryOutcome);
}

/// Claims-based security callbacks
pub trait CbsEvents: Send + Sync {
    /// Both links attached, or failed to
    fn on_cbs_opened(&self, result: Result<(), TransportError>);

    /// The CBS node answered a put-token request
    fn on_token_put(&self, result: Result<(), PutTokenError>);

    /// Both links detached
    fn on_cbs_closed(&self, result: Result<(), TransportError>);
}
