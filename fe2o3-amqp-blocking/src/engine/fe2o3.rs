//! An engine running the protocol over the network with `fe2o3-amqp`
//!
//! Every connection is driven by a task on the engine execution context. The task
//! owns the [`ConnectionHandle`], and each session, link and CBS client gets a
//! task of its own that owns the matching `fe2o3-amqp` handle. Requests reach
//! those tasks over unbounded channels, so the transport calls never block, and
//! the callbacks of one endpoint are delivered in order by its task.
//!
//! `fe2o3-amqp` does not expose the performatives sent by the peer, so the remote
//! `open`, `begin` and `attach` reported to the state machine echo the values
//! offered locally.

use std::{collections::HashMap, sync::Weak, time::Duration};

use fe2o3_amqp::{
    connection::ConnectionHandle, link::receiver::CreditMode, session::SessionHandle,
    Connection, Delivery, Receiver, Sendable, Sender, Session,
};
use fe2o3_amqp_cbs::{client::CbsClient, token::CbsToken};
use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, Role},
    messaging::Outcome,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use url::Url;

use crate::{
    connection::ConnectionState,
    error::AmqpError,
    global_state::{GlobalState, GlobalStateGuard},
    link::LinkState,
    message::{AmqpMessage, DeliveryOutcome, MessageBody},
    session::SessionState,
};

use super::{
    AttachParams, BeginParams, CbsEvents, CbsTransport, ConnectionEvents, ConnectionTransport,
    Engine, LinkEvents, LinkTransport, OpenParams, PutTokenError, RemoteAttach, RemoteBegin,
    RemoteOpen, SessionEvents, SessionTransport, TransportError,
};

/// How often an open connection checks whether the peer closed it
const REMOTE_CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An engine connecting to AMQP 1.0 peers over TCP with `fe2o3-amqp`
#[derive(Debug, Clone, Default)]
pub struct Fe2o3Engine {
    _private: (),
}

impl Fe2o3Engine {
    /// Creates the engine
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for Fe2o3Engine {
    fn create_connection(
        &self,
        host: &str,
        port: u16,
        params: OpenParams,
        events: Weak<dyn ConnectionEvents>,
    ) -> Result<Box<dyn ConnectionTransport>, TransportError> {
        let url = connection_url(host, port)?;
        let guard = GlobalState::instance().acquire()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = guard.handle().clone();
        handle.spawn(run_connection(url, params, events, rx, guard));
        Ok(Box::new(Fe2o3Connection { tx }))
    }
}

/// Url the connection task dials
///
/// The scheme of the url selects TLS in `fe2o3-amqp`, so `amqps` is used for the
/// well-known TLS port.
fn connection_url(host: &str, port: u16) -> Result<Url, TransportError> {
    let scheme = match port {
        crate::constants::AMQPS_PORT => "amqps",
        _ => "amqp",
    };
    let host = match host.contains(':') && !host.starts_with('[') {
        true => format!("[{}]", host),
        false => host.to_string(),
    };
    Url::parse(&format!("{}://{}:{}", scheme, host, port))
        .map_err(|err| TransportError::Engine(err.to_string()))
}

fn engine_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Engine(err.to_string())
}

fn notify<E: ?Sized>(events: &Weak<E>, callback: impl FnOnce(&E)) {
    if let Some(events) = events.upgrade() {
        callback(&*events)
    }
}

fn to_wire_error(error: Option<AmqpError>) -> Option<definitions::Error> {
    error.map(definitions::Error::from)
}

fn idle_time_out_millis(idle_timeout: Duration) -> u32 {
    u32::try_from(idle_timeout.as_millis()).unwrap_or(u32::MAX)
}

/* -------------------------------- Connection ------------------------------ */

enum ConnCommand {
    Open,
    Close(Option<AmqpError>),
    Begin {
        params: BeginParams,
        events: Weak<dyn SessionEvents>,
        rx: mpsc::UnboundedReceiver<SessionCommand>,
    },
}

struct Fe2o3Connection {
    tx: mpsc::UnboundedSender<ConnCommand>,
}

impl Fe2o3Connection {
    fn send(&self, command: ConnCommand) -> Result<(), TransportError> {
        self.tx.send(command).map_err(|_| TransportError::Closed)
    }
}

impl ConnectionTransport for Fe2o3Connection {
    fn open(&self) -> Result<(), TransportError> {
        self.send(ConnCommand::Open)
    }

    fn close(&self, error: Option<AmqpError>) -> Result<(), TransportError> {
        self.send(ConnCommand::Close(error))
    }

    fn create_session(
        &self,
        params: BeginParams,
        events: Weak<dyn SessionEvents>,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(Fe2o3Session {
            conn: self.tx.clone(),
            params,
            events,
            tx,
            rx: Mutex::new(Some(rx)),
        }))
    }
}

async fn open_connection(
    url: &Url,
    params: &OpenParams,
) -> Result<ConnectionHandle<()>, TransportError> {
    let builder = Connection::builder()
        .container_id(params.container_id.clone())
        .hostname(params.hostname.as_str())
        .max_frame_size(params.max_frame_size)
        .channel_max(params.channel_max);
    let builder = match params.idle_timeout {
        Some(idle_timeout) => builder.idle_time_out(idle_time_out_millis(idle_timeout)),
        None => builder,
    };
    let builder = match &params.properties {
        Some(properties) => builder.properties(properties.clone()),
        None => builder,
    };
    builder.open(url.as_str()).await.map_err(engine_error)
}

async fn run_connection(
    url: Url,
    params: OpenParams,
    events: Weak<dyn ConnectionEvents>,
    mut rx: mpsc::UnboundedReceiver<ConnCommand>,
    _guard: GlobalStateGuard<'static>,
) {
    // Requests made before `open` are kept until the connection is up
    let mut pending = Vec::new();
    loop {
        match rx.recv().await {
            Some(ConnCommand::Open) => break,
            Some(ConnCommand::Close(_)) | None => return,
            Some(command) => pending.push(command),
        }
    }

    debug!(%url, "Connecting");
    notify(&events, |events| {
        events.on_state_changed(ConnectionState::Opening, ConnectionState::Unstarted)
    });
    let mut connection = match open_connection(&url, &params).await {
        Ok(connection) => connection,
        Err(err) => {
            error!(%url, ?err, "Connection failed");
            notify(&events, move |events| {
                events.on_io_error(err);
                events.on_state_changed(ConnectionState::Error, ConnectionState::Opening);
            });
            return;
        }
    };

    let remote = RemoteOpen {
        container_id: params.container_id.clone(),
        max_frame_size: params.max_frame_size,
        channel_max: params.channel_max,
        idle_timeout: params.idle_timeout,
        properties: params.properties.clone(),
    };
    notify(&events, move |events| {
        events.on_remote_open(remote);
        events.on_state_changed(ConnectionState::Open, ConnectionState::Opening);
    });

    for command in pending {
        if let ConnCommand::Begin { params, events, rx } = command {
            begin_session(&mut connection, params, events, rx).await;
        }
    }

    let mut poll = tokio::time::interval(REMOTE_CLOSE_POLL_INTERVAL);
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ConnCommand::Begin { params, events, rx }) => {
                    begin_session(&mut connection, params, events, rx).await
                }
                Some(ConnCommand::Open) => {
                    trace!("Connection already open");
                }
                Some(ConnCommand::Close(error)) => {
                    close_connection(connection, &events, error).await;
                    return;
                }
                None => {
                    close_connection(connection, &events, None).await;
                    return;
                }
            },
            _ = poll.tick() => {
                if connection.is_closed() {
                    let error = connection.on_close().await.err().map(|err| {
                        TransportError::Engine(err.to_string()).to_amqp_error()
                    });
                    debug!(?error, "Connection closed by the peer");
                    notify(&events, move |events| {
                        events.on_remote_close(error);
                        events.on_state_changed(ConnectionState::Error, ConnectionState::Open);
                    });
                    return;
                }
            }
        }
    }
}

async fn close_connection(
    mut connection: ConnectionHandle<()>,
    events: &Weak<dyn ConnectionEvents>,
    error: Option<AmqpError>,
) {
    notify(events, |events| {
        events.on_state_changed(ConnectionState::CloseSent, ConnectionState::Open)
    });
    let result = match to_wire_error(error) {
        Some(error) => connection.close_with_error(error).await,
        None => connection.close().await,
    };
    if let Err(err) = &result {
        debug!(?err, "Connection closed with an error");
    }
    notify(events, |events| {
        events.on_remote_close(None);
        events.on_state_changed(ConnectionState::Closed, ConnectionState::CloseSent);
    });
}

/* --------------------------------- Session -------------------------------- */

enum SessionCommand {
    End(Option<AmqpError>),
    Attach {
        params: AttachParams,
        events: Weak<dyn LinkEvents>,
        rx: mpsc::UnboundedReceiver<LinkCommand>,
    },
    AttachCbs {
        events: Weak<dyn CbsEvents>,
        rx: mpsc::UnboundedReceiver<CbsCommand>,
    },
}

struct Fe2o3Session {
    conn: mpsc::UnboundedSender<ConnCommand>,
    params: BeginParams,
    events: Weak<dyn SessionEvents>,
    tx: mpsc::UnboundedSender<SessionCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SessionCommand>>>,
}

impl Fe2o3Session {
    fn send(&self, command: SessionCommand) -> Result<(), TransportError> {
        self.tx.send(command).map_err(|_| TransportError::Closed)
    }
}

impl SessionTransport for Fe2o3Session {
    fn begin(&self) -> Result<(), TransportError> {
        let rx = self.rx.lock().take().ok_or(TransportError::IllegalState)?;
        self.conn
            .send(ConnCommand::Begin {
                params: self.params.clone(),
                events: self.events.clone(),
                rx,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn end(&self, error: Option<AmqpError>) -> Result<(), TransportError> {
        self.send(SessionCommand::End(error))
    }

    fn create_link(
        &self,
        params: AttachParams,
        events: Weak<dyn LinkEvents>,
    ) -> Result<Box<dyn LinkTransport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(Fe2o3Link {
            session: self.tx.clone(),
            params,
            events,
            tx,
            rx: Mutex::new(Some(rx)),
        }))
    }

    fn create_cbs(
        &self,
        events: Weak<dyn CbsEvents>,
    ) -> Result<Box<dyn CbsTransport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(Fe2o3Cbs {
            session: self.tx.clone(),
            events,
            tx,
            rx: Mutex::new(Some(rx)),
        }))
    }
}

async fn begin_session(
    connection: &mut ConnectionHandle<()>,
    params: BeginParams,
    events: Weak<dyn SessionEvents>,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    notify(&events, |events| {
        events.on_state_changed(SessionState::BeginSent, SessionState::Unstarted)
    });
    let mut builder = Session::builder()
        .incoming_window(params.incoming_window)
        .handle_max(params.handle_max);
    if let Some(properties) = &params.properties {
        builder = builder.properties(properties.clone());
    }
    match builder.begin(connection).await {
        Ok(session) => {
            let remote = RemoteBegin {
                incoming_window: params.incoming_window,
                outgoing_window: params.outgoing_window,
                handle_max: params.handle_max,
                properties: params.properties.clone(),
            };
            notify(&events, move |events| {
                events.on_remote_begin(remote);
                events.on_state_changed(SessionState::Begun, SessionState::BeginSent);
            });
            tokio::spawn(run_session(session, events, rx));
        }
        Err(err) => {
            let error = engine_error(err).to_amqp_error();
            notify(&events, move |events| {
                events.on_remote_end(Some(error));
                events.on_state_changed(SessionState::Error, SessionState::BeginSent);
            });
        }
    }
}

async fn run_session(
    mut session: SessionHandle<()>,
    events: Weak<dyn SessionEvents>,
    mut rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            SessionCommand::Attach { params, events, rx } => {
                attach_link(&mut session, params, events, rx).await
            }
            SessionCommand::AttachCbs { events, rx } => {
                match CbsClient::attach(&mut session).await {
                    Ok(client) => {
                        notify(&events, |events| events.on_cbs_opened(Ok(())));
                        tokio::spawn(run_cbs(client, events, rx));
                    }
                    Err(err) => {
                        let err = engine_error(err);
                        notify(&events, move |events| events.on_cbs_opened(Err(err)));
                    }
                }
            }
            SessionCommand::End(error) => {
                end_session(session, &events, error).await;
                return;
            }
        }
    }
    end_session(session, &events, None).await;
}

async fn end_session(
    mut session: SessionHandle<()>,
    events: &Weak<dyn SessionEvents>,
    error: Option<AmqpError>,
) {
    notify(events, |events| {
        events.on_state_changed(SessionState::EndSent, SessionState::Begun)
    });
    let result = match to_wire_error(error) {
        Some(error) => session.end_with_error(error).await,
        None => session.end().await,
    };
    let error = result.err().map(|err| engine_error(err).to_amqp_error());
    notify(events, move |events| {
        events.on_remote_end(error);
        events.on_state_changed(SessionState::Ended, SessionState::EndSent);
    });
}

/* ----------------------------------- Link --------------------------------- */

enum LinkCommand {
    Detach {
        closed: bool,
        error: Option<AmqpError>,
    },
    Transfer {
        delivery_id: DeliveryNumber,
        message: AmqpMessage,
        settled: bool,
    },
    Flow(u32),
    Disposition {
        delivery_id: DeliveryNumber,
        outcome: DeliveryOutcome,
    },
}

struct Fe2o3Link {
    session: mpsc::UnboundedSender<SessionCommand>,
    params: AttachParams,
    events: Weak<dyn LinkEvents>,
    tx: mpsc::UnboundedSender<LinkCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<LinkCommand>>>,
}

impl Fe2o3Link {
    fn send(&self, command: LinkCommand) -> Result<(), TransportError> {
        self.tx.send(command).map_err(|_| TransportError::Closed)
    }
}

impl LinkTransport for Fe2o3Link {
    fn attach(&self) -> Result<(), TransportError> {
        let rx = self.rx.lock().take().ok_or(TransportError::IllegalState)?;
        self.session
            .send(SessionCommand::Attach {
                params: self.params.clone(),
                events: self.events.clone(),
                rx,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn detach(&self, closed: bool, error: Option<AmqpError>) -> Result<(), TransportError> {
        self.send(LinkCommand::Detach { closed, error })
    }

    fn transfer(
        &self,
        delivery_id: DeliveryNumber,
        message: AmqpMessage,
        settled: bool,
    ) -> Result<(), TransportError> {
        self.send(LinkCommand::Transfer {
            delivery_id,
            message,
            settled,
        })
    }

    fn flow(&self, link_credit: u32) -> Result<(), TransportError> {
        self.send(LinkCommand::Flow(link_credit))
    }

    fn disposition(
        &self,
        delivery_id: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError> {
        self.send(LinkCommand::Disposition {
            delivery_id,
            outcome,
        })
    }
}

/// The error reported when a link fails
fn link_failure(err: impl std::fmt::Display) -> AmqpError {
    use fe2o3_amqp_types::definitions::LinkError;

    AmqpError::new(LinkError::DetachForced, Some(err.to_string()))
}

fn report_link_failure(events: &Weak<dyn LinkEvents>, error: AmqpError) {
    notify(events, move |events| {
        events.on_remote_detach(true, Some(error));
        events.on_state_changed(LinkState::Error, LinkState::Attached);
    });
}

async fn attach_link(
    session: &mut SessionHandle<()>,
    params: AttachParams,
    events: Weak<dyn LinkEvents>,
    rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
    notify(&events, |events| {
        events.on_state_changed(LinkState::Attaching, LinkState::Detached)
    });
    let remote = RemoteAttach {
        max_message_size: params.max_message_size,
        properties: params.properties.clone(),
    };
    let attached = match params.role {
        Role::Sender => attach_sender(session, &params)
            .await
            .map(|sender| tokio::spawn(run_sender(sender, events.clone(), rx))),
        Role::Receiver => attach_receiver(session, &params)
            .await
            .map(|receiver| tokio::spawn(run_receiver(receiver, events.clone(), rx))),
    };
    match attached {
        Ok(_) => notify(&events, move |events| {
            events.on_remote_attach(remote);
            events.on_state_changed(LinkState::Attached, LinkState::Attaching);
        }),
        Err(error) => {
            debug!(name = %params.name, ?error, "Attach refused");
            notify(&events, move |events| {
                events.on_remote_detach(true, Some(error));
                events.on_state_changed(LinkState::Error, LinkState::Attaching);
            })
        }
    }
}

async fn attach_sender(
    session: &mut SessionHandle<()>,
    params: &AttachParams,
) -> Result<Sender, AmqpError> {
    let mut builder = Sender::builder()
        .name(params.name.clone())
        .target(params.target.clone().unwrap_or_default())
        .sender_settle_mode(params.snd_settle_mode.clone())
        .receiver_settle_mode(params.rcv_settle_mode.clone());
    if let Some(source) = &params.source {
        builder = builder.source(source.clone());
    }
    if let Some(size) = params.max_message_size {
        builder = builder.max_message_size(size);
    }
    if let Some(properties) = &params.properties {
        builder = builder.properties(properties.clone());
    }
    builder.attach(session).await.map_err(link_failure)
}

async fn attach_receiver(
    session: &mut SessionHandle<()>,
    params: &AttachParams,
) -> Result<Receiver, AmqpError> {
    let mut builder = Receiver::builder()
        .name(params.name.clone())
        .source(params.source.clone().unwrap_or_default())
        .target(params.target.clone().unwrap_or_default())
        .sender_settle_mode(params.snd_settle_mode.clone())
        .receiver_settle_mode(params.rcv_settle_mode.clone());
    if let Some(size) = params.max_message_size {
        builder = builder.max_message_size(size);
    }
    if let Some(properties) = &params.properties {
        builder = builder.properties(properties.clone());
    }
    let mut receiver = builder.attach(session).await.map_err(link_failure)?;
    // Credit is issued by the state machine through `flow`
    receiver.set_credit_mode(CreditMode::Manual);
    Ok(receiver)
}

/// Terminal state of a link once its `detach` went out
fn detached_state(closed: bool) -> LinkState {
    match closed {
        true => LinkState::Closed,
        false => LinkState::Detached,
    }
}

fn report_detached(
    events: &Weak<dyn LinkEvents>,
    closed: bool,
    result: Result<(), impl std::fmt::Display>,
) {
    let error = result.err().map(link_failure);
    notify(events, move |events| {
        events.on_remote_detach(closed, error);
        events.on_state_changed(detached_state(closed), LinkState::DetachSent);
    });
}

async fn run_sender(
    mut sender: Sender,
    events: Weak<dyn LinkEvents>,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            LinkCommand::Transfer {
                delivery_id,
                message,
                settled,
            } => {
                let sendable = Sendable::builder()
                    .message(message.into_inner())
                    .settled(settled)
                    .build();
                match sender.send_batchable(sendable).await {
                    Ok(outcome) if !settled => {
                        let events = events.clone();
                        tokio::spawn(async move {
                            match outcome.await {
                                Ok(outcome) => notify(&events, move |events| {
                                    events.on_disposition(delivery_id, outcome)
                                }),
                                Err(err) => report_link_failure(&events, link_failure(err)),
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        report_link_failure(&events, link_failure(err));
                        return;
                    }
                }
            }
            LinkCommand::Detach { closed, error } => {
                notify(&events, |events| {
                    events.on_state_changed(LinkState::DetachSent, LinkState::Attached)
                });
                let result = match (closed, to_wire_error(error)) {
                    (true, None) => sender.close().await,
                    (true, Some(error)) => sender.close_with_error(error).await,
                    (false, None) => sender.detach().await.map(|_| ()).map_err(|(_, err)| err),
                    (false, Some(error)) => sender.detach_with_error(error).await.map(|_| ()).map_err(|(_, err)| err),
                };
                report_detached(&events, closed, result);
                return;
            }
            LinkCommand::Flow(_) | LinkCommand::Disposition { .. } => {
                trace!("Ignoring a receiver request on a sender");
            }
        }
    }
    let _ = sender.close().await;
}

async fn dispose(
    receiver: &mut Receiver,
    delivery: &Delivery<MessageBody>,
    outcome: DeliveryOutcome,
) -> Result<(), TransportError> {
    let result = match outcome {
        Outcome::Accepted(_) => receiver.accept(delivery).await,
        Outcome::Rejected(rejected) => receiver.reject(delivery, rejected.error).await,
        Outcome::Modified(modified) => receiver.modify(delivery, modified).await,
        #[allow(unreachable_patterns)]
        _ => receiver.release(delivery).await,
    };
    result.map_err(engine_error)
}

async fn run_receiver(
    mut receiver: Receiver,
    events: Weak<dyn LinkEvents>,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let mut next_delivery_id: DeliveryNumber = 0;
    let mut unsettled: HashMap<DeliveryNumber, Delivery<MessageBody>> = HashMap::new();
    loop {
        tokio::select! {
            delivery = receiver.recv::<MessageBody>() => match delivery {
                Ok(delivery) => {
                    let delivery_id = next_delivery_id;
                    next_delivery_id = next_delivery_id.wrapping_add(1);
                    let message = AmqpMessage::from(delivery.message().clone());
                    unsettled.insert(delivery_id, delivery);
                    notify(&events, move |events| events.on_transfer(delivery_id, message));
                }
                Err(err) => {
                    report_link_failure(&events, link_failure(err));
                    return;
                }
            },
            command = rx.recv() => match command {
                Some(LinkCommand::Flow(link_credit)) => {
                    if let Err(err) = receiver.set_credit(link_credit).await {
                        report_link_failure(&events, link_failure(err));
                        return;
                    }
                }
                Some(LinkCommand::Disposition { delivery_id, outcome }) => {
                    match unsettled.remove(&delivery_id) {
                        Some(delivery) => {
                            if let Err(err) = dispose(&mut receiver, &delivery, outcome).await {
                                debug!(delivery_id, ?err, "Disposition failed");
                            }
                        }
                        None => trace!(delivery_id, "Disposition of an unknown delivery"),
                    }
                }
                Some(LinkCommand::Detach { closed, error }) => {
                    notify(&events, |events| {
                        events.on_state_changed(LinkState::DetachSent, LinkState::Attached)
                    });
                    let result = match (closed, to_wire_error(error)) {
                        (true, None) => receiver.close().await,
                        (true, Some(error)) => receiver.close_with_error(error).await,
                        (false, None) => receiver.detach().await.map(|_| ()).map_err(|(_, err)| err),
                        (false, Some(error)) => receiver.detach_with_error(error).await.map(|_| ()).map_err(|(_, err)| err),
                    };
                    report_detached(&events, closed, result);
                    return;
                }
                Some(LinkCommand::Transfer { .. }) => {
                    trace!("Ignoring a transfer on a receiver");
                }
                None => {
                    let _ = receiver.close().await;
                    return;
                }
            }
        }
    }
}

/* ----------------------------------- CBS ---------------------------------- */

enum CbsCommand {
    PutToken {
        name: String,
        token: CbsToken<'static>,
    },
    Close,
}

struct Fe2o3Cbs {
    session: mpsc::UnboundedSender<SessionCommand>,
    events: Weak<dyn CbsEvents>,
    tx: mpsc::UnboundedSender<CbsCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<CbsCommand>>>,
}

impl CbsTransport for Fe2o3Cbs {
    fn open(&self) -> Result<(), TransportError> {
        let rx = self.rx.lock().take().ok_or(TransportError::IllegalState)?;
        self.session
            .send(SessionCommand::AttachCbs {
                events: self.events.clone(),
                rx,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn put_token(&self, name: String, token: CbsToken<'static>) -> Result<(), TransportError> {
        self.tx
            .send(CbsCommand::PutToken { name, token })
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.tx
            .send(CbsCommand::Close)
            .map_err(|_| TransportError::Closed)
    }
}

async fn run_cbs(
    mut client: CbsClient,
    events: Weak<dyn CbsEvents>,
    mut rx: mpsc::UnboundedReceiver<CbsCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            CbsCommand::PutToken { name, token } => {
                let result = client
                    .put_token(&name, token)
                    .await
                    .map_err(|err| PutTokenError::Transport(engine_error(err)));
                notify(&events, move |events| events.on_token_put(result));
            }
            CbsCommand::Close => {
                let result = client.close().await.map_err(engine_error);
                notify(&events, move |events| events.on_cbs_closed(result));
                return;
            }
        }
    }
    let _ = client.close().await;
}
