//! The in-process peer answering a [`LocalEngine`]

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    sync::Arc,
    time::Duration,
};

use fe2o3_amqp_cbs::token::CbsToken;
use fe2o3_amqp_types::{
    definitions::{DeliveryNumber, Fields, LinkError, Role},
    messaging::{Accepted, Outcome},
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    constants::{DEFAULT_CHANNEL_MAX, DEFAULT_HANDLE_MAX, DEFAULT_MAX_FRAME_SIZE},
    error::AmqpError,
    message::{AmqpMessage, DeliveryOutcome},
    terminus::TerminusAddress,
};

use super::{
    super::{PutTokenError, RemoteAttach, RemoteBegin, RemoteOpen, TransportError},
    ConnCore, LinkCore, LocalEngine, SessionCore,
};

/// Builder for a [`LocalBroker`]
///
/// | Field | Default Value |
/// |-------|---------------|
/// | container_id | `"local-broker"` |
/// | max_frame_size | [`DEFAULT_MAX_FRAME_SIZE`] |
/// | channel_max | [`DEFAULT_CHANNEL_MAX`] |
/// | idle_time_out | `None` |
/// | handle_max | [`DEFAULT_HANDLE_MAX`] |
/// | max_message_size | `None` |
/// | window | `2048` |
/// | properties | `None` |
#[derive(Debug, Clone)]
pub struct Builder {
    container_id: String,
    max_frame_size: u32,
    channel_max: u16,
    idle_time_out: Option<Duration>,
    handle_max: u32,
    max_message_size: Option<u64>,
    window: u32,
    properties: Option<Fields>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            container_id: "local-broker".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            idle_time_out: None,
            handle_max: DEFAULT_HANDLE_MAX,
            max_message_size: None,
            window: 2048,
            properties: None,
        }
    }
}

impl Builder {
    /// Container id announced in `open`
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    /// Max frame size announced in `open`
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Channel max announced in `open`
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Idle timeout announced in `open`
    pub fn idle_time_out(mut self, idle_time_out: Duration) -> Self {
        self.idle_time_out = Some(idle_time_out);
        self
    }

    /// Handle max announced in `begin`
    pub fn handle_max(mut self, handle_max: u32) -> Self {
        self.handle_max = handle_max;
        self
    }

    /// Largest message accepted on any link. A larger transfer detaches the link
    /// with `amqp:link:message-size-exceeded`.
    pub fn max_message_size(mut self, max_message_size: u64) -> Self {
        self.max_message_size = Some(max_message_size);
        self
    }

    /// Incoming and outgoing window announced in `begin`
    pub fn window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    /// Connection properties announced in `open`
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Starts listening on `port` of `engine`
    pub fn listen(self, engine: &LocalEngine, port: u16) -> Result<LocalBroker, io::Error> {
        let mut listeners = engine.shared.listeners.lock();
        if listeners.contains_key(&port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("Port {} is already in use", port),
            ));
        }

        let shared = Arc::new(BrokerShared {
            config: self,
            state: Mutex::new(BrokerState::default()),
        });
        listeners.insert(port, shared.clone());
        debug!(port, "Local broker listening");
        Ok(LocalBroker {
            engine: engine.clone(),
            port,
            shared,
        })
    }
}

/// An in-process AMQP peer listening on a port of a [`LocalEngine`]
///
/// The broker keeps one queue per node address. A transfer to a node is accepted
/// and queued, and queued messages are delivered to receiving links attached to
/// the node as long as they have credit. Put-token requests from CBS clients are
/// recorded and answered with status 202, or 401 while tokens are rejected. Dropping
/// the broker stops listening; connections that are already open keep working.
pub struct LocalBroker {
    engine: LocalEngine,
    port: u16,
    shared: Arc<BrokerShared>,
}

impl fmt::Debug for LocalBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBroker")
            .field("port", &self.port)
            .field("container_id", &self.shared.config.container_id)
            .finish()
    }
}

impl LocalBroker {
    /// Creates a [`Builder`] for a broker
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The port the broker listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting new connections
    pub fn stop_listening(&self) {
        let mut listeners = self.engine.shared.listeners.lock();
        if let Some(shared) = listeners.get(&self.port) {
            if Arc::ptr_eq(shared, &self.shared) {
                listeners.remove(&self.port);
                debug!(port = self.port, "Local broker stopped listening");
            }
        }
    }

    /// Whether the broker accepts new connections
    pub fn is_listening(&self) -> bool {
        self.engine
            .shared
            .listeners
            .lock()
            .get(&self.port)
            .map(|shared| Arc::ptr_eq(shared, &self.shared))
            .unwrap_or(false)
    }

    /// When set, requests are processed but never answered
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.shared.state.lock().unresponsive = unresponsive
    }

    /// When set, transfers are kept unsettled until
    /// [`release_held_settlements`](LocalBroker::release_held_settlements) is called
    pub fn hold_settlements(&self, hold: bool) {
        self.shared.state.lock().hold_settlements = hold
    }

    /// When set, put-token requests are refused with status 401
    pub fn reject_tokens(&self, reject: bool) {
        self.shared.state.lock().reject_tokens = reject
    }

    /// Delivery ids of the transfers held unsettled, in arrival order
    pub fn held_delivery_ids(&self) -> Vec<DeliveryNumber> {
        let state = self.shared.state.lock();
        state.held.iter().map(|(_, delivery_id)| *delivery_id).collect()
    }

    /// Accepts every held delivery and returns how many were settled
    pub fn release_held_settlements(&self) -> usize {
        let mut state = self.shared.state.lock();
        let held = std::mem::take(&mut state.held);
        let mut count = 0;
        for (link_id, delivery_id) in held {
            if let Some(link) = state.links.get(&link_id) {
                link.core
                    .notify_disposition(delivery_id, Outcome::Accepted(Accepted {}));
                count += 1;
            }
        }
        count
    }

    /// Detaches the first link named `name` from the broker side
    pub fn force_detach(&self, name: &str, error: AmqpError) -> bool {
        let mut state = self.shared.state.lock();
        let id = state
            .links
            .iter()
            .find(|(_, link)| link.core.params.name == name)
            .map(|(id, _)| *id);
        let link = match id.and_then(|id| state.remove_link(id)) {
            Some(link) => link,
            None => return false,
        };
        *link.core.id.lock() = None;
        debug!(name, %error, "Local broker detaching link");
        link.core.notify_remote_detach(error);
        true
    }

    /// Fails the transport of the connection opened by `container_id`
    pub fn inject_io_error(&self, container_id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let id = state
            .connections
            .iter()
            .find(|(_, conn)| conn.params.container_id == container_id)
            .map(|(id, _)| *id);
        let conn = match id.and_then(|id| state.remove_connection(id)) {
            Some(conn) => conn,
            None => return false,
        };
        drop(state);

        conn.attachment.lock().take();
        let old_state = conn.transition(crate::connection::ConnectionState::Error);
        conn.notify(move |events| {
            let error = io::Error::new(io::ErrorKind::ConnectionReset, "Connection reset by peer");
            events.on_io_error(TransportError::Io(error));
            events.on_state_changed(crate::connection::ConnectionState::Error, old_state);
        });
        true
    }

    /// Begins a session towards the connection opened by `container_id`
    pub fn begin_session(&self, container_id: &str) -> bool {
        let state = self.shared.state.lock();
        let conn = state
            .connections
            .values()
            .find(|conn| conn.params.container_id == container_id)
            .cloned();
        drop(state);

        let conn = match conn {
            Some(conn) => conn,
            None => return false,
        };
        let remote = self.shared.remote_begin(None);
        let incoming = super::LocalIncomingSession {
            conn: conn.clone(),
            remote,
        };
        conn.notify(move |events| events.on_new_session(Box::new(incoming)));
        true
    }

    /// Queues a message on the node `address`
    pub fn send(&self, address: &str, message: AmqpMessage) {
        let mut state = self.shared.state.lock();
        state.enqueue(address, message);
    }

    /// Messages queued on the node `address`
    pub fn messages(&self, address: &str) -> Vec<AmqpMessage> {
        self.shared
            .state
            .lock()
            .nodes
            .get(address)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Number of begun sessions
    pub fn session_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    /// Number of attached links
    pub fn link_count(&self) -> usize {
        self.shared.state.lock().links.len()
    }

    /// Errors carried by every `close` received so far
    pub fn close_errors(&self) -> Vec<Option<AmqpError>> {
        self.shared.state.lock().close_errors.clone()
    }

    /// Errors carried by every `end` received so far
    pub fn end_errors(&self) -> Vec<Option<AmqpError>> {
        self.shared.state.lock().end_errors.clone()
    }

    /// Errors carried by every `detach` received so far
    pub fn detach_errors(&self) -> Vec<Option<AmqpError>> {
        self.shared.state.lock().detach_errors.clone()
    }

    /// Every `(audience, token)` accepted through put-token
    pub fn tokens(&self) -> Vec<(String, String)> {
        self.shared.state.lock().tokens.clone()
    }

    /// Every disposition received from receiving links
    pub fn dispositions(&self) -> Vec<(DeliveryNumber, DeliveryOutcome)> {
        self.shared.state.lock().dispositions.clone()
    }
}

impl Drop for LocalBroker {
    fn drop(&mut self) {
        self.stop_listening()
    }
}

/* ---------------------------------- State --------------------------------- */

struct PeerSession {
    conn: u64,
    core: Arc<SessionCore>,
}

struct PeerLink {
    conn: u64,
    session: u64,
    core: Arc<LinkCore>,
    node: String,
    is_receiver: bool,
    credit: u32,
    next_delivery_id: DeliveryNumber,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    unresponsive: bool,
    hold_settlements: bool,
    reject_tokens: bool,

    connections: HashMap<u64, Arc<ConnCore>>,
    sessions: HashMap<u64, PeerSession>,
    links: HashMap<u64, PeerLink>,
    nodes: HashMap<String, VecDeque<AmqpMessage>>,
    held: Vec<(u64, DeliveryNumber)>,

    close_errors: Vec<Option<AmqpError>>,
    end_errors: Vec<Option<AmqpError>>,
    detach_errors: Vec<Option<AmqpError>>,
    tokens: Vec<(String, String)>,
    dispositions: Vec<(DeliveryNumber, DeliveryOutcome)>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove_connection(&mut self, id: u64) -> Option<Arc<ConnCore>> {
        let conn = self.connections.remove(&id)?;
        self.sessions.retain(|_, session| session.conn != id);
        self.links.retain(|_, link| link.conn != id);
        let links = &self.links;
        self.held.retain(|(link, _)| links.contains_key(link));
        Some(conn)
    }

    fn remove_session(&mut self, id: u64) -> Option<PeerSession> {
        let session = self.sessions.remove(&id)?;
        self.links.retain(|_, link| link.session != id);
        let links = &self.links;
        self.held.retain(|(link, _)| links.contains_key(link));
        Some(session)
    }

    fn remove_link(&mut self, id: u64) -> Option<PeerLink> {
        let link = self.links.remove(&id)?;
        self.held.retain(|(link, _)| *link != id);
        Some(link)
    }

    fn enqueue(&mut self, node: &str, message: AmqpMessage) {
        self.nodes
            .entry(node.to_string())
            .or_default()
            .push_back(message);
        self.pump(node);
    }

    /// Delivers queued messages of `node` to receivers with credit
    fn pump(&mut self, node: &str) {
        let queue = match self.nodes.get_mut(node) {
            Some(queue) => queue,
            None => return,
        };

        while !queue.is_empty() {
            let link = self
                .links
                .values_mut()
                .find(|link| link.is_receiver && link.node == node && link.credit > 0);
            let link = match link {
                Some(link) => link,
                None => return,
            };
            let message = match queue.pop_front() {
                Some(message) => message,
                None => return,
            };

            link.credit -= 1;
            let delivery_id = link.next_delivery_id;
            link.next_delivery_id = delivery_id.wrapping_add(1);
            link.core.notify_transfer(delivery_id, message);
        }
    }
}

pub(super) struct BrokerShared {
    config: Builder,
    state: Mutex<BrokerState>,
}

impl BrokerShared {
    fn remote_begin(&self, params: Option<&super::BeginParams>) -> RemoteBegin {
        let handle_max = match params {
            Some(params) => params.handle_max.min(self.config.handle_max),
            None => self.config.handle_max,
        };
        RemoteBegin {
            incoming_window: self.config.window,
            outgoing_window: self.config.window,
            handle_max,
            properties: None,
        }
    }

    /// Registers a connection, returning its id, the remote `open` and whether the
    /// broker is unresponsive
    pub(super) fn connect(&self, core: &Arc<ConnCore>) -> Option<(u64, RemoteOpen, bool)> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.connections.insert(id, core.clone());
        trace!(id, container_id = %core.params.container_id, "Local broker accepted connection");

        let remote = RemoteOpen {
            container_id: self.config.container_id.clone(),
            max_frame_size: self.config.max_frame_size,
            channel_max: self.config.channel_max,
            idle_timeout: self.config.idle_time_out,
            properties: self.config.properties.clone(),
        };
        Some((id, remote, state.unresponsive))
    }

    /// Handles `close`, returning whether the broker is unresponsive
    pub(super) fn disconnect(&self, id: u64, error: Option<AmqpError>) -> bool {
        let mut state = self.state.lock();
        state.close_errors.push(error);
        state.remove_connection(id);
        state.unresponsive
    }

    pub(super) fn drop_connection(&self, id: u64) {
        self.state.lock().remove_connection(id);
    }

    pub(super) fn begin(
        &self,
        conn: u64,
        core: &Arc<SessionCore>,
    ) -> Option<(u64, RemoteBegin, bool)> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&conn) {
            return None;
        }
        let id = state.next_id();
        state.sessions.insert(
            id,
            PeerSession {
                conn,
                core: core.clone(),
            },
        );
        Some((id, self.remote_begin(Some(&core.params)), state.unresponsive))
    }

    /// Handles `end`, returning whether the broker is unresponsive
    pub(super) fn end(&self, id: u64, error: Option<AmqpError>) -> bool {
        let mut state = self.state.lock();
        if state.remove_session(id).is_some() {
            state.end_errors.push(error);
        }
        state.unresponsive
    }

    pub(super) fn attach(
        &self,
        session: u64,
        core: &Arc<LinkCore>,
    ) -> Option<(u64, RemoteAttach, bool)> {
        let mut state = self.state.lock();
        let conn = state.sessions.get(&session)?.conn;
        let id = state.next_id();

        let params = &core.params;
        let is_receiver = matches!(params.role, Role::Receiver);
        let node = match is_receiver {
            true => params.source.as_ref().map(|s| s.address_str().to_string()),
            false => params.target.as_ref().map(|t| t.address_str().to_string()),
        }
        .unwrap_or_default();

        state.links.insert(
            id,
            PeerLink {
                conn,
                session,
                core: core.clone(),
                node,
                is_receiver,
                credit: 0,
                next_delivery_id: 0,
            },
        );

        let remote = RemoteAttach {
            max_message_size: self.config.max_message_size,
            properties: None,
        };
        Some((id, remote, state.unresponsive))
    }

    /// Handles `detach`, returning whether the broker is unresponsive
    pub(super) fn detach(&self, id: u64, error: Option<AmqpError>) -> bool {
        let mut state = self.state.lock();
        if state.remove_link(id).is_some() {
            state.detach_errors.push(error);
        }
        state.unresponsive
    }

    pub(super) fn transfer(
        &self,
        link: u64,
        delivery_id: DeliveryNumber,
        message: AmqpMessage,
        settled: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let (core, node) = {
            let link = state.links.get(&link).ok_or(TransportError::IllegalState)?;
            (link.core.clone(), link.node.clone())
        };

        if let Some(max) = self.config.max_message_size {
            let size = message
                .encoded_size()
                .map_err(|err| TransportError::Engine(err.to_string()))?;
            if size > max {
                state.remove_link(link);
                *core.id.lock() = None;
                let error = AmqpError::new(
                    LinkError::MessageSizeExceeded,
                    Some(format!("Message of {} bytes exceeds {}", size, max)),
                );
                core.notify_remote_detach(error);
                return Ok(());
            }
        }

        state.enqueue(&node, message);

        if !settled && !state.unresponsive {
            match state.hold_settlements {
                true => state.held.push((link, delivery_id)),
                false => core.notify_disposition(delivery_id, Outcome::Accepted(Accepted {})),
            }
        }
        Ok(())
    }

    pub(super) fn flow(&self, link: u64, credit: u32) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let node = {
            let link = state
                .links
                .get_mut(&link)
                .ok_or(TransportError::IllegalState)?;
            link.credit = credit;
            link.node.clone()
        };
        state.pump(&node);
        Ok(())
    }

    pub(super) fn disposition(
        &self,
        link: u64,
        delivery_id: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.links.contains_key(&link) {
            return Err(TransportError::IllegalState);
        }
        state.dispositions.push((delivery_id, outcome));
        Ok(())
    }

    /// Handles a put-token request on the connection `conn`. Returns `None` when the
    /// broker is unresponsive
    pub(super) fn put_token(
        &self,
        conn: u64,
        audience: String,
        token: &CbsToken<'_>,
    ) -> Option<Result<(), PutTokenError>> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&conn) {
            return Some(Err(PutTokenError::Transport(TransportError::Closed)));
        }
        if state.unresponsive {
            return None;
        }
        match state.reject_tokens {
            true => Some(Err(PutTokenError::Status {
                code: 401,
                description: Some("Unauthorized".to_string()),
            })),
            false => {
                trace!(%audience, token_type = token.token_type(), "Local broker accepted token");
                state
                    .tokens
                    .push((audience, token.token_value().to_string()));
                Some(Ok(()))
            }
        }
    }

    /// Whether the connection `conn` is still registered and the broker answers
    pub(super) fn is_responsive(&self, conn: u64) -> Option<bool> {
        let state = self.state.lock();
        state
            .connections
            .contains_key(&conn)
            .then_some(!state.unresponsive)
    }
}
