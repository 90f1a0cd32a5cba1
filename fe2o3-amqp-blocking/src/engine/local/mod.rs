//! An in-process engine
//!
//! [`LocalEngine`] connects to [`LocalBroker`]s listening on `localhost` ports of the
//! same engine instance. Frames are never encoded, but every request goes through
//! the same callback contract a networked engine follows, and every callback is
//! delivered in order on the engine execution context.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{Arc, Weak},
};

use fe2o3_amqp_cbs::token::CbsToken;
use fe2o3_amqp_types::definitions::DeliveryNumber;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc};
use tracing::trace;

use crate::{
    connection::ConnectionState,
    constants::CBS_NODE_ADDR,
    error::AmqpError,
    global_state::{GlobalState, GlobalStateGuard},
    link::LinkState,
    message::{AmqpMessage, DeliveryOutcome},
    session::SessionState,
};

use super::{
    AttachParams, BeginParams, CbsEvents, CbsTransport, ConnectionEvents, ConnectionTransport,
    Engine, IncomingSession, LinkEvents, LinkTransport, OpenParams, RemoteBegin, SessionEvents,
    SessionTransport, TransportError,
};

mod broker;

pub use broker::{Builder as BrokerBuilder, LocalBroker};

use broker::BrokerShared;

type Dispatch = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks of one connection sequentially on the engine execution context
#[derive(Clone)]
struct Dispatcher {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl Dispatcher {
    fn spawn(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();
        handle.spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback()
            }
        });
        Self { tx }
    }

    fn dispatch(&self, callback: impl FnOnce() + Send + 'static) {
        // The receiving task only stops when the runtime shuts down
        let _ = self.tx.send(Box::new(callback));
    }
}

/// An in-process engine
///
/// Cloning a [`LocalEngine`] shares its set of listening brokers.
#[derive(Clone, Default)]
pub struct LocalEngine {
    shared: Arc<EngineShared>,
}

#[derive(Default)]
struct EngineShared {
    listeners: Mutex<HashMap<u16, Arc<BrokerShared>>>,
}

impl fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports: Vec<u16> = self.shared.listeners.lock().keys().copied().collect();
        f.debug_struct("LocalEngine")
            .field("listening", &ports)
            .finish()
    }
}

impl LocalEngine {
    /// Creates an engine without any listening broker
    pub fn new() -> Self {
        Self::default()
    }

    fn listener(&self, port: u16) -> Option<Arc<BrokerShared>> {
        self.shared.listeners.lock().get(&port).cloned()
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

impl Engine for LocalEngine {
    fn create_connection(
        &self,
        host: &str,
        port: u16,
        params: OpenParams,
        events: Weak<dyn ConnectionEvents>,
    ) -> Result<Box<dyn ConnectionTransport>, TransportError> {
        let guard = GlobalState::instance().acquire()?;
        let dispatcher = Dispatcher::spawn(guard.handle());
        let core = ConnCore {
            engine: self.clone(),
            host: host.to_string(),
            port,
            params,
            events,
            dispatcher,
            state: Mutex::new(ConnectionState::Unstarted),
            attachment: Mutex::new(None),
            _guard: guard,
        };
        Ok(Box::new(LocalConnection {
            core: Arc::new(core),
        }))
    }
}

/* -------------------------------- Connection ------------------------------ */

#[derive(Clone)]
struct Attachment {
    broker: Arc<BrokerShared>,
    id: u64,
}

struct ConnCore {
    engine: LocalEngine,
    host: String,
    port: u16,
    params: OpenParams,
    events: Weak<dyn ConnectionEvents>,
    dispatcher: Dispatcher,
    state: Mutex<ConnectionState>,
    attachment: Mutex<Option<Attachment>>,
    _guard: GlobalStateGuard<'static>,
}

impl ConnCore {
    fn attachment(&self) -> Option<Attachment> {
        self.attachment.lock().clone()
    }

    fn transition(&self, new_state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.lock(), new_state)
    }

    fn notify(&self, callback: impl FnOnce(&dyn ConnectionEvents) + Send + 'static) {
        let events = self.events.clone();
        self.dispatcher.dispatch(move || {
            if let Some(events) = events.upgrade() {
                callback(&*events)
            }
        })
    }

    fn notify_state(&self, new_state: ConnectionState) {
        let old_state = self.transition(new_state);
        self.notify(move |events| events.on_state_changed(new_state, old_state));
    }
}

struct LocalConnection {
    core: Arc<ConnCore>,
}

impl ConnectionTransport for LocalConnection {
    fn open(&self) -> Result<(), TransportError> {
        let core = &self.core;
        if core.attachment().is_some() {
            return Err(TransportError::IllegalState);
        }
        trace!(host = %core.host, port = core.port, "Local connection opening");
        core.notify_state(ConnectionState::Opening);

        let broker = match is_local_host(&core.host) {
            true => core.engine.listener(core.port),
            false => None,
        };
        let refused = || {
            core.transition(ConnectionState::Error);
            let host = core.host.clone();
            let port = core.port;
            core.notify(move |events| {
                let error = io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("Nothing is listening on {}:{}", host, port),
                );
                events.on_io_error(TransportError::Io(error));
                events.on_state_changed(ConnectionState::Error, ConnectionState::Opening);
            });
        };
        let broker = match broker {
            Some(broker) => broker,
            None => {
                refused();
                return Ok(());
            }
        };

        let (id, remote, unresponsive) = match broker.connect(core) {
            Some(accepted) => accepted,
            None => {
                refused();
                return Ok(());
            }
        };
        *core.attachment.lock() = Some(Attachment { broker, id });

        if !unresponsive {
            core.notify(move |events| events.on_remote_open(remote));
            core.notify_state(ConnectionState::Open);
        }
        Ok(())
    }

    fn close(&self, error: Option<AmqpError>) -> Result<(), TransportError> {
        let core = &self.core;
        let attachment = core.attachment.lock().take();
        core.notify_state(ConnectionState::CloseSent);

        if let Some(Attachment { broker, id }) = attachment {
            if broker.disconnect(id, error) {
                return Ok(());
            }
        }

        core.notify(|events| events.on_remote_close(None));
        core.notify_state(ConnectionState::Closed);
        Ok(())
    }

    fn create_session(
        &self,
        params: BeginParams,
        events: Weak<dyn SessionEvents>,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        let core = SessionCore {
            conn: self.core.clone(),
            params,
            events,
            state: Mutex::new(SessionState::Unstarted),
            id: Mutex::new(None),
        };
        Ok(Box::new(LocalSession {
            core: Arc::new(core),
        }))
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        let attachment = self.core.attachment.lock().take();
        if let Some(Attachment { broker, id }) = attachment {
            broker.drop_connection(id);
        }
    }
}

/* --------------------------------- Session -------------------------------- */

struct SessionCore {
    conn: Arc<ConnCore>,
    params: BeginParams,
    events: Weak<dyn SessionEvents>,
    state: Mutex<SessionState>,
    id: Mutex<Option<u64>>,
}

impl SessionCore {
    fn id(&self) -> Option<u64> {
        *self.id.lock()
    }

    fn notify(&self, callback: impl FnOnce(&dyn SessionEvents) + Send + 'static) {
        let events = self.events.clone();
        self.conn.dispatcher.dispatch(move || {
            if let Some(events) = events.upgrade() {
                callback(&*events)
            }
        })
    }

    fn notify_state(&self, new_state: SessionState) {
        let old_state = std::mem::replace(&mut *self.state.lock(), new_state);
        self.notify(move |events| events.on_state_changed(new_state, old_state));
    }
}

struct LocalSession {
    core: Arc<SessionCore>,
}

impl SessionTransport for LocalSession {
    fn begin(&self) -> Result<(), TransportError> {
        let core = &self.core;
        let Attachment { broker, id: conn_id } =
            core.conn.attachment().ok_or(TransportError::IllegalState)?;
        if core.id().is_some() {
            return Err(TransportError::IllegalState);
        }

        core.notify_state(SessionState::BeginSent);
        let (id, remote, unresponsive) = broker
            .begin(conn_id, core)
            .ok_or(TransportError::Closed)?;
        *core.id.lock() = Some(id);

        if !unresponsive {
            core.notify(move |events| events.on_remote_begin(remote));
            core.notify_state(SessionState::Begun);
        }
        Ok(())
    }

    fn end(&self, error: Option<AmqpError>) -> Result<(), TransportError> {
        let core = &self.core;
        let id = core.id.lock().take().ok_or(TransportError::IllegalState)?;
        core.notify_state(SessionState::EndSent);

        if let Some(Attachment { broker, .. }) = core.conn.attachment() {
            if broker.end(id, error) {
                return Ok(());
            }
        }

        core.notify(|events| events.on_remote_end(None));
        core.notify_state(SessionState::Ended);
        Ok(())
    }

    fn create_link(
        &self,
        params: AttachParams,
        events: Weak<dyn LinkEvents>,
    ) -> Result<Box<dyn LinkTransport>, TransportError> {
        let core = LinkCore {
            session: self.core.clone(),
            params,
            events,
            state: Mutex::new(LinkState::Detached),
            id: Mutex::new(None),
        };
        Ok(Box::new(LocalLink {
            core: Arc::new(core),
        }))
    }

    fn create_cbs(
        &self,
        events: Weak<dyn CbsEvents>,
    ) -> Result<Box<dyn CbsTransport>, TransportError> {
        Ok(Box::new(LocalCbs {
            session: self.core.clone(),
            events,
            attached: Mutex::new(false),
        }))
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        let id = self.core.id.lock().take();
        if let Some(id) = id {
            if let Some(Attachment { broker, .. }) = self.core.conn.attachment() {
                broker.end(id, None);
            }
        }
    }
}

struct LocalIncomingSession {
    conn: Arc<ConnCore>,
    remote: RemoteBegin,
}

impl IncomingSession for LocalIncomingSession {
    fn remote_begin(&self) -> &RemoteBegin {
        &self.remote
    }

    fn accept(
        self: Box<Self>,
        params: BeginParams,
        events: Weak<dyn SessionEvents>,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        let Attachment { broker, id: conn_id } =
            self.conn.attachment().ok_or(TransportError::IllegalState)?;
        let core = Arc::new(SessionCore {
            conn: self.conn.clone(),
            params,
            events,
            state: Mutex::new(SessionState::BeginSent),
            id: Mutex::new(None),
        });
        let (id, _, _) = broker.begin(conn_id, &core).ok_or(TransportError::Closed)?;
        *core.id.lock() = Some(id);

        let remote = self.remote;
        core.notify(move |events| events.on_remote_begin(remote));
        core.notify_state(SessionState::Begun);
        Ok(Box::new(LocalSession { core }))
    }

    fn reject(self: Box<Self>, error: Option<AmqpError>) {
        trace!(?error, "Incoming session rejected");
    }
}

/* ---------------------------------- Link ---------------------------------- */

struct LinkCore {
    session: Arc<SessionCore>,
    params: AttachParams,
    events: Weak<dyn LinkEvents>,
    state: Mutex<LinkState>,
    id: Mutex<Option<u64>>,
}

impl LinkCore {
    fn broker(&self) -> Option<Arc<BrokerShared>> {
        self.session.conn.attachment().map(|a| a.broker)
    }

    fn notify(&self, callback: impl FnOnce(&dyn LinkEvents) + Send + 'static) {
        let events = self.events.clone();
        self.session.conn.dispatcher.dispatch(move || {
            if let Some(events) = events.upgrade() {
                callback(&*events)
            }
        })
    }

    fn notify_state(&self, new_state: LinkState) {
        let old_state = std::mem::replace(&mut *self.state.lock(), new_state);
        self.notify(move |events| events.on_state_changed(new_state, old_state));
    }

    fn notify_transfer(&self, delivery_id: DeliveryNumber, message: AmqpMessage) {
        self.notify(move |events| events.on_transfer(delivery_id, message))
    }

    fn notify_disposition(&self, delivery_id: DeliveryNumber, outcome: DeliveryOutcome) {
        self.notify(move |events| events.on_disposition(delivery_id, outcome))
    }

    fn notify_remote_detach(&self, error: AmqpError) {
        self.notify(move |events| events.on_remote_detach(true, Some(error)));
        self.notify_state(LinkState::Error);
    }
}

struct LocalLink {
    core: Arc<LinkCore>,
}

impl LocalLink {
    fn attached(&self) -> Result<(Arc<BrokerShared>, u64), TransportError> {
        let id = (*self.core.id.lock()).ok_or(TransportError::IllegalState)?;
        let broker = self.core.broker().ok_or(TransportError::Closed)?;
        Ok((broker, id))
    }
}

impl LinkTransport for LocalLink {
    fn attach(&self) -> Result<(), TransportError> {
        let core = &self.core;
        let session_id = core.session.id().ok_or(TransportError::IllegalState)?;
        let broker = core.broker().ok_or(TransportError::Closed)?;
        if core.id.lock().is_some() {
            return Err(TransportError::IllegalState);
        }

        core.notify_state(LinkState::Attaching);
        let (id, remote, unresponsive) = broker
            .attach(session_id, core)
            .ok_or(TransportError::Closed)?;
        *core.id.lock() = Some(id);

        if !unresponsive {
            core.notify(move |events| events.on_remote_attach(remote));
            core.notify_state(LinkState::Attached);
        }
        Ok(())
    }

    fn detach(&self, closed: bool, error: Option<AmqpError>) -> Result<(), TransportError> {
        let core = &self.core;
        let id = core.id.lock().take().ok_or(TransportError::IllegalState)?;
        core.notify_state(LinkState::DetachSent);

        if let Some(broker) = core.broker() {
            if broker.detach(id, error) {
                return Ok(());
            }
        }

        core.notify(move |events| events.on_remote_detach(closed, None));
        core.notify_state(match closed {
            true => LinkState::Closed,
            false => LinkState::Detached,
        });
        Ok(())
    }

    fn transfer(
        &self,
        delivery_id: DeliveryNumber,
        message: AmqpMessage,
        settled: bool,
    ) -> Result<(), TransportError> {
        let (broker, id) = self.attached()?;
        broker.transfer(id, delivery_id, message, settled)
    }

    fn flow(&self, link_credit: u32) -> Result<(), TransportError> {
        let (broker, id) = self.attached()?;
        broker.flow(id, link_credit)
    }

    fn disposition(
        &self,
        delivery_id: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError> {
        let (broker, id) = self.attached()?;
        broker.disposition(id, delivery_id, outcome)
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        let id = self.core.id.lock().take();
        if let Some(id) = id {
            if let Some(broker) = self.core.broker() {
                broker.detach(id, None);
            }
        }
    }
}

/* ----------------------------------- CBS ---------------------------------- */

struct LocalCbs {
    session: Arc<SessionCore>,
    events: Weak<dyn CbsEvents>,
    attached: Mutex<bool>,
}

impl LocalCbs {
    fn notify(&self, callback: impl FnOnce(&dyn CbsEvents) + Send + 'static) {
        let events = self.events.clone();
        self.session.conn.dispatcher.dispatch(move || {
            if let Some(events) = events.upgrade() {
                callback(&*events)
            }
        })
    }

    fn connection(&self) -> Result<(Arc<BrokerShared>, u64), TransportError> {
        self.session.id().ok_or(TransportError::IllegalState)?;
        let Attachment { broker, id } = self
            .session
            .conn
            .attachment()
            .ok_or(TransportError::Closed)?;
        Ok((broker, id))
    }
}

impl CbsTransport for LocalCbs {
    fn open(&self) -> Result<(), TransportError> {
        let (broker, conn) = self.connection()?;
        {
            let mut attached = self.attached.lock();
            if *attached {
                return Err(TransportError::IllegalState);
            }
            *attached = true;
        }

        trace!(node = CBS_NODE_ADDR, "Local CBS client attaching");
        match broker.is_responsive(conn) {
            Some(true) => self.notify(|events| events.on_cbs_opened(Ok(()))),
            Some(false) => {}
            None => self.notify(|events| events.on_cbs_opened(Err(TransportError::Closed))),
        }
        Ok(())
    }

    fn put_token(&self, name: String, token: CbsToken<'static>) -> Result<(), TransportError> {
        if !*self.attached.lock() {
            return Err(TransportError::IllegalState);
        }
        let (broker, conn) = self.connection()?;
        if let Some(result) = broker.put_token(conn, name, &token) {
            self.notify(move |events| events.on_token_put(result));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        if !std::mem::take(&mut *self.attached.lock()) {
            return Err(TransportError::IllegalState);
        }
        let responsive = self
            .connection()
            .ok()
            .and_then(|(broker, conn)| broker.is_responsive(conn));
        if responsive != Some(false) {
            self.notify(|events| events.on_cbs_closed(Ok(())));
        }
        Ok(())
    }
}
