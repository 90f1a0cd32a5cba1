//! Connection builder

use std::{fmt, sync::Arc, time::Duration};

use fe2o3_amqp_types::definitions::Fields;
use url::Url;
use uuid::Uuid;

use crate::{
    constants::{
        AMQPS_PORT, AMQP_PORT, DEFAULT_CHANNEL_MAX, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE,
        MIN_MAX_FRAME_SIZE,
    },
    context::Context,
    credential::TokenCredential,
    engine::Engine,
};

use super::{BuildError, Connection, ConnectionEventHandler, ConnectionImpl, OpenError};

/// Options of a connection
///
/// | Option | Default |
/// |--------|---------|
/// | `container_id` | random v4 uuid |
/// | `hostname` | the host the connection targets |
/// | `port` | 5672, or 5671 for `amqps` |
/// | `max_frame_size` | 256 KiB, never below 512 |
/// | `channel_max` | 255 |
/// | `idle_time_out` | 60 s |
/// | `properties` | `None` |
/// | `authentication_scopes` | empty, in which case the audience is used as the scope |
/// | `enable_trace` | `false` |
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Container id of the local peer
    pub container_id: String,

    /// Hostname sent in the `open` performative
    pub hostname: Option<String>,

    /// Port to connect to
    pub port: Option<u16>,

    /// Largest frame the local peer accepts
    pub max_frame_size: u32,

    /// Highest channel number the local peer accepts
    pub channel_max: u16,

    /// Idle timeout of the local peer
    pub idle_time_out: Option<Duration>,

    /// Connection properties
    pub properties: Option<Fields>,

    /// Scopes requested from the credential when authenticating an audience
    pub authentication_scopes: Vec<String>,

    /// Logs engine callbacks at `debug` instead of `trace`
    pub enable_trace: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            container_id: Uuid::new_v4().to_string(),
            hostname: None,
            port: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            idle_time_out: Some(DEFAULT_IDLE_TIMEOUT),
            properties: None,
            authentication_scopes: Vec::new(),
            enable_trace: false,
        }
    }
}

/// Connection builder
pub struct Builder {
    options: ConnectionOptions,
    scheme: String,
    engine: Option<Arc<dyn Engine>>,
    credential: Option<Arc<dyn TokenCredential>>,
    event_handler: Option<Arc<dyn ConnectionEventHandler>>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("options", &self.options)
            .field("scheme", &self.scheme)
            .field("engine", &self.engine.is_some())
            .field("credential", &self.credential.is_some())
            .field("event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with default options
    pub fn new() -> Self {
        Self {
            options: ConnectionOptions::default(),
            scheme: String::from("amqp"),
            engine: None,
            credential: None,
            event_handler: None,
        }
    }

    /// Replaces every option at once
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Container id of the local peer
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.options.container_id = id.into();
        self
    }

    /// Hostname sent in the `open` performative
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.options.hostname = Some(hostname.into());
        self
    }

    /// Port to connect to
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = Some(port);
        self
    }

    /// Scheme used when the host is not a url, `amqp` by default
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Largest frame the local peer accepts. Values below 512 are raised to 512
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.options.max_frame_size = std::cmp::max(MIN_MAX_FRAME_SIZE, max_frame_size);
        self
    }

    /// Highest channel number the local peer accepts
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.options.channel_max = channel_max;
        self
    }

    /// Idle timeout of the local peer
    pub fn idle_time_out(mut self, idle_time_out: impl Into<Option<Duration>>) -> Self {
        self.options.idle_time_out = idle_time_out.into();
        self
    }

    /// Connection properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.options.properties = Some(properties);
        self
    }

    /// Credential used to authenticate audiences
    pub fn credential(mut self, credential: Arc<dyn TokenCredential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Adds a scope requested from the credential
    pub fn add_authentication_scope(mut self, scope: impl Into<String>) -> Self {
        self.options.authentication_scopes.push(scope.into());
        self
    }

    /// Logs engine callbacks at `debug` instead of `trace`
    pub fn enable_trace(mut self, enable: bool) -> Self {
        self.options.enable_trace = enable;
        self
    }

    /// The engine driving the connection
    pub fn engine(mut self, engine: impl Engine) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// Receives connection level notifications
    pub fn event_handler(mut self, handler: Arc<dyn ConnectionEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Creates the connection without opening it
    ///
    /// `host` is either a hostname or a url such as `amqps://example.com:5671`.
    pub fn build(self, host: &str) -> Result<Connection, BuildError> {
        let engine = self.engine.ok_or(BuildError::EngineNotFound)?;
        let url = match host.contains("://") {
            true => Url::parse(host)?,
            false => Url::parse(&format!("{}://{}", self.scheme, host))?,
        };
        let hostname = url.host_str().ok_or(BuildError::InvalidHost)?.to_string();
        let port = self
            .options
            .port
            .or_else(|| url.port())
            .unwrap_or(match url.scheme() {
                "amqps" => AMQPS_PORT,
                _ => AMQP_PORT,
            });

        let inner = ConnectionImpl::new(
            url.scheme().to_string(),
            hostname,
            port,
            self.options,
            engine,
            self.credential,
            self.event_handler,
        )?;
        inner.finish_construction()?;
        Ok(Connection { inner })
    }

    /// Creates the connection and opens it
    pub fn open(self, host: &str, ctx: &Context) -> Result<Connection, OpenError> {
        let connection = self.build(host)?;
        connection.open(ctx)?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use crate::{constants::MIN_MAX_FRAME_SIZE, engine::local::LocalEngine};

    use super::{BuildError, Builder};

    #[test]
    fn build_without_engine_fails() {
        let result = Builder::new().build("localhost");
        assert!(matches!(assert_err!(result), BuildError::EngineNotFound));
    }

    #[test]
    fn port_defaults_follow_the_scheme() {
        let connection = assert_ok!(Builder::new()
            .engine(LocalEngine::new())
            .build("localhost"));
        assert_eq!(connection.port(), 5672);

        let connection = assert_ok!(Builder::new()
            .engine(LocalEngine::new())
            .build("amqps://localhost"));
        assert_eq!(connection.port(), 5671);

        let connection = assert_ok!(Builder::new()
            .engine(LocalEngine::new())
            .build("amqp://localhost:25672"));
        assert_eq!(connection.port(), 25672);
    }

    #[test]
    fn max_frame_size_has_a_floor() {
        let builder = Builder::new().max_frame_size(16);
        assert_eq!(builder.options.max_frame_size, MIN_MAX_FRAME_SIZE);
    }
}
