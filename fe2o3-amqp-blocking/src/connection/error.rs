use std::io;

use crate::{
    cbs::CbsError, credential::CredentialError, engine::TransportError, error::AmqpError,
    queue::WaitError,
};

use super::ConnectionState;

/// Error building a connection
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No engine was supplied to the builder
    #[error("No engine was supplied")]
    EngineNotFound,

    /// The host could not be parsed
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// The host is missing from the url
    #[error("Host is missing from the url")]
    InvalidHost,

    /// The engine execution context could not be started
    #[error("Engine execution context is unavailable {0:?}")]
    Runtime(#[from] io::Error),

    /// The engine failed to create the connection
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error opening a connection
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// The connection could not be built
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The connection is not in a state that allows opening
    #[error("Illegal connection state {0:?}")]
    IllegalState(ConnectionState),

    /// The open failed because of the peer or the transport
    #[error("Remote error {0}")]
    Remote(AmqpError),

    /// The engine rejected the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The wait for the peer was cancelled. The connection is left in
    /// [`ConnectionState::Error`]
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error closing a connection
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    /// The connection is not in a state that allows closing
    #[error("Illegal connection state {0:?}")]
    IllegalState(ConnectionState),

    /// The peer closed with an error
    #[error("Remote error {0}")]
    Remote(AmqpError),

    /// The engine rejected the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The wait for the peer was cancelled. Local resources are released anyway
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error creating a session on a connection
#[derive(Debug, thiserror::Error)]
pub enum CreateSessionError {
    /// The connection is closed
    #[error("Illegal connection state {0:?}")]
    IllegalState(ConnectionState),

    /// Every channel is in use
    #[error("Channel max reached")]
    ChannelMaxReached,

    /// The engine failed to create the session
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error accepting a session begun by the peer
#[derive(Debug, thiserror::Error)]
pub enum AcceptSessionError {
    /// No session was begun before the wait ended
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// The session could not be registered
    #[error(transparent)]
    Create(#[from] CreateSessionError),

    /// The engine failed to answer the peer's `begin`
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session failed before it was usable
    #[error("Remote error {0}")]
    Remote(AmqpError),
}

/// Error authenticating an audience
#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    /// The connection has no credential
    #[error("No credential was supplied to the connection")]
    CredentialNotFound,

    /// The credential failed to produce a token
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The claims-based security exchange failed
    #[error(transparent)]
    Cbs(Box<CbsError>),
}

impl From<CbsError> for AuthenticationError {
    fn from(err: CbsError) -> Self {
        Self::Cbs(Box::new(err))
    }
}
