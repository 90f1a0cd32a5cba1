use crate::{engine::TransportError, error::AmqpError, queue::WaitError};

use super::SessionState;

/// Error beginning a session
#[derive(Debug, thiserror::Error)]
pub enum BeginError {
    /// Begin was already called on this session
    #[error("Illegal session state {0:?}")]
    IllegalState(SessionState),

    /// The peer or the transport failed the session
    #[error("Remote error {0}")]
    Remote(AmqpError),

    /// The engine rejected the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The wait for the peer was cancelled. The session is left in
    /// [`SessionState::Error`]
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error ending a session
#[derive(Debug, thiserror::Error)]
pub enum EndError {
    /// The session was never begun
    #[error("The session was never begun")]
    NotBegun,

    /// The session was already ended
    #[error("The session has already been ended")]
    AlreadyEnded,

    /// The peer ended with an error
    #[error("Remote error {0}")]
    Remote(AmqpError),

    /// The engine rejected the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The wait for the peer was cancelled. Local resources are released anyway
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error creating a link on a session
#[derive(Debug, thiserror::Error)]
pub enum AllocLinkError {
    /// The session is not begun
    #[error("Illegal session state {0:?}")]
    IllegalState(SessionState),

    /// Reached the maximum number of links
    #[error("Reached session handle max")]
    HandleMaxReached,

    /// Another live link on the session has the same name
    #[error("Link name must be unique")]
    DuplicatedLinkName,

    /// The engine failed to create the link
    #[error(transparent)]
    Transport(#[from] TransportError),
}
