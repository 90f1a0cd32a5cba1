use crate::{engine::TransportError, error::AmqpError, queue::WaitError};

use super::LinkState;

/// Error attaching a link
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// The link is not detached
    #[error("Illegal link state {0:?}")]
    IllegalState(LinkState),

    /// The peer refused the link
    #[error("Remote error {0}")]
    Remote(AmqpError),

    /// The engine rejected the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The wait for the peer was cancelled. The link is left in [`LinkState::Error`]
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error detaching a link
#[derive(Debug, thiserror::Error)]
pub enum DetachError {
    /// The link is not attached
    #[error("Illegal link state {0:?}")]
    IllegalState(LinkState),

    /// The peer detached with an error
    #[error("Remote error {0}")]
    Remote(AmqpError),

    /// The engine rejected the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The wait for the peer was cancelled. Local resources are released anyway
    #[error(transparent)]
    Wait(#[from] WaitError),
}
