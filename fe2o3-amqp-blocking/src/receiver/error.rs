use crate::{
    connection::AuthenticationError,
    error::AmqpError,
    link::{AttachError, DetachError},
    queue::WaitError,
    session::AllocLinkError,
};

use super::MessageReceiverState;

/// Error opening a receiver
#[derive(Debug, thiserror::Error)]
pub enum ReceiverOpenError {
    /// The receiver was already opened
    #[error("Illegal receiver state {0:?}")]
    IllegalState(MessageReceiverState),

    /// The source address could not be authenticated
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// The link could not be created
    #[error(transparent)]
    Alloc(#[from] AllocLinkError),

    /// The link could not be attached
    #[error(transparent)]
    Attach(#[from] AttachError),

    /// The peer refused or detached the link
    #[error("Remote error {0}")]
    Remote(AmqpError),

    /// The wait for the peer was cancelled. The receiver is left in
    /// [`MessageReceiverState::Error`]
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error receiving a message
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// The receiver is not open
    #[error("Illegal receiver state {0:?}")]
    IllegalState(MessageReceiverState),

    /// The link was detached
    #[error("Link detached {0}")]
    Detached(AmqpError),

    /// No message arrived before the wait ended
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error closing a receiver
#[derive(Debug, thiserror::Error)]
pub enum ReceiverCloseError {
    /// The receiver is not open
    #[error("Illegal receiver state {0:?}")]
    IllegalState(MessageReceiverState),

    /// The link could not be detached
    #[error(transparent)]
    Detach(#[from] DetachError),
}
