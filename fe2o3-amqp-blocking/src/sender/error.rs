use crate::{
    connection::AuthenticationError,
    context::ContextError,
    engine::TransportError,
    error::AmqpError,
    link::{AttachError, DetachError},
    queue::WaitError,
    session::AllocLinkError,
};

use super::MessageSenderState;

/// Error opening a sender
#[derive(Debug, thiserror::Error)]
pub enum SenderOpenError {
    /// The sender was already opened
    #[error("Illegal sender state {0:?}")]
    IllegalState(MessageSenderState),

    /// The target address could not be authenticated
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

    /// The wait for the peer was cancelled. The sender is left in
    /// [`MessageSenderState::Error`]
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Coarse classification of a failed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The send failed because of the sender, the link or the peer
    Error,

    /// The deadline passed before the message was settled
    Timeout,

    /// The context was cancelled before the message was settled
    Cancelled,
}

/// Error sending a message
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The sender is not open
    #[error("Illegal sender state {0:?}")]
    IllegalState(MessageSenderState),

    /// The encoded message exceeds the negotiated max message size. Nothing was sent
    #[error("Message of {size} bytes exceeds the max message size of {max} bytes")]
    MessageSizeExceeded {
        /// Encoded size of the message
        size: u64,

        /// Negotiated max message size
        max: u64,
    },

    /// The message could not be encoded. Nothing was sent
    #[error("Encode error {0}")]
    Encode(#[from] serde_amqp::Error),

    /// The link was detached before the message was settled
    #[error("Link detached {0}")]
    Detached(AmqpError),

    /// The engine rejected the transfer
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The wait for settlement was cancelled. The message may still be delivered
    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl SendError {
    /// Classifies the failure
    pub fn status(&self) -> SendStatus {
        match self {
            SendError::Wait(WaitError::Context(ContextError::DeadlineExceeded)) => {
                SendStatus::Timeout
            }
            SendError::Wait(WaitError::Context(ContextError::Cancelled)) => SendStatus::Cancelled,
            _ => SendStatus::Error,
        }
    }

    /// The AMQP error carried by the failure, if any
    pub fn amqp_error(&self) -> Option<&AmqpError> {
        match self {
            SendError::Detached(error) => Some(error),
            SendError::Transport(TransportError::Amqp(error)) => Some(error),
            _ => None,
        }
    }
}

/// Error closing a sender
#[derive(Debug, thiserror::Error)]
pub enum SenderCloseError {
    /// The sender is not open
    #[error("Illegal sender state {0:?}")]
    IllegalState(MessageSenderState),

    /// The link could not be detached
    #[error(transparent)]
    Detach(#[from] DetachError),
}
