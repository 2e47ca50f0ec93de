//! Error taxonomy for the routing core.

use crate::channel::ChannelError;
use thiserror::Error;

/// Errors produced by the routing and presence core.
///
/// None of these are fatal to a worker or to the coordinator: per-message
/// failures are isolated, and where the protocol demands silence
/// (`RecipientUnreachable`, relay attempts by unregistered senders) the
/// error is logged and the message dropped.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Registration attempted for a username that is live somewhere in the
    /// system.
    #[error("username already registered: {0}")]
    DuplicateUser(String),

    /// An operation that requires registration was attempted for an unbound
    /// username.
    #[error("user not registered: {0}")]
    UserNotRegistered(String),

    /// Group name is not recognized, or not enabled in this deployment.
    #[error("invalid group: {0}")]
    InvalidGroup(String),

    /// No routing entry exists for the destination username.
    #[error("no route to recipient: {0}")]
    RecipientUnreachable(String),

    /// The coordinator or a worker mailbox is gone.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(#[from] ChannelError),
}
