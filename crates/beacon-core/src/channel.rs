//! Inter-process channel abstraction.
//!
//! Workers and the coordinator communicate exclusively through these
//! channels: asynchronous, at-most-once, FIFO per sender→receiver pair, with
//! no cross-sender ordering and no delivery confirmation. The trait keeps the
//! contract independent of the carrier; the in-process implementation rides
//! on tokio mpsc mailboxes.

use thiserror::Error;
use tokio::sync::mpsc;

/// Channel failures.
///
/// Sends are fire-and-forget, so the only observable failure is a peer whose
/// mailbox no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("peer mailbox is closed")]
    Closed,
}

/// Sending half of an inter-process channel.
///
/// `send` never blocks: implementations queue the message and return
/// immediately. A message accepted here may still be lost if the peer goes
/// away before draining its mailbox (at-most-once delivery).
pub trait Channel<T>: Send + Sync {
    /// Queue `message` for asynchronous delivery to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the peer is gone.
    fn send(&self, message: T) -> Result<(), ChannelError>;
}

/// Create a connected mailbox pair.
#[must_use]
pub fn mailbox<T>() -> (MailboxSender<T>, Mailbox<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MailboxSender(tx), Mailbox(rx))
}

/// mpsc-backed sending half.
pub struct MailboxSender<T>(mpsc::UnboundedSender<T>);

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> std::fmt::Debug for MailboxSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxSender").finish_non_exhaustive()
    }
}

impl<T: Send> Channel<T> for MailboxSender<T> {
    fn send(&self, message: T) -> Result<(), ChannelError> {
        self.0.send(message).map_err(|_| ChannelError::Closed)
    }
}

/// mpsc-backed receiving half.
pub struct Mailbox<T>(mpsc::UnboundedReceiver<T>);

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").finish_non_exhaustive()
    }
}

impl<T> Mailbox<T> {
    /// Receive the next message, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }

    /// Non-blocking receive.
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox is empty or every sender is gone.
    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.0.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mailbox_preserves_sender_order() {
        let (tx, mut rx) = mailbox();

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_send_to_closed_mailbox() {
        let (tx, rx) = mailbox();
        drop(rx);

        assert_eq!(tx.send("lost"), Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_recv_after_senders_dropped() {
        let (tx, mut rx) = mailbox();
        tx.send("last").unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some("last"));
        assert_eq!(rx.recv().await, None);
    }
}
