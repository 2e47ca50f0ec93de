//! Worker shard event loop.
//!
//! A worker is one single-threaded task owning a [`Router`] and draining one
//! mailbox. Client lifecycle events from the I/O layer and control messages
//! from the coordinator arrive on the same mailbox, so each sender's ordering
//! is preserved and nothing in a shard ever runs concurrently.

use crate::channel::{self, Channel, ChannelError, Mailbox, MailboxSender};
use crate::coordinator::CoordinatorHandle;
use crate::registry::{ClientSink, ConnectionId};
use crate::router::Router;
use beacon_protocol::{ControlMessage, Envelope, WorkerId};
use std::fmt;
use tracing::debug;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport closed cleanly.
    Closed,
    /// The transport failed.
    Error,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed"),
            DisconnectReason::Error => f.write_str("error"),
        }
    }
}

/// Everything that can land in a worker's mailbox.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A transport connection was accepted for this shard.
    Connect {
        connection: ConnectionId,
        sink: ClientSink,
    },
    /// An envelope arrived from an attached client.
    Message {
        connection: ConnectionId,
        envelope: Envelope,
    },
    /// An attached connection went away.
    Disconnect {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    /// A control message from the coordinator.
    Control(ControlMessage),
}

/// One worker shard task.
pub struct Worker {
    id: WorkerId,
    router: Router,
    events: Mailbox<WorkerEvent>,
}

impl Worker {
    /// Spawn a worker task and return its handle.
    #[must_use]
    pub fn spawn(id: WorkerId, coordinator: CoordinatorHandle) -> WorkerHandle {
        let (tx, events) = channel::mailbox();
        let worker = Worker {
            id,
            router: Router::new(id, coordinator),
            events,
        };
        tokio::spawn(worker.run());
        WorkerHandle { id, tx }
    }

    async fn run(mut self) {
        debug!(worker = %self.id, "worker started");
        while let Some(event) = self.events.recv().await {
            self.dispatch(event).await;
        }
        debug!(worker = %self.id, "worker mailbox closed");
    }

    async fn dispatch(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Connect { connection, sink } => self.router.on_connect(connection, sink),
            WorkerEvent::Message {
                connection,
                envelope,
            } => self.router.on_message(connection, envelope).await,
            WorkerEvent::Disconnect { connection, reason } => {
                self.router.on_disconnect(connection, reason);
            }
            WorkerEvent::Control(message) => self.router.on_control(message),
        }
    }
}

/// Clonable handle to one worker's mailbox.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: MailboxSender<WorkerEvent>,
}

impl WorkerHandle {
    /// The shard this handle addresses.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Hand a newly accepted connection to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the worker is gone.
    pub fn connect(&self, connection: ConnectionId, sink: ClientSink) -> Result<(), ChannelError> {
        self.tx.send(WorkerEvent::Connect { connection, sink })
    }

    /// Deliver an inbound client envelope to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the worker is gone.
    pub fn message(&self, connection: ConnectionId, envelope: Envelope) -> Result<(), ChannelError> {
        self.tx.send(WorkerEvent::Message {
            connection,
            envelope,
        })
    }

    /// Report a closed connection to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the worker is gone.
    pub fn disconnect(
        &self,
        connection: ConnectionId,
        reason: DisconnectReason,
    ) -> Result<(), ChannelError> {
        self.tx.send(WorkerEvent::Disconnect { connection, reason })
    }
}

impl Channel<ControlMessage> for WorkerHandle {
    fn send(&self, message: ControlMessage) -> Result<(), ChannelError> {
        self.tx.send(WorkerEvent::Control(message))
    }
}
