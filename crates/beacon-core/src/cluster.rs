//! Cluster assembly: one coordinator plus a set of worker shards.
//!
//! This module is the seam the I/O layer talks to. It spawns the topology,
//! assigns new connections to shards round-robin, and exposes the
//! coordinator's administrative queries.

use crate::channel::{Channel, ChannelError};
use crate::coordinator::{Coordinator, CoordinatorHandle, CoordinatorStats};
use crate::error::RoutingError;
use crate::registry::{ClientSink, ConnectionId};
use crate::worker::{DisconnectReason, Worker, WorkerHandle};
use beacon_protocol::{ControlMessage, Envelope, GroupName, WorkerId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Scope of presence fan-out on register/deregister.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPolicy {
    /// Presence events reach every registered client.
    #[default]
    All,
    /// Placeholder for contact-scoped delivery: events are withheld.
    Contacts,
}

/// Cluster topology configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of worker shards.
    pub shards: usize,
    /// Presence fan-out policy.
    pub broadcast_policy: BroadcastPolicy,
    /// Groups enabled in this deployment.
    pub groups: Vec<GroupName>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            broadcast_policy: BroadcastPolicy::All,
            groups: vec![GroupName::P2p, GroupName::GroupChat],
        }
    }
}

fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Handle the I/O layer keeps for one attached connection.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    connection: ConnectionId,
    worker: WorkerHandle,
}

impl ClientConnection {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection
    }

    /// The shard this connection lives on.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker.id()
    }

    /// Deliver an inbound envelope from this connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the owning worker is gone.
    pub fn message(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.worker.message(self.connection, envelope)
    }

    /// Report the connection closed. Best-effort: a dead worker has nothing
    /// left to clean up.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.worker.disconnect(self.connection, reason).is_err() {
            trace!(connection = %self.connection, "disconnect for a worker that is gone");
        }
    }
}

/// Clonable handle to a running cluster.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    workers: Arc<Vec<WorkerHandle>>,
    coordinator: CoordinatorHandle,
    next_shard: Arc<AtomicUsize>,
    next_connection: Arc<AtomicU64>,
}

impl ClusterHandle {
    /// Spawn a coordinator and `config.shards` workers, wired together.
    ///
    /// Tasks run detached for the life of the runtime; the topology is fixed
    /// at spawn time.
    #[must_use]
    pub fn spawn(config: ClusterConfig) -> ClusterHandle {
        let shards = config.shards.max(1);

        // The coordinator handle has to exist before the workers that talk to
        // it; its task starts last, over the workers' channels.
        let (coordinator, spawn_coordinator) = Coordinator::deferred(config);
        let mut workers = Vec::with_capacity(shards);
        let mut links: Vec<Box<dyn Channel<ControlMessage>>> = Vec::with_capacity(shards);
        for shard in 0..shards {
            let handle = Worker::spawn(WorkerId(shard), coordinator.clone());
            links.push(Box::new(handle.clone()));
            workers.push(handle);
        }
        spawn_coordinator(links);

        debug!(shards, "cluster spawned");
        ClusterHandle {
            workers: Arc::new(workers),
            coordinator,
            next_shard: Arc::new(AtomicUsize::new(0)),
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of worker shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.workers.len()
    }

    /// Attach a new client connection, assigning it to the next shard
    /// round-robin.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the chosen worker is gone.
    pub fn connect(&self, sink: ClientSink) -> Result<ClientConnection, ChannelError> {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let connection = ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let worker = self.workers[shard].clone();
        worker.connect(connection, sink)?;
        debug!(connection = %connection, worker = %worker.id(), "connection assigned");
        Ok(ClientConnection { connection, worker })
    }

    /// Whether a username is currently registered anywhere in the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn is_registered(&self, username: impl Into<String>) -> Result<bool, RoutingError> {
        self.coordinator.is_registered(username.into()).await
    }

    /// Active usernames, optionally restricted to one group, in
    /// lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn list_active(&self, group: Option<GroupName>) -> Result<Vec<String>, RoutingError> {
        self.coordinator.list_active(group).await
    }

    /// Join a registered user to a group. Last join wins.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidGroup`] for a disabled group,
    /// [`RoutingError::UserNotRegistered`] for an unknown username, or
    /// [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn register_group(
        &self,
        username: impl Into<String>,
        group: GroupName,
    ) -> Result<(), RoutingError> {
        self.coordinator.register_group(username.into(), group).await
    }

    /// Coordinator counters.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn stats(&self) -> Result<CoordinatorStats, RoutingError> {
        self.coordinator.stats().await
    }
}
