//! Per-worker message router.
//!
//! The router owns everything a single shard knows: its attached
//! connections, the usernames bound to them, and a cache of local group
//! membership. Destination resolution is local-first; anything this shard
//! cannot deliver itself is handed to the coordinator, fire-and-forget.

use crate::channel::Channel;
use crate::coordinator::CoordinatorHandle;
use crate::error::RoutingError;
use crate::registry::{ClientSink, ConnectionId, ConnectionRegistry};
use crate::worker::DisconnectReason;
use beacon_protocol::{ControlMessage, Envelope, GroupName, Relay, UserState, WorkerId};
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

/// Routing and presence logic for one worker shard.
///
/// All methods run on the owning worker's event loop; there is no concurrent
/// access within a shard.
pub struct Router {
    worker: WorkerId,
    registry: ConnectionRegistry,
    /// Local bindings: username → owning connection. Doubles as the
    /// best-effort cache that short-circuits co-located delivery.
    local_users: HashMap<String, ConnectionId>,
    /// Group membership of local users, populated by coordinator
    /// notifications.
    local_groups: HashMap<String, GroupName>,
    coordinator: CoordinatorHandle,
}

impl Router {
    #[must_use]
    pub fn new(worker: WorkerId, coordinator: CoordinatorHandle) -> Self {
        Self {
            worker,
            registry: ConnectionRegistry::new(),
            local_users: HashMap::new(),
            local_groups: HashMap::new(),
            coordinator,
        }
    }

    /// The shard this router belongs to.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Number of connections attached to this shard.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// A new transport connection was accepted.
    pub fn on_connect(&mut self, connection: ConnectionId, sink: ClientSink) {
        debug!(worker = %self.worker, connection = %connection, "connection accepted");
        self.registry.insert(connection, sink);
    }

    /// A transport connection closed. Triggers deregistration exactly once
    /// if the connection still held a binding.
    pub fn on_disconnect(&mut self, connection: ConnectionId, reason: DisconnectReason) {
        let username = self.registry.remove(connection);
        debug!(worker = %self.worker, connection = %connection, reason = %reason, "connection closed");
        if let Some(username) = username {
            self.deregister(&username);
        }
    }

    /// Handle an inbound client envelope.
    pub async fn on_message(&mut self, connection: ConnectionId, envelope: Envelope) {
        match envelope {
            Envelope::Register { from } => self.register(connection, from).await,
            Envelope::Deregister { from } => self.client_deregister(connection, &from),
            Envelope::Relay(relay) => self.relay(connection, relay),
            // Server-originated kinds carry no meaning inbound.
            Envelope::Ack { .. } | Envelope::User { .. } => {
                trace!(connection = %connection, "ignoring server-only envelope from client");
            }
        }
    }

    /// Handle a control message from the coordinator.
    pub fn on_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::WorkerForward { data } => self.deliver_forwarded(data),
            ControlMessage::Broadcast { data, group_name } => self.broadcast(data, group_name),
            ControlMessage::GroupRegister {
                username,
                group_name,
            } => {
                if self.local_users.contains_key(&username) {
                    debug!(worker = %self.worker, username = %username, group = %group_name, "group membership cached");
                    self.local_groups.insert(username, group_name);
                } else {
                    debug!(username = %username, "group registration for a user no longer local");
                }
            }
            ControlMessage::User { .. } => {
                trace!(worker = %self.worker, "ignoring user-state event addressed to the coordinator");
            }
        }
    }

    async fn register(&mut self, connection: ConnectionId, from: String) {
        let verdict = if self.registry.username(connection).is_some() {
            // One registration per connection.
            Err(RoutingError::DuplicateUser(from.clone()))
        } else if self.local_users.contains_key(&from) {
            // Local fast path; the system-wide check is the coordinator claim.
            Err(RoutingError::DuplicateUser(from.clone()))
        } else {
            self.coordinator.claim(from.clone(), self.worker).await
        };

        match verdict {
            Ok(()) => {
                self.registry.bind(connection, &from);
                self.local_users.insert(from.clone(), connection);
                self.send_to(connection, Envelope::ack(true, &from));
                info!(worker = %self.worker, username = %from, "user registered");
                self.publish_presence(UserState {
                    username: from,
                    connected: true,
                    group: None,
                });
            }
            Err(err) => {
                debug!(worker = %self.worker, username = %from, error = %err, "registration refused");
                self.send_to(connection, Envelope::ack(false, &from));
            }
        }
    }

    /// Explicit deregistration from a client. Only honored from the
    /// connection that owns the binding; anything else is dropped.
    fn client_deregister(&mut self, connection: ConnectionId, from: &str) {
        match self.local_users.get(from) {
            Some(owner) if *owner == connection => {
                self.registry.unbind(connection);
                self.deregister(from);
            }
            _ => {
                trace!(connection = %connection, username = %from, "ignoring deregister from non-owner");
            }
        }
    }

    /// Remove a local binding and notify the coordinator. Idempotent: a
    /// second call for the same username is a no-op.
    fn deregister(&mut self, username: &str) {
        let Some(_connection) = self.local_users.remove(username) else {
            return;
        };
        let group = self.local_groups.remove(username);
        info!(worker = %self.worker, username = %username, "user deregistered");
        self.publish_presence(UserState {
            username: username.to_string(),
            connected: false,
            group,
        });
    }

    fn relay(&mut self, connection: ConnectionId, relay: Relay) {
        // Only the locally bound owner of `from` may relay; spoofed or
        // unregistered senders are dropped without an error.
        if self.local_users.get(&relay.from) != Some(&connection) {
            trace!(connection = %connection, from = %relay.from, "dropping relay from unbound sender");
            return;
        }
        let Some(recipients) = relay.to.clone() else {
            trace!(from = %relay.from, kind = %relay.kind, "relay without recipients");
            return;
        };

        // Each recipient resolves independently; one unreachable entry never
        // aborts delivery to the rest.
        for recipient in recipients.iter() {
            if let Some(target) = self.local_users.get(recipient) {
                // Co-located: deliver directly, the coordinator never sees it.
                self.send_to(*target, Envelope::Relay(relay.clone()));
            } else if let Err(err) = self.coordinator.send(ControlMessage::WorkerForward {
                data: Envelope::Relay(relay.with_recipient(recipient)),
            }) {
                warn!(recipient = %recipient, error = %err, "forward lost");
            }
        }
    }

    fn deliver_forwarded(&self, data: Envelope) {
        let Some(recipients) = data.recipients().cloned() else {
            trace!("forwarded envelope without recipients");
            return;
        };
        for recipient in recipients.iter() {
            match self.local_users.get(recipient) {
                Some(target) => self.send_to(*target, data.clone()),
                // The destination vanished between routing and delivery; the
                // message is dropped with no notice to the sender.
                None => {
                    debug!(worker = %self.worker, recipient = %recipient, "dropping forwarded envelope for departed user");
                }
            }
        }
    }

    /// Re-broadcast a fanned-out event to local registered clients in scope.
    fn broadcast(&self, data: Envelope, scope: Option<GroupName>) {
        for (username, connection) in &self.local_users {
            if let Some(group) = scope {
                if self.local_groups.get(username).copied() != Some(group) {
                    continue;
                }
            }
            self.send_to(*connection, data.clone());
        }
    }

    fn send_to(&self, connection: ConnectionId, envelope: Envelope) {
        if let Some(sink) = self.registry.sink(connection) {
            sink.send(envelope);
        }
    }

    fn publish_presence(&self, state: UserState) {
        if let Err(err) = self.coordinator.send(ControlMessage::User {
            pid: self.worker,
            data: state,
        }) {
            warn!(worker = %self.worker, error = %err, "presence event lost");
        }
    }
}
