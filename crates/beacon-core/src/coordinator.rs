//! The coordinator: single point of authority for routing and presence.
//!
//! One coordinator task serves the whole cluster. It owns the authoritative
//! [`PresenceTable`] and [`GroupIndex`], processes one inbound event at a
//! time, and only ever talks back to workers through fire-and-forget channel
//! sends. Serializing every presence mutation through this task is what keeps
//! registration race-free without any distributed consensus.

use crate::channel::{self, Channel, ChannelError, Mailbox, MailboxSender};
use crate::cluster::{BroadcastPolicy, ClusterConfig};
use crate::error::RoutingError;
use crate::presence::{GroupIndex, PresenceTable};
use beacon_protocol::{ControlMessage, Envelope, GroupName, UserState, WorkerId};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Fan-out scope for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every worker, every registered client.
    All,
    /// Members of one group only.
    Group(GroupName),
}

/// Coordinator counters, exposed for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Usernames currently present in the routing table.
    pub registered_users: usize,
    /// Envelopes forwarded to an owning worker.
    pub forwards: u64,
    /// Envelopes dropped because no routing entry existed.
    pub unroutable: u64,
    /// Fan-out rounds delivered to the worker set.
    pub fan_outs: u64,
}

/// Requests on the coordinator mailbox. Fire-and-forget traffic arrives as
/// [`ControlMessage`]; registration and admin queries carry a reply slot.
pub(crate) enum CoordinatorEvent {
    Control(ControlMessage),
    Claim {
        username: String,
        worker: WorkerId,
        reply: oneshot::Sender<Result<(), RoutingError>>,
    },
    RegisterGroup {
        username: String,
        group: GroupName,
        reply: oneshot::Sender<Result<(), RoutingError>>,
    },
    IsRegistered {
        username: String,
        reply: oneshot::Sender<bool>,
    },
    ListActive {
        group: Option<GroupName>,
        reply: oneshot::Sender<Vec<String>>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

/// Clonable handle to the coordinator task.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: MailboxSender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub(crate) fn new(tx: MailboxSender<CoordinatorEvent>) -> Self {
        Self { tx }
    }

    /// Atomically check-and-record a username claim for `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateUser`] if the username is live
    /// anywhere, or [`RoutingError::ChannelUnavailable`] if the coordinator
    /// is gone.
    pub async fn claim(&self, username: String, worker: WorkerId) -> Result<(), RoutingError> {
        self.call(move |reply| CoordinatorEvent::Claim {
            username,
            worker,
            reply,
        })
        .await?
    }

    /// Record group membership for a registered user.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidGroup`] or
    /// [`RoutingError::UserNotRegistered`] as structured failures;
    /// [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn register_group(
        &self,
        username: String,
        group: GroupName,
    ) -> Result<(), RoutingError> {
        self.call(move |reply| CoordinatorEvent::RegisterGroup {
            username,
            group,
            reply,
        })
        .await?
    }

    /// Whether a username is currently registered anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn is_registered(&self, username: String) -> Result<bool, RoutingError> {
        self.call(move |reply| CoordinatorEvent::IsRegistered { username, reply })
            .await
    }

    /// Active usernames, optionally restricted to one group, in
    /// lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn list_active(&self, group: Option<GroupName>) -> Result<Vec<String>, RoutingError> {
        self.call(move |reply| CoordinatorEvent::ListActive { group, reply })
            .await
    }

    /// Current coordinator counters.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ChannelUnavailable`] if the coordinator is gone.
    pub async fn stats(&self) -> Result<CoordinatorStats, RoutingError> {
        self.call(|reply| CoordinatorEvent::Stats { reply }).await
    }

    async fn call<R>(
        &self,
        event: impl FnOnce(oneshot::Sender<R>) -> CoordinatorEvent,
    ) -> Result<R, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(event(reply))?;
        rx.await
            .map_err(|_| RoutingError::ChannelUnavailable(ChannelError::Closed))
    }
}

impl Channel<ControlMessage> for CoordinatorHandle {
    fn send(&self, message: ControlMessage) -> Result<(), ChannelError> {
        self.tx.send(CoordinatorEvent::Control(message))
    }
}

/// The coordinator task.
pub struct Coordinator {
    config: ClusterConfig,
    workers: Vec<Box<dyn Channel<ControlMessage>>>,
    table: PresenceTable,
    groups: GroupIndex,
    stats: CoordinatorStats,
    events: Mailbox<CoordinatorEvent>,
}

impl Coordinator {
    /// Spawn the coordinator task over the given worker channels and return
    /// its handle. Worker index in `workers` must match its [`WorkerId`].
    #[must_use]
    pub fn spawn(
        config: ClusterConfig,
        workers: Vec<Box<dyn Channel<ControlMessage>>>,
    ) -> CoordinatorHandle {
        let (handle, start) = Self::deferred(config);
        start(workers);
        handle
    }

    /// Split construction for the worker/coordinator wiring cycle: the handle
    /// exists immediately (workers are spawned against it), the task itself
    /// starts once the worker channels are known. Messages sent in between
    /// simply queue in the mailbox.
    pub(crate) fn deferred(
        config: ClusterConfig,
    ) -> (
        CoordinatorHandle,
        impl FnOnce(Vec<Box<dyn Channel<ControlMessage>>>),
    ) {
        let (tx, events) = channel::mailbox();
        let start = move |workers: Vec<Box<dyn Channel<ControlMessage>>>| {
            let coordinator = Coordinator {
                config,
                workers,
                table: PresenceTable::new(),
                groups: GroupIndex::new(),
                stats: CoordinatorStats::default(),
                events,
            };
            tokio::spawn(coordinator.run());
        };
        (CoordinatorHandle::new(tx), start)
    }

    async fn run(mut self) {
        info!(workers = self.workers.len(), "coordinator started");
        while let Some(event) = self.events.recv().await {
            self.dispatch(event);
        }
        debug!("coordinator mailbox closed");
    }

    fn dispatch(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Control(message) => self.on_control(message),
            CoordinatorEvent::Claim {
                username,
                worker,
                reply,
            } => {
                let _ = reply.send(self.table.claim(&username, worker));
            }
            CoordinatorEvent::RegisterGroup {
                username,
                group,
                reply,
            } => {
                let _ = reply.send(self.register_group(&username, group));
            }
            CoordinatorEvent::IsRegistered { username, reply } => {
                let _ = reply.send(self.table.contains(&username));
            }
            CoordinatorEvent::ListActive { group, reply } => {
                let _ = reply.send(self.list_active(group));
            }
            CoordinatorEvent::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.registered_users = self.table.len();
                let _ = reply.send(stats);
            }
        }
    }

    fn on_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::User { pid, data } => self.on_user_state(pid, data),
            ControlMessage::WorkerForward { data } => self.forward(data),
            ControlMessage::Broadcast { data, group_name } => {
                self.fan_out(data, group_name.map_or(Scope::All, Scope::Group));
            }
            ControlMessage::GroupRegister { username, .. } => {
                debug!(username = %username, "ignoring group-register addressed to a worker");
            }
        }
    }

    fn on_user_state(&mut self, worker: WorkerId, state: UserState) {
        if state.connected {
            // The location was already recorded by the claim; this event only
            // triggers the presence broadcast.
            debug!(username = %state.username, worker = %worker, "user connected");
            self.broadcast_presence(Envelope::user(true, &state.username), Scope::All);
        } else {
            // Retraction is idempotent: a second deregister finds no entry
            // and emits nothing.
            let Some(location) = self.table.retract(&state.username) else {
                trace!(username = %state.username, "retraction for unknown user");
                return;
            };
            if let Some(group) = location.group {
                self.groups.remove(group, &state.username);
            }
            debug!(username = %state.username, worker = %worker, "user disconnected");
            let scope = location.group.map_or(Scope::All, Scope::Group);
            self.broadcast_presence(Envelope::user(false, &state.username), scope);
        }
    }

    /// Route a relayed envelope to the worker owning each recipient.
    fn forward(&mut self, data: Envelope) {
        let Envelope::Relay(relay) = data else {
            debug!(kind = %data.kind(), "refusing to forward a non-relay envelope");
            return;
        };
        let Some(recipients) = relay.to.clone() else {
            debug!(from = %relay.from, "forward request without recipients");
            return;
        };

        for recipient in recipients.iter() {
            let Some(location) = self.table.get(recipient) else {
                // Fire-and-forget: the sender is never told.
                self.stats.unroutable += 1;
                let err = RoutingError::RecipientUnreachable(recipient.to_string());
                debug!(error = %err, "dropping envelope");
                continue;
            };
            let worker = location.worker;
            let message = ControlMessage::WorkerForward {
                data: Envelope::Relay(relay.with_recipient(recipient)),
            };
            match self.workers.get(worker.0) {
                Some(link) => match link.send(message) {
                    Ok(()) => self.stats.forwards += 1,
                    Err(err) => {
                        warn!(recipient = %recipient, worker = %worker, error = %err, "forward channel unavailable");
                    }
                },
                None => warn!(worker = %worker, "routing entry points at an unknown worker"),
            }
        }
    }

    fn register_group(&mut self, username: &str, group: GroupName) -> Result<(), RoutingError> {
        if !self.config.groups.contains(&group) {
            return Err(RoutingError::InvalidGroup(group.to_string()));
        }
        let Some(location) = self.table.get(username) else {
            return Err(RoutingError::UserNotRegistered(username.to_string()));
        };
        let owner = location.worker;
        let previous = location.group;

        // Last join wins: evict the stale membership first.
        if let Some(previous) = previous {
            self.groups.remove(previous, username);
        }
        self.groups.insert(group, username);
        self.table.set_group(username, Some(group));
        info!(username = %username, group = %group, "group membership recorded");

        // Cache update to the owning worker rides the same channel as the
        // broadcast below, so the new member sees its own join event.
        match self.workers.get(owner.0) {
            Some(link) => {
                if let Err(err) = link.send(ControlMessage::GroupRegister {
                    username: username.to_string(),
                    group_name: group,
                }) {
                    warn!(worker = %owner, error = %err, "group cache notification lost");
                }
            }
            None => warn!(worker = %owner, "routing entry points at an unknown worker"),
        }

        self.broadcast_presence(Envelope::user(true, username), Scope::Group(group));
        Ok(())
    }

    fn broadcast_presence(&mut self, event: Envelope, scope: Scope) {
        match self.config.broadcast_policy {
            BroadcastPolicy::All => self.fan_out(event, scope),
            // Contact-scoped delivery is a placeholder: events are withheld.
            BroadcastPolicy::Contacts => {
                trace!(kind = %event.kind(), "presence event withheld under contacts policy");
            }
        }
    }

    /// Deliver an event to every worker in scope; each worker re-broadcasts
    /// to its locally attached clients matching the scope.
    fn fan_out(&mut self, event: Envelope, scope: Scope) {
        self.stats.fan_outs += 1;
        let group_name = match scope {
            Scope::All => None,
            Scope::Group(group) => Some(group),
        };
        for (index, worker) in self.workers.iter().enumerate() {
            if let Err(err) = worker.send(ControlMessage::Broadcast {
                data: event.clone(),
                group_name,
            }) {
                warn!(worker = index, error = %err, "fan-out send failed");
            }
        }
    }

    fn list_active(&self, group: Option<GroupName>) -> Vec<String> {
        match group {
            Some(group) => self.groups.members(group).map(str::to_owned).collect(),
            None => self.table.usernames().map(str::to_owned).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mailbox;
    use beacon_protocol::{Recipients, Relay};

    /// Coordinator wired to recording worker channels.
    fn coordinator_fixture(
        workers: usize,
        config: ClusterConfig,
    ) -> (CoordinatorHandle, Vec<Mailbox<ControlMessage>>) {
        let mut links: Vec<Box<dyn Channel<ControlMessage>>> = Vec::new();
        let mut mailboxes = Vec::new();
        for _ in 0..workers {
            let (tx, rx) = mailbox();
            links.push(Box::new(tx));
            mailboxes.push(rx);
        }
        (Coordinator::spawn(config, links), mailboxes)
    }

    fn two_worker_config() -> ClusterConfig {
        ClusterConfig {
            shards: 2,
            ..ClusterConfig::default()
        }
    }

    fn offer(from: &str, to: &str) -> Envelope {
        Envelope::Relay(Relay::new("offer", from, to))
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (handle, _mailboxes) = coordinator_fixture(2, two_worker_config());

        handle.claim("carol".to_string(), WorkerId(0)).await.unwrap();
        let second = handle.claim("carol".to_string(), WorkerId(1)).await;
        assert!(matches!(second, Err(RoutingError::DuplicateUser(_))));

        assert!(handle.is_registered("carol".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_forward_routes_to_owning_worker() {
        let (handle, mut mailboxes) = coordinator_fixture(2, two_worker_config());

        handle.claim("bob".to_string(), WorkerId(1)).await.unwrap();
        handle
            .send(ControlMessage::WorkerForward {
                data: offer("alice", "bob"),
            })
            .unwrap();

        let delivered = mailboxes[1].recv().await.unwrap();
        assert_eq!(
            delivered,
            ControlMessage::WorkerForward {
                data: offer("alice", "bob"),
            }
        );
        assert_eq!(handle.stats().await.unwrap().forwards, 1);
    }

    #[tokio::test]
    async fn test_forward_narrows_multicast_per_recipient() {
        let (handle, mut mailboxes) = coordinator_fixture(2, two_worker_config());

        handle.claim("bob".to_string(), WorkerId(0)).await.unwrap();
        handle.claim("carol".to_string(), WorkerId(1)).await.unwrap();

        let relay = Relay::new("text", "alice", Recipients::Many(vec![
            "bob".to_string(),
            "carol".to_string(),
        ]));
        handle
            .send(ControlMessage::WorkerForward {
                data: Envelope::Relay(relay.clone()),
            })
            .unwrap();

        let to_w0 = mailboxes[0].recv().await.unwrap();
        assert_eq!(
            to_w0,
            ControlMessage::WorkerForward {
                data: Envelope::Relay(relay.with_recipient("bob")),
            }
        );
        let to_w1 = mailboxes[1].recv().await.unwrap();
        assert_eq!(
            to_w1,
            ControlMessage::WorkerForward {
                data: Envelope::Relay(relay.with_recipient("carol")),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_dropped_silently() {
        let (handle, _mailboxes) = coordinator_fixture(2, two_worker_config());

        handle
            .send(ControlMessage::WorkerForward {
                data: offer("alice", "nobody"),
            })
            .unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.unroutable, 1);
        assert_eq!(stats.forwards, 0);
    }

    #[tokio::test]
    async fn test_disconnect_fans_out_to_all() {
        let (handle, mut mailboxes) = coordinator_fixture(2, two_worker_config());

        handle.claim("alice".to_string(), WorkerId(0)).await.unwrap();
        handle
            .send(ControlMessage::User {
                pid: WorkerId(0),
                data: UserState {
                    username: "alice".to_string(),
                    connected: false,
                    group: None,
                },
            })
            .unwrap();

        for mailbox in &mut mailboxes {
            assert_eq!(
                mailbox.recv().await.unwrap(),
                ControlMessage::Broadcast {
                    data: Envelope::user(false, "alice"),
                    group_name: None,
                }
            );
        }
        assert!(!handle.is_registered("alice".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_of_grouped_user_is_group_scoped() {
        let (handle, mut mailboxes) = coordinator_fixture(1, ClusterConfig::default());

        handle.claim("alice".to_string(), WorkerId(0)).await.unwrap();
        handle
            .register_group("alice".to_string(), GroupName::P2p)
            .await
            .unwrap();
        // Drain the cache notification and join broadcast.
        assert!(matches!(
            mailboxes[0].recv().await.unwrap(),
            ControlMessage::GroupRegister { .. }
        ));
        assert!(matches!(
            mailboxes[0].recv().await.unwrap(),
            ControlMessage::Broadcast { .. }
        ));

        handle
            .send(ControlMessage::User {
                pid: WorkerId(0),
                data: UserState {
                    username: "alice".to_string(),
                    connected: false,
                    group: Some(GroupName::P2p),
                },
            })
            .unwrap();

        assert_eq!(
            mailboxes[0].recv().await.unwrap(),
            ControlMessage::Broadcast {
                data: Envelope::user(false, "alice"),
                group_name: Some(GroupName::P2p),
            }
        );
    }

    #[tokio::test]
    async fn test_register_group_validates() {
        let (handle, _mailboxes) = coordinator_fixture(1, ClusterConfig::default());

        // FileTransfer exists in the protocol but is not enabled by default.
        let invalid = handle
            .register_group("alice".to_string(), GroupName::FileTransfer)
            .await;
        assert!(matches!(invalid, Err(RoutingError::InvalidGroup(_))));

        let unregistered = handle
            .register_group("alice".to_string(), GroupName::P2p)
            .await;
        assert!(matches!(
            unregistered,
            Err(RoutingError::UserNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_group_switch_evicts_stale_membership() {
        let (handle, mut mailboxes) = coordinator_fixture(1, ClusterConfig::default());

        handle.claim("alice".to_string(), WorkerId(0)).await.unwrap();
        handle
            .register_group("alice".to_string(), GroupName::P2p)
            .await
            .unwrap();
        handle
            .register_group("alice".to_string(), GroupName::GroupChat)
            .await
            .unwrap();

        assert_eq!(
            handle.list_active(Some(GroupName::P2p)).await.unwrap(),
            Vec::<String>::new()
        );
        assert_eq!(
            handle.list_active(Some(GroupName::GroupChat)).await.unwrap(),
            vec!["alice".to_string()]
        );

        // Cache notification precedes the join broadcast for each join.
        assert!(matches!(
            mailboxes[0].recv().await.unwrap(),
            ControlMessage::GroupRegister {
                group_name: GroupName::P2p,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_contacts_policy_withholds_presence() {
        let config = ClusterConfig {
            shards: 1,
            broadcast_policy: BroadcastPolicy::Contacts,
            ..ClusterConfig::default()
        };
        let (handle, _mailboxes) = coordinator_fixture(1, config);

        handle.claim("alice".to_string(), WorkerId(0)).await.unwrap();
        handle
            .send(ControlMessage::User {
                pid: WorkerId(0),
                data: UserState {
                    username: "alice".to_string(),
                    connected: true,
                    group: None,
                },
            })
            .unwrap();

        assert_eq!(handle.stats().await.unwrap().fan_outs, 0);
    }

    #[tokio::test]
    async fn test_list_active_is_ordered() {
        let (handle, _mailboxes) = coordinator_fixture(1, ClusterConfig::default());

        for name in ["carol", "alice", "bob"] {
            handle.claim(name.to_string(), WorkerId(0)).await.unwrap();
        }

        assert_eq!(
            handle.list_active(None).await.unwrap(),
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]
        );
    }
}
