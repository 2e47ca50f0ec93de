//! Authoritative presence and group membership tables.
//!
//! Both structures are owned exclusively by the coordinator; workers only
//! ever see copies of individual facts, delivered as control messages.
//! Ordered maps keep active-user listings deterministic.

use crate::error::RoutingError;
use beacon_protocol::{GroupName, WorkerId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Where a username currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// Worker holding the live connection.
    pub worker: WorkerId,
    /// Current group membership, at most one.
    pub group: Option<GroupName>,
}

/// The authoritative `username → location` routing table.
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: BTreeMap<String, Location>,
}

impl PresenceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check-and-record a username claim.
    ///
    /// This is the duplicate-register check followed by `record`; running it
    /// as one step inside the coordinator is what makes registration race-free
    /// across shards.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateUser`] if the username is already
    /// present anywhere in the system.
    pub fn claim(&mut self, username: &str, worker: WorkerId) -> Result<(), RoutingError> {
        if self.entries.contains_key(username) {
            return Err(RoutingError::DuplicateUser(username.to_string()));
        }
        self.record(username, worker);
        Ok(())
    }

    /// Upsert a location. Last writer wins; no conflict detection beyond the
    /// duplicate check performed by [`PresenceTable::claim`].
    pub fn record(&mut self, username: &str, worker: WorkerId) {
        self.entries.insert(
            username.to_string(),
            Location {
                worker,
                group: None,
            },
        );
        debug!(username = %username, worker = %worker, "location recorded");
    }

    /// Remove a username. No-op if absent.
    pub fn retract(&mut self, username: &str) -> Option<Location> {
        let location = self.entries.remove(username);
        if location.is_some() {
            debug!(username = %username, "location retracted");
        }
        location
    }

    #[must_use]
    pub fn get(&self, username: &str) -> Option<&Location> {
        self.entries.get(username)
    }

    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    /// Update a username's group membership. Returns `false` if the username
    /// is not registered.
    pub fn set_group(&mut self, username: &str, group: Option<GroupName>) -> bool {
        match self.entries.get_mut(username) {
            Some(location) => {
                location.group = group;
                true
            }
            None => false,
        }
    }

    /// Registered usernames in lexicographic order.
    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The authoritative `group → members` index.
#[derive(Debug, Default)]
pub struct GroupIndex {
    members: BTreeMap<GroupName, BTreeSet<String>>,
}

impl GroupIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Returns `false` if already present.
    pub fn insert(&mut self, group: GroupName, username: &str) -> bool {
        self.members
            .entry(group)
            .or_default()
            .insert(username.to_string())
    }

    /// Remove a member. Returns `false` if absent.
    pub fn remove(&mut self, group: GroupName, username: &str) -> bool {
        self.members
            .get_mut(&group)
            .is_some_and(|members| members.remove(username))
    }

    #[must_use]
    pub fn contains(&self, group: GroupName, username: &str) -> bool {
        self.members
            .get(&group)
            .is_some_and(|members| members.contains(username))
    }

    /// Members of a group in lexicographic order.
    pub fn members(&self, group: GroupName) -> impl Iterator<Item = &str> {
        self.members
            .get(&group)
            .into_iter()
            .flat_map(|members| members.iter().map(String::as_str))
    }

    #[must_use]
    pub fn count(&self, group: GroupName) -> usize {
        self.members.get(&group).map_or(0, BTreeSet::len)
    }
}
