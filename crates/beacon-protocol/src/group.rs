//! The fixed group namespace.
//!
//! Group names are a closed set known at compile time; membership is free-form
//! but the namespace itself is not. Deployments choose which subset of the
//! names is enabled (see the cluster configuration in `beacon-core`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a string does not name a known group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown group name: {0}")]
pub struct UnknownGroup(pub String);

/// The closed set of group names the router recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupName {
    P2p,
    GroupChat,
    FileTransfer,
}

impl GroupName {
    /// Every group name the protocol knows about.
    pub const ALL: [GroupName; 3] = [
        GroupName::P2p,
        GroupName::GroupChat,
        GroupName::FileTransfer,
    ];

    /// The wire spelling of this group name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GroupName::P2p => "p2p",
            GroupName::GroupChat => "group_chat",
            GroupName::FileTransfer => "file_transfer",
        }
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupName {
    type Err = UnknownGroup;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2p" => Ok(GroupName::P2p),
            "group_chat" => Ok(GroupName::GroupChat),
            "file_transfer" => Ok(GroupName::FileTransfer),
            other => Err(UnknownGroup(other.to_string())),
        }
    }
}
