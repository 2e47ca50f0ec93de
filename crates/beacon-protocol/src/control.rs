//! Control messages exchanged between workers and the coordinator.
//!
//! These are the only shapes that cross a shard boundary. Delivery is
//! fire-and-forget: a control message may be dropped but never duplicated.

use crate::envelope::Envelope;
use crate::group::GroupName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one worker shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A presence transition reported by the worker that owns the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub username: String,
    pub connected: bool,
    /// The group the user belonged to at the time of the transition.
    #[serde(
        rename = "groupName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub group: Option<GroupName>,
}

/// Messages on the worker ↔ coordinator channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Cross-worker delivery of a client envelope.
    WorkerForward { data: Envelope },

    /// Group membership update for a user owned by the receiving worker.
    GroupRegister {
        username: String,
        #[serde(rename = "groupName")]
        group_name: GroupName,
    },

    /// Fan-out of an event to a worker's attached clients, optionally
    /// restricted to members of one group.
    Broadcast {
        data: Envelope,
        #[serde(
            rename = "groupName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        group_name: Option<GroupName>,
    },

    /// Presence transition reported by worker `pid`.
    User { pid: WorkerId, data: UserState },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_worker_forward_wire_shape() {
        let message = ControlMessage::WorkerForward {
            data: Envelope::from_json(r#"{"type":"offer","from":"alice","to":"bob"}"#).unwrap(),
        };

        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "worker-forward",
                "data": {"type": "offer", "from": "alice", "to": "bob"}
            })
        );

        let decoded: ControlMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_group_register_wire_shape() {
        let message = ControlMessage::GroupRegister {
            username: "alice".to_string(),
            group_name: GroupName::P2p,
        };

        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"type": "group-register", "username": "alice", "groupName": "p2p"})
        );
    }

    #[test]
    fn test_broadcast_omits_empty_scope() {
        let message = ControlMessage::Broadcast {
            data: Envelope::user(false, "alice"),
            group_name: None,
        };

        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "broadcast",
                "data": {"type": "user", "connected": false, "username": "alice"}
            })
        );
    }

    #[test]
    fn test_user_state_roundtrip() {
        let message = ControlMessage::User {
            pid: WorkerId(3),
            data: UserState {
                username: "alice".to_string(),
                connected: false,
                group: Some(GroupName::GroupChat),
            },
        };

        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "user",
                "pid": 3,
                "data": {"username": "alice", "connected": false, "groupName": "group_chat"}
            })
        );

        let decoded: ControlMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, message);
    }
}
