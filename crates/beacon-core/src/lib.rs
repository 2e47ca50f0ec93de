//! # beacon-core
//!
//! Distributed routing and presence core for the Beacon signaling service.
//!
//! One logical router is sharded across worker tasks with no shared memory;
//! a single coordinator holds the authoritative view of which worker owns
//! which username:
//!
//! ```text
//! ┌────────┐     ┌──────────┐      ┌─────────────┐
//! │ Client │────▶│  Worker  │◀────▶│ Coordinator │
//! └────────┘     │ (Router) │      │ (Presence,  │
//! ┌────────┐     ├──────────┤      │  GroupIndex)│
//! │ Client │────▶│  Worker  │◀────▶│             │
//! └────────┘     └──────────┘      └─────────────┘
//! ```
//!
//! All cross-shard communication is fire-and-forget message passing over the
//! [`channel`] abstraction: at-most-once, ordered per sender→receiver pair.
//! Co-located sender/recipient pairs are served locally and never touch the
//! coordinator.

pub mod channel;
pub mod cluster;
pub mod coordinator;
pub mod error;
pub mod presence;
pub mod registry;
pub mod router;
pub mod worker;

pub use channel::{Channel, ChannelError};
pub use cluster::{BroadcastPolicy, ClientConnection, ClusterConfig, ClusterHandle};
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorStats, Scope};
pub use error::RoutingError;
pub use presence::{GroupIndex, Location, PresenceTable};
pub use registry::{ClientSink, ConnectionId, ConnectionRegistry};
pub use router::Router;
pub use worker::{DisconnectReason, Worker, WorkerEvent, WorkerHandle};
