//! # beacon-protocol
//!
//! Wire types for the Beacon signaling router.
//!
//! This crate defines the two vocabularies the system speaks:
//!
//! - **Envelope** - the JSON messages exchanged with clients: registration,
//!   acknowledgments, presence events, and opaque relays
//! - **ControlMessage** - the messages exchanged between worker shards and
//!   the coordinator
//!
//! Everything here is plain data; routing semantics live in `beacon-core`.

pub mod control;
pub mod envelope;
pub mod group;

pub use control::{ControlMessage, UserState, WorkerId};
pub use envelope::{Envelope, Recipients, Relay};
pub use group::{GroupName, UnknownGroup};
