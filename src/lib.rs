//! fleetnode - fleet membership and leader election
//!
//! A fleet member registers itself in a ZooKeeper-style coordination
//! ensemble, contends for leadership with its peers and, while it leads,
//! runs a caller-supplied leadership task and watches membership.
//!
//! # Architecture
//!
//! Leaves first: the ensemble client wraps any [`ensemble::Ensemble`]
//! backend; the connection state manager turns raw session events into
//! Connected / Suspended / Lost / Reconnected; the registration manager
//! keeps this node's ephemeral entry alive; the leader elector queues on
//! ensemble sequence numbers; the membership watcher reports joins and
//! leaves while leading. [`node::ClusterNode`] composes all of them.
//!
//! # Features
//!
//! - Automatic fail-over and re-queue after every stint
//! - Re-registration after session loss
//! - In-process ensemble with fault injection for tests and embedders
//! - Development ensemble server and remote backend over TCP
//! - SQLite state log and HTTP status API

pub mod audit;
pub mod api;
pub mod config;
pub mod connection;
pub mod election;
pub mod ensemble;
pub mod error;
pub mod identity;
pub mod membership;
pub mod network;
pub mod node;
pub mod registration;

pub use config::FleetNodeConfig;
pub use error::{Error, Result};
pub use node::ClusterNode;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditKind, AuditSink};
    pub use crate::config::FleetNodeConfig;
    pub use crate::connection::{ConnectionState, ConnectionTransition};
    pub use crate::election::{LeadershipContext, LeadershipEvent, LeadershipTask, ParkUntilCancelled};
    pub use crate::ensemble::{Ensemble, EnsembleTree, MemoryEnsemble};
    pub use crate::error::{Error, Result};
    pub use crate::identity::NodeIdentity;
    pub use crate::membership::MembershipEvent;
    pub use crate::network::{EnsembleServer, RemoteEnsemble};
    pub use crate::node::ClusterNode;
}
