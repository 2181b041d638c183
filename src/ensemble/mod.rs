//! Coordination Ensemble Module
//!
//! The node consumes a ZooKeeper-style ensemble: a tree of nodes with
//! ephemeral entries bound to a session, ensemble-assigned sequence
//! numbers, child watches and a session event stream. Backends implement
//! [`Ensemble`]; the rest of the crate talks to [`EnsembleClient`], which
//! adds lifecycle tracking and the retry policy.

pub mod path;
mod retry;
mod tree;
mod memory;
mod client;

pub use retry::RetryPolicy;
pub use tree::EnsembleTree;
pub use memory::MemoryEnsemble;
pub use client::{ClientState, CreateOutcome, EnsembleClient};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

/// Width of the sequence suffix appended to sequential nodes
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Durable node, survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral node with an ensemble-assigned sequence suffix
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

/// Metadata of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    /// Session owning the node, if ephemeral
    pub ephemeral_owner: Option<u64>,
    /// Data version, bumped on every write
    pub version: i32,
    /// Number of direct children
    pub num_children: usize,
    /// Creation time (ms since epoch)
    pub created_at: i64,
    /// Last modification time (ms since epoch)
    pub modified_at: i64,
}

impl NodeStat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner.is_some()
    }
}

/// Change to the direct children of a watched path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildEvent {
    /// A child was created
    Added(String),
    /// A child was deleted
    Removed(String),
    /// A child's data changed
    Updated(String),
}

impl ChildEvent {
    /// Name of the child the event refers to
    pub fn name(&self) -> &str {
        match self {
            ChildEvent::Added(n) | ChildEvent::Removed(n) | ChildEvent::Updated(n) => n,
        }
    }
}

/// Watch handle identifier
pub type WatchId = u64;

/// An attached child watch
#[derive(Debug)]
pub struct ChildWatch {
    /// Handle used to detach the watch
    pub id: WatchId,
    /// Event stream; closes when the watch is detached or the session ends
    pub events: mpsc::UnboundedReceiver<ChildEvent>,
}

/// Raw session events reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Session established or resumed
    SyncConnected { session_id: u64 },
    /// Link to the ensemble dropped; the session may still be alive
    Disconnected,
    /// The ensemble discarded the session and its ephemeral nodes
    Expired,
    /// Session closed by us
    Closed,
}

/// A session with a coordination ensemble
#[async_trait::async_trait]
pub trait Ensemble: Send + Sync {
    /// Establish the session
    async fn connect(&self) -> Result<()>;

    /// Close the session, releasing its ephemeral nodes
    async fn close(&self) -> Result<()>;

    /// Create a node, returning its actual path (sequential nodes get a suffix)
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Stat a node
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>>;

    /// List the names of a node's direct children, sorted
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Read a node's payload
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)>;

    /// Replace a node's payload
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<NodeStat>;

    /// Delete a childless node
    async fn delete(&self, path: &str) -> Result<()>;

    /// Watch the direct children of a path until unwatched
    async fn watch_children(&self, path: &str) -> Result<ChildWatch>;

    /// Detach a child watch
    async fn unwatch(&self, id: WatchId) -> Result<()>;

    /// Subscribe to session events
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Current session id, if any
    fn session_id(&self) -> Option<u64>;
}
