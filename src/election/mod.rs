//! Leader Election Module
//!
//! Queue-style election on top of ensemble sequence numbers: every
//! contender enqueues an ephemeral sequential entry and the lowest
//! sequence leads. The leader runs a host-supplied [`LeadershipTask`] for
//! the duration of its stint.

mod elector;

pub use elector::{ElectorDeps, LeaderElector};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionState;
use crate::error::Result;
use crate::identity::NodeIdentity;
use crate::membership::CONTENDER_PREFIX;

/// Separator between a contender's identity and its sequence number
pub const LOCK_MARKER: &str = "-lock-";

/// Elector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectorPhase {
    Idle,
    Contending,
    Leading,
    Relinquishing,
}

/// Why a leadership stint ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RelinquishReason {
    /// The leadership task returned
    Completed,
    /// The leadership task failed or panicked
    Failed(String),
    /// The connection left Connected
    ConnectionLost(ConnectionState),
    /// `interrupt_leadership()` was called
    Interrupted,
    /// The elector is closing
    Shutdown,
}

/// Leadership transition, strictly alternating starting with `Acquired`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LeadershipEvent {
    Acquired { stint: u64 },
    Lost { stint: u64, reason: RelinquishReason },
}

/// Context handed to the leadership task for one stint
#[derive(Debug, Clone)]
pub struct LeadershipContext {
    /// This node
    pub identity: NodeIdentity,
    /// Stint number, starting at 1
    pub stint: u64,
    /// Fires when leadership must be given up
    pub cancel: CancellationToken,
}

/// Work performed while this node leads
///
/// Called once per stint. Returning (with `Ok` or `Err`) or panicking
/// relinquishes leadership; the task is aborted if it outlives its stint.
#[async_trait::async_trait]
pub trait LeadershipTask: Send + Sync {
    async fn take_leadership(&self, ctx: LeadershipContext) -> Result<()>;
}

/// Default task: hold leadership until it is taken away
#[derive(Debug, Default, Clone, Copy)]
pub struct ParkUntilCancelled;

#[async_trait::async_trait]
impl LeadershipTask for ParkUntilCancelled {
    async fn take_leadership(&self, ctx: LeadershipContext) -> Result<()> {
        tracing::debug!("Stint {} parked until cancelled", ctx.stint);
        ctx.cancel.cancelled().await;
        Ok(())
    }
}

/// Name prefix of this node's contender entries
pub fn contender_prefix(identity: &NodeIdentity) -> String {
    format!("{}{}{}", CONTENDER_PREFIX, identity, LOCK_MARKER)
}

/// Sequence number of a contender entry, `None` for other children
pub fn contender_sequence(name: &str) -> Option<u64> {
    if !name.starts_with(CONTENDER_PREFIX) {
        return None;
    }
    let idx = name.rfind(LOCK_MARKER)?;
    name[idx + LOCK_MARKER.len()..].parse().ok()
}

/// Contender entries ordered by sequence, lowest (the leader) first
pub fn queue_order(children: &[String]) -> Vec<&str> {
    let mut queue: Vec<(u64, &str)> = children
        .iter()
        .filter_map(|name| contender_sequence(name).map(|seq| (seq, name.as_str())))
        .collect();
    queue.sort();
    queue.into_iter().map(|(_, name)| name).collect()
}
