//! Membership Module
//!
//! Tracks which peers are alive, from the children of the membership path.
//! The watcher only runs while this node leads; the snapshot helper backs
//! `member_list()` on every node.

mod watcher;

pub use watcher::MembershipWatcher;

use serde::Serialize;

/// Name prefix of election contender entries
pub const CONTENDER_PREFIX: &str = "_c_";

/// Membership change seen by the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MembershipEvent {
    /// Watch attached; current peers
    Initialized { members: Vec<String> },
    /// A peer registered
    Joined(String),
    /// A peer's entry disappeared
    Left(String),
}

/// Whether a child name is a peer identity other than `own`
pub fn is_peer(name: &str, own: &str) -> bool {
    name != own && !name.starts_with(CONTENDER_PREFIX)
}

/// Peer identities among the children of the membership path
pub fn member_snapshot(children: Vec<String>, own: &str) -> Vec<String> {
    let mut members: Vec<String> = children.into_iter().filter(|n| is_peer(n, own)).collect();
    members.sort();
    members
}
