//! Node Identity and Path Layout
//!
//! A node is known to the fleet as `host:epoch`, where `host` is the
//! machine's first non-loopback IPv4 address and `epoch` the millisecond
//! timestamp taken when the node was constructed.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PathConfig;
use crate::ensemble::path;
use crate::error::Result;

/// Identity of this node in the fleet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Host address
    pub host: String,
    /// Startup timestamp in milliseconds since the Unix epoch
    pub epoch: i64,
}

impl NodeIdentity {
    /// Build an identity for this process, detecting the host if not given
    pub fn detect(host: Option<&str>) -> Self {
        let host = match host {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => local_ip(),
        };
        Self::new(host, chrono::Utc::now().timestamp_millis())
    }

    /// Build an identity from explicit parts
    pub fn new(host: impl Into<String>, epoch: i64) -> Self {
        Self {
            host: host.into(),
            epoch,
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.epoch)
    }
}

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, if_addrs::IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    if_addrs::IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Paths this node uses in the coordination tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathLayout {
    /// Parent of the ephemeral per-node entries
    pub membership_path: String,
    /// Parent of the election contention entries
    pub election_path: String,
    /// This node's ephemeral entry
    pub this_node_path: String,
}

impl PathLayout {
    /// Compute the layout for an identity
    pub fn new(config: &PathConfig, identity: &NodeIdentity) -> Result<Self> {
        path::validate(&config.root)?;

        let membership_path = path::join(&config.root, &config.membership);
        let election_path = path::join(&config.root, &config.election);
        path::validate(&membership_path)?;
        path::validate(&election_path)?;

        let this_node_path = path::join(&membership_path, &identity.to_string());
        path::validate(&this_node_path)?;

        Ok(Self {
            membership_path,
            election_path,
            this_node_path,
        })
    }

    /// Whether election entries share the membership subtree
    pub fn shares_election_path(&self) -> bool {
        self.membership_path == self.election_path
    }
}
