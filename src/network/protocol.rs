//! Ensemble Protocol
//!
//! Frames exchanged between a [`RemoteEnsemble`](super::RemoteEnsemble)
//! and an [`EnsembleServer`](super::EnsembleServer).

use serde::{Deserialize, Serialize};

use crate::ensemble::{ChildEvent, CreateMode, NodeStat, WatchId};
use crate::error::Error;

/// Protocol frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    // ========== Session ==========
    /// First frame on a connection: open a session or resume `session_id`
    Hello {
        session_id: Option<u64>,
        timeout_ms: u64,
    },

    /// Session accepted
    HelloAck {
        session_id: u64,
        timeout_ms: u64,
    },

    /// The session asked for no longer exists; the server closes the link
    SessionExpired,

    /// Liveness probe, also refreshes the session
    Ping,

    /// Liveness reply
    Pong,

    /// End the session and release its ephemeral nodes
    Goodbye,

    // ========== Operations ==========
    /// Tree operation
    Request { xid: u64, op: Op },

    /// Outcome of the request with the same `xid`
    Response {
        xid: u64,
        result: std::result::Result<Reply, WireError>,
    },

    /// Child change on a watch registered by this connection
    Event { watch_id: WatchId, event: ChildEvent },
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "Hello",
            Frame::HelloAck { .. } => "HelloAck",
            Frame::SessionExpired => "SessionExpired",
            Frame::Ping => "Ping",
            Frame::Pong => "Pong",
            Frame::Goodbye => "Goodbye",
            Frame::Request { .. } => "Request",
            Frame::Response { .. } => "Response",
            Frame::Event { .. } => "Event",
        }
    }
}

/// Tree operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Exists {
        path: String,
    },
    GetChildren {
        path: String,
    },
    GetData {
        path: String,
    },
    SetData {
        path: String,
        data: Vec<u8>,
    },
    Delete {
        path: String,
    },
    /// Watch children of `path`; events carry the client-chosen `watch_id`
    WatchChildren {
        path: String,
        watch_id: WatchId,
    },
    Unwatch {
        watch_id: WatchId,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Create { .. } => "create",
            Op::Exists { .. } => "exists",
            Op::GetChildren { .. } => "get_children",
            Op::GetData { .. } => "get_data",
            Op::SetData { .. } => "set_data",
            Op::Delete { .. } => "delete",
            Op::WatchChildren { .. } => "watch_children",
            Op::Unwatch { .. } => "unwatch",
        }
    }
}

/// Successful operation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Created(String),
    Stat(Option<NodeStat>),
    Children(Vec<String>),
    Data(Vec<u8>, NodeStat),
    Updated(NodeStat),
    Done,
}

/// Failed operation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    NodeExists(String),
    NoNode(String),
    NotEmpty(String),
    InvalidPath(String),
    SessionExpired,
    Failed(String),
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        match err {
            Error::NodeExists(p) => WireError::NodeExists(p.clone()),
            Error::NoNode(p) => WireError::NoNode(p.clone()),
            Error::NotEmpty(p) => WireError::NotEmpty(p.clone()),
            Error::InvalidPath(p) => WireError::InvalidPath(p.clone()),
            Error::SessionExpired => WireError::SessionExpired,
            other => WireError::Failed(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::NodeExists(p) => Error::NodeExists(p),
            WireError::NoNode(p) => Error::NoNode(p),
            WireError::NotEmpty(p) => Error::NotEmpty(p),
            WireError::InvalidPath(p) => Error::InvalidPath(p),
            WireError::SessionExpired => Error::SessionExpired,
            WireError::Failed(msg) => Error::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_carries_typed_errors() {
        let frame = Frame::Response {
            xid: 9,
            result: Err(WireError::from(&Error::NodeExists("/fleet/a".into()))),
        };
        let bytes = frame.serialize().unwrap();

        match Frame::deserialize(&bytes).unwrap() {
            Frame::Response { xid, result: Err(e) } => {
                assert_eq!(xid, 9);
                assert!(matches!(Error::from(e), Error::NodeExists(p) if p == "/fleet/a"));
            }
            other => panic!("unexpected frame {}", other.type_name()),
        }
    }

    #[test]
    fn test_unmapped_errors_become_internal() {
        let wire = WireError::from(&Error::Cancelled);
        assert!(matches!(Error::from(wire), Error::Internal(_)));
    }
}
