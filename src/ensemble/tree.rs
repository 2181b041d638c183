//! Shared coordination tree
//!
//! The store behind both the in-process backend and the development
//! ensemble server: nodes keyed by path, sessions that own ephemeral
//! nodes, per-parent sequence counters and child watches.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use super::{path, ChildEvent, ChildWatch, CreateMode, NodeStat, WatchId, SEQUENCE_WIDTH};
use crate::error::{Error, Result};

struct ZNode {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
    version: i32,
    created_at: i64,
    modified_at: i64,
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, ephemeral_owner: Option<u64>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            data,
            ephemeral_owner,
            version: 0,
            created_at: now,
            modified_at: now,
            next_sequence: 0,
        }
    }
}

struct SessionEntry {
    timeout: Duration,
    last_seen: Instant,
}

struct WatchEntry {
    session: u64,
    path: String,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

struct TreeState {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<u64, SessionEntry>,
    watches: HashMap<WatchId, WatchEntry>,
    next_session: u64,
    next_watch: WatchId,
}

impl TreeState {
    fn stat(&self, path: &str) -> Option<NodeStat> {
        let node = self.nodes.get(path)?;
        Some(NodeStat {
            ephemeral_owner: node.ephemeral_owner,
            version: node.version,
            num_children: self.children(path).len(),
            created_at: node.created_at,
            modified_at: node.modified_at,
        })
    }

    fn children(&self, parent: &str) -> Vec<String> {
        let prefix = if parent == "/" {
            "/".to_string()
        } else {
            format!("{}/", parent)
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| p.len() > prefix.len() && !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p[prefix.len()..].to_string())
            .collect()
    }

    /// Deliver an event to the watchers of `parent`, dropping closed watches
    fn notify(&mut self, parent: &str, event: ChildEvent) {
        self.watches.retain(|_, w| {
            if w.path != parent {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn remove_node(&mut self, node_path: &str) {
        if self.nodes.remove(node_path).is_some() {
            if let Some(parent) = path::parent(node_path) {
                let parent = parent.to_string();
                self.notify(&parent, ChildEvent::Removed(path::name(node_path).to_string()));
            }
        }
    }
}

/// Coordination tree shared by every session of one ensemble
pub struct EnsembleTree {
    state: Mutex<TreeState>,
}

impl EnsembleTree {
    /// Create an empty tree holding only the root node
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None));

        Self {
            state: Mutex::new(TreeState {
                nodes,
                sessions: HashMap::new(),
                watches: HashMap::new(),
                next_session: 1,
                next_watch: 1,
            }),
        }
    }

    /// Open a session with the given timeout
    pub async fn open_session(&self, timeout: Duration) -> u64 {
        let mut state = self.state.lock().await;
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            SessionEntry {
                timeout,
                last_seen: Instant::now(),
            },
        );
        tracing::debug!("Session {:#x} opened (timeout {:?})", id, timeout);
        id
    }

    /// Whether a session is still alive
    pub async fn has_session(&self, session: u64) -> bool {
        self.state.lock().await.sessions.contains_key(&session)
    }

    /// Record activity on a session; false if the session is gone
    pub async fn touch(&self, session: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&session) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Sessions that have been silent for longer than their timeout
    pub async fn idle_sessions(&self) -> Vec<u64> {
        let state = self.state.lock().await;
        state
            .sessions
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() > s.timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// End a session, deleting its ephemeral nodes and detaching its watches
    ///
    /// Returns false if the session was already gone.
    pub async fn expire_session(&self, session: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.sessions.remove(&session).is_none() {
            return false;
        }

        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();

        // Watches go first so the session never sees its own removals
        state.watches.retain(|_, w| w.session != session);

        for node_path in owned.iter().rev() {
            state.remove_node(node_path);
        }

        tracing::debug!(
            "Session {:#x} ended, {} ephemeral node(s) removed",
            session,
            owned.len()
        );
        true
    }

    /// Create a node on behalf of a session
    pub async fn create(
        &self,
        session: u64,
        node_path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String> {
        path::validate(node_path)?;
        let parent = path::parent(node_path)
            .ok_or_else(|| Error::NodeExists(node_path.to_string()))?
            .to_string();

        let mut state = self.state.lock().await;
        if mode.is_ephemeral() && !state.sessions.contains_key(&session) {
            return Err(Error::SessionExpired);
        }

        let parent_node = state
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::NoNode(parent.clone()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(Error::InvalidPath(format!(
                "{} is ephemeral and cannot have children",
                parent
            )));
        }

        let actual = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{:0width$}", node_path, seq, width = SEQUENCE_WIDTH)
        } else {
            node_path.to_string()
        };

        if state.nodes.contains_key(&actual) {
            return Err(Error::NodeExists(actual));
        }

        let owner = mode.is_ephemeral().then_some(session);
        state.nodes.insert(actual.clone(), ZNode::new(data, owner));
        state.notify(&parent, ChildEvent::Added(path::name(&actual).to_string()));

        Ok(actual)
    }

    /// Stat a node
    pub async fn exists(&self, node_path: &str) -> Result<Option<NodeStat>> {
        path::validate(node_path)?;
        Ok(self.state.lock().await.stat(node_path))
    }

    /// Names of a node's children, sorted
    pub async fn get_children(&self, node_path: &str) -> Result<Vec<String>> {
        path::validate(node_path)?;
        let state = self.state.lock().await;
        if !state.nodes.contains_key(node_path) {
            return Err(Error::NoNode(node_path.to_string()));
        }
        Ok(state.children(node_path))
    }

    /// Read a node's payload
    pub async fn get_data(&self, node_path: &str) -> Result<(Vec<u8>, NodeStat)> {
        path::validate(node_path)?;
        let state = self.state.lock().await;
        let data = state
            .nodes
            .get(node_path)
            .map(|n| n.data.clone())
            .ok_or_else(|| Error::NoNode(node_path.to_string()))?;
        let stat = state
            .stat(node_path)
            .ok_or_else(|| Error::NoNode(node_path.to_string()))?;
        Ok((data, stat))
    }

    /// Replace a node's payload
    pub async fn set_data(&self, node_path: &str, data: Vec<u8>) -> Result<NodeStat> {
        path::validate(node_path)?;
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(node_path)
            .ok_or_else(|| Error::NoNode(node_path.to_string()))?;
        node.data = data;
        node.version += 1;
        node.modified_at = chrono::Utc::now().timestamp_millis();

        if let Some(parent) = path::parent(node_path) {
            let parent = parent.to_string();
            state.notify(&parent, ChildEvent::Updated(path::name(node_path).to_string()));
        }

        state
            .stat(node_path)
            .ok_or_else(|| Error::NoNode(node_path.to_string()))
    }

    /// Delete a childless node
    pub async fn delete(&self, node_path: &str) -> Result<()> {
        path::validate(node_path)?;
        if node_path == "/" {
            return Err(Error::InvalidPath("cannot delete the root".into()));
        }

        let mut state = self.state.lock().await;
        if !state.nodes.contains_key(node_path) {
            return Err(Error::NoNode(node_path.to_string()));
        }
        if !state.children(node_path).is_empty() {
            return Err(Error::NotEmpty(node_path.to_string()));
        }

        state.remove_node(node_path);
        Ok(())
    }

    /// Watch the direct children of a path for a session
    ///
    /// The path need not exist yet.
    pub async fn watch_children(&self, session: u64, node_path: &str) -> Result<ChildWatch> {
        path::validate(node_path)?;
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(&session) {
            return Err(Error::SessionExpired);
        }

        let id = state.next_watch;
        state.next_watch += 1;

        let (tx, events) = mpsc::unbounded_channel();
        state.watches.insert(
            id,
            WatchEntry {
                session,
                path: node_path.to_string(),
                tx,
            },
        );

        Ok(ChildWatch { id, events })
    }

    /// Detach a watch; false if it was already gone
    pub async fn unwatch(&self, id: WatchId) -> bool {
        self.state.lock().await.watches.remove(&id).is_some()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

impl Default for EnsembleTree {
    fn default() -> Self {
        Self::new()
    }
}
