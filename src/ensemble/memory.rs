//! In-process ensemble backend
//!
//! A [`MemoryEnsemble`] is one session on a shared [`EnsembleTree`]. Several
//! of them bound to the same tree behave like peers of one fleet. The
//! fault-injection hooks drive every session transition a real ensemble
//! can produce.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use super::{ChildWatch, CreateMode, Ensemble, EnsembleTree, NodeStat, SessionEvent, WatchId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Idle,
    Up,
    Suspended,
    Expired,
    Closed,
}

/// In-process ensemble session
pub struct MemoryEnsemble {
    tree: Arc<EnsembleTree>,
    session_timeout: Duration,
    /// 0 = no session
    session: AtomicU64,
    link: RwLock<Link>,
    events: broadcast::Sender<SessionEvent>,
    fail_budget: AtomicU32,
}

impl MemoryEnsemble {
    /// Create a session handle on a shared tree
    pub fn new(tree: Arc<EnsembleTree>) -> Self {
        Self::with_timeout(tree, Duration::from_secs(60))
    }

    /// Create a session handle with an explicit session timeout
    pub fn with_timeout(tree: Arc<EnsembleTree>, session_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tree,
            session_timeout,
            session: AtomicU64::new(0),
            link: RwLock::new(Link::Idle),
            events,
            fail_budget: AtomicU32::new(0),
        }
    }

    /// The tree this session is bound to
    pub fn tree(&self) -> &Arc<EnsembleTree> {
        &self.tree
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Check the link before an operation, returning the live session id
    async fn check(&self) -> Result<u64> {
        let consumed = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(Error::ConnectionLoss("injected failure".into()));
        }

        match *self.link.read().await {
            Link::Up => {}
            Link::Suspended => return Err(Error::ConnectionLoss("session suspended".into())),
            Link::Expired => return Err(Error::SessionExpired),
            Link::Idle | Link::Closed => return Err(Error::NotStarted("ensemble session".into())),
        }

        let session = self.session.load(Ordering::SeqCst);
        if !self.tree.touch(session).await {
            return Err(Error::SessionExpired);
        }
        Ok(session)
    }

    /// Drop the link without ending the session
    pub async fn suspend(&self) {
        let mut link = self.link.write().await;
        if *link == Link::Up {
            *link = Link::Suspended;
            self.emit(SessionEvent::Disconnected);
        }
    }

    /// Restore a suspended link
    ///
    /// If the session died meanwhile the link reports expiry instead.
    pub async fn resume(&self) {
        let mut link = self.link.write().await;
        if *link != Link::Suspended {
            return;
        }

        let session = self.session.load(Ordering::SeqCst);
        if self.tree.touch(session).await {
            *link = Link::Up;
            self.emit(SessionEvent::SyncConnected { session_id: session });
        } else {
            *link = Link::Expired;
            self.emit(SessionEvent::Expired);
        }
    }

    /// Expire the session as the ensemble would after a timeout
    pub async fn expire(&self) {
        let mut link = self.link.write().await;
        if matches!(*link, Link::Idle | Link::Closed | Link::Expired) {
            return;
        }

        self.tree.expire_session(self.session.load(Ordering::SeqCst)).await;
        *link = Link::Expired;
        self.emit(SessionEvent::Expired);
    }

    /// Establish a brand-new session after expiry
    pub async fn reconnect(&self) {
        let mut link = self.link.write().await;
        if *link != Link::Expired {
            return;
        }

        let session = self.tree.open_session(self.session_timeout).await;
        self.session.store(session, Ordering::SeqCst);
        *link = Link::Up;
        self.emit(SessionEvent::SyncConnected { session_id: session });
    }

    /// Replace a suspended session with a new one without reporting expiry first
    pub async fn reconnect_new_session(&self) {
        let mut link = self.link.write().await;
        if *link != Link::Suspended {
            return;
        }

        self.tree.expire_session(self.session.load(Ordering::SeqCst)).await;
        let session = self.tree.open_session(self.session_timeout).await;
        self.session.store(session, Ordering::SeqCst);
        *link = Link::Up;
        self.emit(SessionEvent::SyncConnected { session_id: session });
    }

    /// Fail the next `n` operations with a transient connection loss
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Ensemble for MemoryEnsemble {
    async fn connect(&self) -> Result<()> {
        let mut link = self.link.write().await;
        match *link {
            Link::Up | Link::Suspended => return Ok(()),
            Link::Closed => return Err(Error::ShuttingDown),
            Link::Idle | Link::Expired => {}
        }

        let session = self.tree.open_session(self.session_timeout).await;
        self.session.store(session, Ordering::SeqCst);
        *link = Link::Up;
        self.emit(SessionEvent::SyncConnected { session_id: session });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut link = self.link.write().await;
        if *link == Link::Closed {
            return Ok(());
        }

        let session = self.session.swap(0, Ordering::SeqCst);
        if session != 0 {
            self.tree.expire_session(session).await;
        }
        *link = Link::Closed;
        self.emit(SessionEvent::Closed);
        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let session = self.check().await?;
        self.tree.create(session, path, data, mode).await
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        self.check().await?;
        self.tree.exists(path).await
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check().await?;
        self.tree.get_children(path).await
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        self.check().await?;
        self.tree.get_data(path).await
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<NodeStat> {
        self.check().await?;
        self.tree.set_data(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check().await?;
        self.tree.delete(path).await
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        let session = self.check().await?;
        self.tree.watch_children(session, path).await
    }

    async fn unwatch(&self, id: WatchId) -> Result<()> {
        // Detaching works on a degraded link too
        self.tree.unwatch(id).await;
        Ok(())
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn session_id(&self) -> Option<u64> {
        match self.session.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lifecycle_events() {
        let tree = Arc::new(EnsembleTree::new());
        let ensemble = MemoryEnsemble::new(tree.clone());
        let mut events = ensemble.session_events();

        ensemble.connect().await.unwrap();
        let first = ensemble.session_id().unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::SyncConnected { session_id: first });

        ensemble.suspend().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
        assert!(matches!(ensemble.exists("/").await, Err(Error::ConnectionLoss(_))));

        ensemble.resume().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::SyncConnected { session_id: first });

        ensemble.expire().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert!(matches!(ensemble.exists("/").await, Err(Error::SessionExpired)));

        ensemble.reconnect().await;
        let second = ensemble.session_id().unwrap();
        assert_ne!(first, second);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::SyncConnected { session_id: second });

        ensemble.close().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed);
        assert_eq!(tree.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_expire_removes_own_ephemerals_only() {
        let tree = Arc::new(EnsembleTree::new());
        let a = MemoryEnsemble::new(tree.clone());
        let b = MemoryEnsemble::new(tree.clone());
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.create("/m", Vec::new(), CreateMode::Persistent).await.unwrap();
        a.create("/m/a", Vec::new(), CreateMode::Ephemeral).await.unwrap();
        b.create("/m/b", Vec::new(), CreateMode::Ephemeral).await.unwrap();

        a.expire().await;
        assert_eq!(b.get_children("/m").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_fail_next_injects_transient_errors() {
        let ensemble = MemoryEnsemble::new(Arc::new(EnsembleTree::new()));
        ensemble.connect().await.unwrap();

        ensemble.fail_next(2);
        assert!(ensemble.exists("/").await.unwrap_err().is_retryable());
        assert!(ensemble.exists("/").await.unwrap_err().is_retryable());
        assert!(ensemble.exists("/").await.unwrap().is_some());
    }
}
