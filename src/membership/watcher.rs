//! Membership Watcher
//!
//! Child watch on the membership path, active only while this node leads.
//! Change notifications are de-duplicated against the known member set, so
//! repeated or out-of-order events from the ensemble are harmless.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{is_peer, MembershipEvent};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::ensemble::{ChildEvent, EnsembleClient, WatchId};
use crate::error::Result;

struct ActiveWatch {
    watch_id: WatchId,
    task: JoinHandle<()>,
}

/// Watches the children of the membership path
pub struct MembershipWatcher {
    /// Ensemble client
    client: Arc<EnsembleClient>,
    /// This node's identity, excluded from events
    identity: String,
    /// Watched path
    membership_path: String,
    /// Audit sink for member changes
    audit: Arc<dyn AuditSink>,
    /// Event fan-out
    events: broadcast::Sender<MembershipEvent>,
    /// Peers currently known
    known: Arc<RwLock<BTreeSet<String>>>,
    /// Attached watch, if active
    active: Mutex<Option<ActiveWatch>>,
}

impl MembershipWatcher {
    pub fn new(
        client: Arc<EnsembleClient>,
        identity: String,
        membership_path: String,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            client,
            identity,
            membership_path,
            audit,
            events,
            known: Arc::new(RwLock::new(BTreeSet::new())),
            active: Mutex::new(None),
        }
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Peers known to the active watch
    pub async fn known_members(&self) -> Vec<String> {
        self.known.read().await.iter().cloned().collect()
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Attach a fresh watch, replacing any stale one
    pub async fn activate(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(stale) = active.take() {
            tracing::debug!("Replacing stale membership watch {}", stale.watch_id);
            self.detach(stale).await;
        }

        let watch = self.client.watch_children(&self.membership_path).await?;
        let children = match self.client.get_children(&self.membership_path).await {
            Ok(children) => children,
            Err(e) => {
                let _ = self.client.unwatch(watch.id).await;
                return Err(e);
            }
        };

        let members: BTreeSet<String> = children
            .into_iter()
            .filter(|n| is_peer(n, &self.identity))
            .collect();
        *self.known.write().await = members.clone();

        tracing::info!(
            "Watching {} ({} peer(s) registered)",
            self.membership_path,
            members.len()
        );
        let _ = self.events.send(MembershipEvent::Initialized {
            members: members.into_iter().collect(),
        });

        let task = tokio::spawn(forward(
            watch.events,
            self.identity.clone(),
            self.known.clone(),
            self.events.clone(),
            self.audit.clone(),
        ));

        *active = Some(ActiveWatch {
            watch_id: watch.id,
            task,
        });
        Ok(())
    }

    /// Detach the watch; no events are delivered afterward
    pub async fn deactivate(&self) {
        let mut active = self.active.lock().await;
        if let Some(watch) = active.take() {
            self.detach(watch).await;
            self.known.write().await.clear();
            tracing::info!("Stopped watching {}", self.membership_path);
        }
    }

    async fn detach(&self, watch: ActiveWatch) {
        // The forwarder must be gone before deactivate() returns
        watch.task.abort();
        if let Err(e) = watch.task.await {
            if e.is_panic() {
                tracing::warn!("Membership forwarder panicked: {}", e);
            }
        }
        if let Err(e) = self.client.unwatch(watch.watch_id).await {
            tracing::debug!("Failed to detach membership watch {}: {}", watch.watch_id, e);
        }
    }
}

async fn forward(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ChildEvent>,
    identity: String,
    known: Arc<RwLock<BTreeSet<String>>>,
    events: broadcast::Sender<MembershipEvent>,
    audit: Arc<dyn AuditSink>,
) {
    while let Some(event) = rx.recv().await {
        let (name, membership_event, kind) = match event {
            ChildEvent::Added(name) if is_peer(&name, &identity) => {
                if !known.write().await.insert(name.clone()) {
                    continue;
                }
                tracing::info!("Member joined: {}", name);
                (name.clone(), MembershipEvent::Joined(name), AuditKind::MemberAdded)
            }
            ChildEvent::Removed(name) if is_peer(&name, &identity) => {
                if !known.write().await.remove(&name) {
                    continue;
                }
                tracing::info!("Member left: {}", name);
                (name.clone(), MembershipEvent::Left(name), AuditKind::MemberRemoved)
            }
            _ => continue,
        };

        audit
            .record(AuditEvent::new(identity.clone(), kind).with_detail(name))
            .await;
        let _ = events.send(membership_event);
    }

    tracing::debug!("Membership watch stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::ensemble::{CreateMode, Ensemble, EnsembleTree, MemoryEnsemble, RetryPolicy};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    async fn next(rx: &mut broadcast::Receiver<MembershipEvent>) -> MembershipEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_watcher_reports_joins_and_leaves() {
        let tree = Arc::new(EnsembleTree::new());
        let backend = Arc::new(MemoryEnsemble::new(tree.clone()));
        let client = Arc::new(EnsembleClient::new(
            backend.clone(),
            RetryPolicy::forever(Duration::from_millis(5)),
        ));
        client.connect().await.unwrap();
        client.create_persistent_if_absent("/fleet/members", b"").await.unwrap();
        client.create_ephemeral("/fleet/members/me:1", b"").await.unwrap();

        let peer = MemoryEnsemble::new(tree.clone());
        peer.connect().await.unwrap();
        peer.create("/fleet/members/a:1", Vec::new(), CreateMode::Ephemeral).await.unwrap();

        let audit = Arc::new(MemoryAudit::new());
        let watcher = MembershipWatcher::new(
            client.clone(),
            "me:1".to_string(),
            "/fleet/members".to_string(),
            audit.clone(),
        );
        let mut rx = watcher.subscribe();

        watcher.activate().await.unwrap();
        assert!(watcher.is_active().await);
        assert_eq!(
            next(&mut rx).await,
            MembershipEvent::Initialized { members: vec!["a:1".to_string()] }
        );

        peer.create("/fleet/members/b:2", Vec::new(), CreateMode::Ephemeral).await.unwrap();
        assert_eq!(next(&mut rx).await, MembershipEvent::Joined("b:2".into()));

        peer.delete("/fleet/members/a:1").await.unwrap();
        assert_eq!(next(&mut rx).await, MembershipEvent::Left("a:1".into()));
        assert_eq!(watcher.known_members().await, vec!["b:2".to_string()]);

        watcher.deactivate().await;
        assert!(!watcher.is_active().await);

        peer.create("/fleet/members/c:3", Vec::new(), CreateMode::Ephemeral).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        assert_eq!(
            audit.kinds().await,
            vec![AuditKind::MemberAdded, AuditKind::MemberRemoved]
        );
    }

    #[tokio::test]
    async fn test_reactivation_replaces_watch() {
        let tree = Arc::new(EnsembleTree::new());
        let backend = Arc::new(MemoryEnsemble::new(tree));
        let client = Arc::new(EnsembleClient::new(
            backend.clone(),
            RetryPolicy::forever(Duration::from_millis(5)),
        ));
        client.connect().await.unwrap();
        client.create_persistent_if_absent("/m", b"").await.unwrap();

        let watcher = MembershipWatcher::new(
            client.clone(),
            "me:1".to_string(),
            "/m".to_string(),
            Arc::new(MemoryAudit::new()),
        );
        let mut rx = watcher.subscribe();

        watcher.activate().await.unwrap();
        watcher.activate().await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        // A single watch survives, so each change is reported once
        backend.create("/m/x:1", Vec::new(), CreateMode::Ephemeral).await.unwrap();
        assert_eq!(next(&mut rx).await, MembershipEvent::Joined("x:1".into()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    /// Holds the first audited change open until the forwarder is dropped
    struct Gate {
        entered: Arc<tokio::sync::Notify>,
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl AuditSink for Gate {
        async fn record(&self, _event: AuditEvent) {
            let _guard = SetOnDrop(self.dropped.clone());
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_deactivate_waits_for_forwarder() {
        let tree = Arc::new(EnsembleTree::new());
        let backend = Arc::new(MemoryEnsemble::new(tree));
        let client = Arc::new(EnsembleClient::new(
            backend.clone(),
            RetryPolicy::forever(Duration::from_millis(5)),
        ));
        client.connect().await.unwrap();
        client.create_persistent_if_absent("/m", b"").await.unwrap();

        let entered = Arc::new(tokio::sync::Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let watcher = MembershipWatcher::new(
            client.clone(),
            "me:1".to_string(),
            "/m".to_string(),
            Arc::new(Gate {
                entered: entered.clone(),
                dropped: dropped.clone(),
            }),
        );
        let mut rx = watcher.subscribe();
        watcher.activate().await.unwrap();
        next(&mut rx).await;

        // The forwarder is now mid-delivery of the join
        backend.create("/m/x:1", Vec::new(), CreateMode::Ephemeral).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), entered.notified())
            .await
            .unwrap();

        watcher.deactivate().await;
        assert!(dropped.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }
}
