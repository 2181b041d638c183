//! Cluster Node
//!
//! The facade hosts embed: one object per process that joins the fleet,
//! keeps its registration alive, contends for leadership and reports the
//! peers it can see.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::config::FleetNodeConfig;
use crate::connection::{ConnectionState, ConnectionStateManager};
use crate::election::{ElectorDeps, ElectorPhase, LeaderElector, LeadershipEvent, LeadershipTask};
use crate::ensemble::{Ensemble, EnsembleClient, RetryPolicy};
use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, PathLayout};
use crate::membership::{member_snapshot, MembershipEvent, MembershipWatcher};
use crate::registration::RegistrationManager;

/// A fleet member
pub struct ClusterNode {
    /// Node configuration
    config: FleetNodeConfig,
    /// This node's identity
    identity: NodeIdentity,
    /// Coordination tree layout
    layout: PathLayout,
    /// Ensemble client
    client: Arc<EnsembleClient>,
    /// Connection state tracking
    connection: Arc<ConnectionStateManager>,
    /// Membership watch, active while leading
    watcher: Arc<MembershipWatcher>,
    /// Leader election
    elector: LeaderElector,
    /// Self-registration
    registration: Arc<RegistrationManager>,
    /// Audit sink
    audit: Arc<dyn AuditSink>,
    /// Root cancellation token
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    /// Serializes start and close
    lifecycle: Mutex<()>,
}

impl ClusterNode {
    /// Build a node on top of an ensemble backend
    ///
    /// Identity and layout are fixed here; nothing touches the ensemble
    /// until `start()`.
    pub fn new(
        config: FleetNodeConfig,
        backend: Arc<dyn Ensemble>,
        task: Arc<dyn LeadershipTask>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;

        let identity = NodeIdentity::detect(config.node.host.as_deref());
        let layout = PathLayout::new(&config.paths, &identity)?;
        let shutdown = CancellationToken::new();

        let client = Arc::new(EnsembleClient::with_cancel(
            backend,
            RetryPolicy::forever(config.retry_interval()),
            shutdown.child_token(),
        ));
        let connection = Arc::new(ConnectionStateManager::new(&client));
        let watcher = Arc::new(MembershipWatcher::new(
            client.clone(),
            identity.to_string(),
            layout.membership_path.clone(),
            audit.clone(),
        ));
        let registration = Arc::new(RegistrationManager::new(
            client.clone(),
            identity.clone(),
            layout.clone(),
            RetryPolicy::bounded(config.registration.attempts, config.registration_backoff()),
            audit.clone(),
            shutdown.clone(),
        ));
        let elector = LeaderElector::new(
            ElectorDeps {
                client: client.clone(),
                connection: connection.clone(),
                watcher: watcher.clone(),
                audit: audit.clone(),
                identity: identity.clone(),
                layout: layout.clone(),
            },
            task,
            &config.election,
            &shutdown,
        );

        tracing::debug!(
            "Node {} uses {} (members) and {} (election)",
            identity,
            layout.membership_path,
            layout.election_path
        );

        Ok(Self {
            config,
            identity,
            layout,
            client,
            connection,
            watcher,
            elector,
            registration,
            audit,
            shutdown,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }

    /// Join the fleet
    ///
    /// Connects, starts the connection manager and the election, attaches
    /// the registration listener and registers this node.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(
            "Starting node {} (ensemble {})",
            self.identity,
            self.config.ensemble.address
        );

        self.client.connect().await?;
        self.connection.start().await?;
        self.elector.start().await?;
        self.connection
            .attach_with_retry(self.registration.clone(), self.config.listener_retry(), &self.shutdown)
            .await?;
        self.registration.register_self().await;

        self.started.store(true, Ordering::SeqCst);
        self.audit
            .record(AuditEvent::new(self.identity.to_string(), AuditKind::NodeStarted))
            .await;
        tracing::info!("Node {} started", self.identity);
        Ok(())
    }

    /// Leave the fleet
    ///
    /// Idempotent and safe before `start()`. Each teardown step is
    /// attempted even if an earlier one fails.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Preempt retries and a start() still in progress
        self.shutdown.cancel();
        let _guard = self.lifecycle.lock().await;

        tracing::info!("Stopping node {}", self.identity);

        self.watcher.deactivate().await;
        if let Err(e) = self.elector.close().await {
            tracing::error!("Failed to stop election: {}", e);
        }
        if let Err(e) = self.connection.close().await {
            tracing::error!("Failed to stop connection manager: {}", e);
        }
        if let Err(e) = self.client.close().await {
            tracing::error!("Failed to close ensemble client: {}", e);
        }

        if self.started.load(Ordering::SeqCst) {
            self.audit
                .record(AuditEvent::new(self.identity.to_string(), AuditKind::NodeStopped))
                .await;
        }
        tracing::info!("Node {} stopped", self.identity);
        Ok(())
    }

    /// Client started and connection usable
    pub fn is_living(&self) -> bool {
        self.client.is_started() && self.connection.state() == ConnectionState::Connected
    }

    /// Whether this node currently leads
    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Identities of the other live members
    ///
    /// Empty unless the node is living. Single attempt; errors yield an
    /// empty list.
    pub async fn member_list(&self) -> Vec<String> {
        if !self.is_living() {
            return Vec::new();
        }

        match self.client.get_children_once(&self.layout.membership_path).await {
            Ok(children) => member_snapshot(children, &self.service_name()),
            Err(e) => {
                tracing::debug!("Member list unavailable: {}", e);
                Vec::new()
            }
        }
    }

    /// This node's identity string
    pub fn service_name(&self) -> String {
        self.identity.to_string()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    pub fn config(&self) -> &FleetNodeConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn phase(&self) -> ElectorPhase {
        self.elector.phase()
    }

    /// Number of leadership stints so far
    pub fn stints(&self) -> u64 {
        self.elector.stints()
    }

    /// Watch the leadership flag
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.elector.leadership()
    }

    /// Subscribe to leadership transitions
    pub fn leadership_events(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.elector.subscribe()
    }

    /// Subscribe to membership changes seen while leading
    pub fn membership_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.watcher.subscribe()
    }

    /// Give up the current stint; false if not leading
    pub fn interrupt_leadership(&self) -> bool {
        self.elector.interrupt_leadership()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::election::ParkUntilCancelled;
    use crate::ensemble::{EnsembleTree, MemoryEnsemble};
    use std::time::Duration;

    fn test_config(host: &str) -> FleetNodeConfig {
        let mut config = FleetNodeConfig::with_ensemble("in-process");
        config.node.host = Some(host.to_string());
        config.node.listener_retry_ms = 10;
        config.ensemble.retry_interval_ms = 5;
        config.election.contend_retry_ms = 10;
        config.registration.backoff_ms = 5;
        config
    }

    struct TestNode {
        backend: Arc<MemoryEnsemble>,
        audit: Arc<MemoryAudit>,
        node: ClusterNode,
    }

    fn build(tree: &Arc<EnsembleTree>, host: &str) -> TestNode {
        let backend = Arc::new(MemoryEnsemble::new(tree.clone()));
        let audit = Arc::new(MemoryAudit::new());
        let node = ClusterNode::new(
            test_config(host),
            backend.clone(),
            Arc::new(ParkUntilCancelled),
            audit.clone(),
        )
        .unwrap();
        TestNode { backend, audit, node }
    }

    async fn started(tree: &Arc<EnsembleTree>, host: &str) -> TestNode {
        let n = build(tree, host);
        n.node.start().await.unwrap();
        n
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..400 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn leaders(nodes: &[TestNode]) -> Vec<usize> {
        nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.node.is_leader())
            .map(|(i, _)| i)
            .collect()
    }

    #[tokio::test]
    async fn test_close_before_start_and_twice() {
        let tree = Arc::new(EnsembleTree::new());
        let n = build(&tree, "10.0.0.1");

        n.node.close().await.unwrap();
        n.node.close().await.unwrap();
        assert!(!n.node.is_living());
        assert!(matches!(n.node.start().await, Err(Error::ShuttingDown)));
        assert!(n.audit.kinds().await.is_empty());
    }

    #[tokio::test]
    async fn test_member_list_empty_when_not_connected() {
        let tree = Arc::new(EnsembleTree::new());
        let n = build(&tree, "10.0.0.1");
        assert!(n.node.member_list().await.is_empty());

        n.node.start().await.unwrap();
        assert!(eventually(|| n.node.is_living()).await);

        n.backend.suspend().await;
        assert!(eventually(|| !n.node.is_living()).await);
        assert!(n.node.member_list().await.is_empty());

        n.node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_member_list_excludes_self() {
        let tree = Arc::new(EnsembleTree::new());
        let a = started(&tree, "10.0.0.1").await;
        let b = started(&tree, "10.0.0.2").await;

        assert!(eventually(|| a.node.is_living() && b.node.is_living()).await);
        assert_eq!(a.node.member_list().await, vec![b.node.service_name()]);
        assert_eq!(b.node.member_list().await, vec![a.node.service_name()]);

        a.node.close().await.unwrap();
        b.node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_creates_missing_path() {
        let tree = Arc::new(EnsembleTree::new());
        let n = started(&tree, "10.0.0.1").await;

        let parent = tree.exists("/fleet/members").await.unwrap().unwrap();
        assert!(!parent.is_ephemeral());
        let entry = tree
            .exists(&n.node.layout().this_node_path)
            .await
            .unwrap()
            .unwrap();
        assert!(entry.is_ephemeral());

        let kinds = n.audit.kinds().await;
        assert!(kinds.contains(&AuditKind::Registered));
        assert!(kinds.contains(&AuditKind::NodeStarted));

        n.node.close().await.unwrap();
        assert!(tree.exists(&n.node.layout().this_node_path).await.unwrap().is_none());
        assert_eq!(
            n.audit.kinds().await.iter().filter(|k| **k == AuditKind::NodeStopped).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_reregisters_after_reconnect() {
        let tree = Arc::new(EnsembleTree::new());
        let n = started(&tree, "10.0.0.1").await;
        let entry = n.node.layout().this_node_path.clone();

        n.backend.expire().await;
        assert!(tree.exists(&entry).await.unwrap().is_none());
        assert!(eventually(|| !n.node.is_leader()).await);

        n.backend.reconnect().await;
        let mut registered = false;
        for _ in 0..400 {
            if tree.exists(&entry).await.unwrap().is_some() {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registered);
        assert!(eventually(|| n.node.is_leader()).await);

        n.node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_session_while_suspended_counts_as_expiry() {
        let tree = Arc::new(EnsembleTree::new());
        let n = started(&tree, "10.0.0.1").await;
        let entry = n.node.layout().this_node_path.clone();
        assert!(eventually(|| n.node.is_leader()).await);
        let first = n.backend.session_id().unwrap();

        n.backend.suspend().await;
        assert!(eventually(|| !n.node.is_leader()).await);

        n.backend.reconnect_new_session().await;
        let second = n.backend.session_id().unwrap();
        assert_ne!(first, second);

        let mut owned = false;
        for _ in 0..400 {
            if let Some(stat) = tree.exists(&entry).await.unwrap() {
                if stat.ephemeral_owner == Some(second) {
                    owned = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(owned);
        assert!(eventually(|| n.node.is_leader()).await);
        assert_eq!(n.node.connection_state(), ConnectionState::Connected);

        let mut audited = false;
        for _ in 0..400 {
            let kinds = n.audit.kinds().await;
            if kinds.iter().filter(|k| **k == AuditKind::Registered).count() == 2 {
                audited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(audited);

        n.node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_three_nodes_fail_over() {
        let tree = Arc::new(EnsembleTree::new());
        let nodes = vec![
            started(&tree, "10.0.0.1").await,
            started(&tree, "10.0.0.2").await,
            started(&tree, "10.0.0.3").await,
        ];

        assert!(eventually(|| leaders(&nodes).len() == 1).await);
        let first = leaders(&nodes)[0];

        nodes[first].backend.expire().await;
        assert!(eventually(|| {
            let current = leaders(&nodes);
            current.len() == 1 && current[0] != first
        })
        .await);

        let second = leaders(&nodes)[0];
        let survivor = (0..3).find(|i| *i != first && *i != second).unwrap();
        assert_eq!(
            nodes[second].node.member_list().await,
            vec![nodes[survivor].node.service_name()]
        );
        assert!(!nodes[first].node.is_living());
        assert!(!nodes[first].node.is_leader());

        for n in &nodes {
            n.node.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_requeue_rounds_keep_single_leader() {
        let tree = Arc::new(EnsembleTree::new());
        let mut nodes = Vec::new();
        for i in 1..=3 {
            nodes.push(started(&tree, &format!("10.0.0.{}", i)).await);
        }

        for _ in 0..4 {
            assert!(eventually(|| leaders(&nodes).len() == 1).await);
            let leader = leaders(&nodes)[0];
            let stints = nodes[leader].node.stints();

            assert!(nodes[leader].node.interrupt_leadership());
            assert!(eventually(|| {
                let current = leaders(&nodes);
                current.len() == 1 && current[0] != leader
            })
            .await);

            // The relinquishing node is back in the queue
            assert!(eventually(|| nodes[leader].node.phase() == ElectorPhase::Contending).await);
            assert_eq!(nodes[leader].node.stints(), stints);
        }

        for n in &nodes {
            n.node.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_leadership_events_alternate() {
        let tree = Arc::new(EnsembleTree::new());
        let n = build(&tree, "10.0.0.1");
        let mut events = n.node.leadership_events();
        n.node.start().await.unwrap();

        assert!(eventually(|| n.node.is_leader()).await);
        for round in 1..=3u64 {
            assert!(n.node.interrupt_leadership());
            assert!(eventually(|| n.node.stints() == round + 1 && n.node.is_leader()).await);
        }
        n.node.close().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(!seen.is_empty());
        for (i, event) in seen.iter().enumerate() {
            match event {
                LeadershipEvent::Acquired { stint } => {
                    assert_eq!(i % 2, 0);
                    assert_eq!(*stint, i as u64 / 2 + 1);
                }
                LeadershipEvent::Lost { stint, .. } => {
                    assert_eq!(i % 2, 1);
                    assert_eq!(*stint, i as u64 / 2 + 1);
                }
            }
        }
        assert!(matches!(seen.last(), Some(LeadershipEvent::Lost { .. })));
    }

    #[tokio::test]
    async fn test_leader_sees_membership_changes() {
        let tree = Arc::new(EnsembleTree::new());
        let a = build(&tree, "10.0.0.1");
        let mut events = a.node.membership_events();
        a.node.start().await.unwrap();

        let initialized = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(initialized, MembershipEvent::Initialized { members: Vec::new() });
        assert!(a.node.is_leader());

        let b = started(&tree, "10.0.0.2").await;
        let joined = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined, MembershipEvent::Joined(b.node.service_name()));

        b.node.close().await.unwrap();
        let left = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left, MembershipEvent::Left(b.node.service_name()));

        a.node.close().await.unwrap();
    }
}
