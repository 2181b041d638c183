//! Leader Elector
//!
//! A single election loop task per node. It waits for a usable
//! connection, enqueues a contender entry, waits to reach the head of the
//! queue and then holds leadership until the leadership task returns, the
//! connection degrades, leadership is interrupted or the node shuts down.
//! Every exit from Leading goes through one relinquish path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    contender_prefix, queue_order, ElectorPhase, LeadershipContext, LeadershipEvent, LeadershipTask,
    RelinquishReason,
};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::config::ElectionConfig;
use crate::connection::{ConnectionState, ConnectionStateManager, ConnectionTransition};
use crate::ensemble::{path, ChildEvent, EnsembleClient};
use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, PathLayout};
use crate::membership::MembershipWatcher;

/// How long a cancelled leadership task may take to return before it is aborted
const TASK_STOP_GRACE: Duration = Duration::from_millis(200);

/// Collaborators of the elector
pub struct ElectorDeps {
    pub client: Arc<EnsembleClient>,
    pub connection: Arc<ConnectionStateManager>,
    pub watcher: Arc<MembershipWatcher>,
    pub audit: Arc<dyn AuditSink>,
    pub identity: NodeIdentity,
    pub layout: PathLayout,
}

enum Turn {
    /// Head of the queue, holding this entry
    Elected(String),
    /// Entry or watch lost, start a new round
    Requeue,
}

struct Inner {
    client: Arc<EnsembleClient>,
    connection: Arc<ConnectionStateManager>,
    watcher: Arc<MembershipWatcher>,
    audit: Arc<dyn AuditSink>,
    identity: NodeIdentity,
    layout: PathLayout,
    task: Arc<dyn LeadershipTask>,
    auto_requeue: bool,
    contend_retry: Duration,
    /// Leadership flag
    is_leader: AtomicBool,
    leader_tx: watch::Sender<bool>,
    phase_tx: watch::Sender<ElectorPhase>,
    events: broadcast::Sender<LeadershipEvent>,
    /// Cancelled by close()
    shutdown: CancellationToken,
    /// Token of the running stint, if leading
    stint_tx: watch::Sender<Option<CancellationToken>>,
    stints: AtomicU64,
}

/// Contends for leadership on behalf of one node
pub struct LeaderElector {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    /// Create an elector; its shutdown token is a child of `parent`
    pub fn new(
        deps: ElectorDeps,
        task: Arc<dyn LeadershipTask>,
        config: &ElectionConfig,
        parent: &CancellationToken,
    ) -> Self {
        let (leader_tx, _) = watch::channel(false);
        let (phase_tx, _) = watch::channel(ElectorPhase::Idle);
        let (stint_tx, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                client: deps.client,
                connection: deps.connection,
                watcher: deps.watcher,
                audit: deps.audit,
                identity: deps.identity,
                layout: deps.layout,
                task,
                auto_requeue: config.auto_requeue,
                contend_retry: Duration::from_millis(config.contend_retry_ms),
                is_leader: AtomicBool::new(false),
                leader_tx,
                phase_tx,
                events,
                shutdown: parent.child_token(),
                stint_tx,
                stints: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the election loop
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        *handle = Some(tokio::spawn(self.inner.clone().run()));
        Ok(())
    }

    /// Stop contending, relinquishing leadership if held
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    self.inner.step_down();
                    return Err(Error::Election("election loop panicked".into()));
                }
            }
        }

        self.inner.step_down();
        self.inner.set_phase(ElectorPhase::Idle);
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ElectorPhase {
        *self.inner.phase_tx.borrow()
    }

    /// Watch the leadership flag
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.inner.leader_tx.subscribe()
    }

    /// Subscribe to leadership transitions
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.inner.events.subscribe()
    }

    /// End the current stint; false if not leading
    pub fn interrupt_leadership(&self) -> bool {
        match self.inner.stint_tx.borrow().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of stints started so far
    pub fn stints(&self) -> u64 {
        self.inner.stints.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn set_phase(&self, phase: ElectorPhase) {
        self.phase_tx.send_replace(phase);
    }

    fn step_down(&self) {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.leader_tx.send_replace(false);
        }
    }

    async fn run(self: Arc<Self>) {
        tracing::info!("Election loop started for {}", self.identity);

        loop {
            self.set_phase(ElectorPhase::Idle);
            if !self.wait_connected().await {
                break;
            }
            self.set_phase(ElectorPhase::Contending);

            match self.contend().await {
                Ok(Turn::Elected(entry)) => {
                    let reason = self.lead(&entry).await;
                    if reason == RelinquishReason::Shutdown {
                        break;
                    }
                    if !self.auto_requeue {
                        tracing::info!("{} leaves the election (auto-requeue disabled)", self.identity);
                        self.set_phase(ElectorPhase::Idle);
                        self.shutdown.cancelled().await;
                        break;
                    }
                    // Back off before re-contending with a task that keeps failing
                    if matches!(reason, RelinquishReason::Failed(_)) {
                        tokio::select! {
                            _ = tokio::time::sleep(self.contend_retry) => {}
                            _ = self.shutdown.cancelled() => break,
                        }
                    }
                }
                Ok(Turn::Requeue) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.contend_retry) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(Error::Cancelled) | Err(Error::ShuttingDown) => break,
                Err(e) => {
                    tracing::warn!("Election round failed for {}: {}", self.identity, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.contend_retry) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.set_phase(ElectorPhase::Idle);
        tracing::info!("Election loop stopped for {}", self.identity);
    }

    /// Block until the connection is usable; false on shutdown
    async fn wait_connected(&self) -> bool {
        let mut state = self.connection.watch();
        loop {
            if *state.borrow_and_update() == ConnectionState::Connected {
                return true;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    /// One round of contention
    async fn contend(&self) -> Result<Turn> {
        let election_path = &self.layout.election_path;
        self.client.create_persistent_if_absent(election_path, b"").await?;
        self.clear_stale_entries().await?;

        let mut watch = self.client.watch_children(election_path).await?;
        let prefix = path::join(election_path, &contender_prefix(&self.identity));
        let created = match self
            .client
            .create_ephemeral_sequential(&prefix, self.identity.to_string().as_bytes())
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                let _ = self.client.unwatch(watch.id).await;
                return Err(e);
            }
        };
        let entry = match self.settle_entry(created.clone()).await {
            Ok(entry) => entry,
            Err(e) => {
                let _ = self.client.unwatch(watch.id).await;
                let _ = self.client.delete_once(&created).await;
                return Err(e);
            }
        };
        tracing::debug!("{} enqueued as {}", self.identity, entry);

        let turn = self.await_turn(&entry, &mut watch.events).await;
        let _ = self.client.unwatch(watch.id).await;

        match turn {
            Ok(Turn::Elected(entry)) => Ok(Turn::Elected(entry)),
            other => {
                if let Err(e) = self.client.delete_once(&entry).await {
                    tracing::debug!("Could not withdraw {}: {}", entry, e);
                }
                other
            }
        }
    }

    /// Remove entries left behind by an earlier round of this node
    async fn clear_stale_entries(&self) -> Result<()> {
        let prefix = contender_prefix(&self.identity);
        for name in self.client.get_children(&self.layout.election_path).await? {
            if name.starts_with(&prefix) {
                tracing::debug!("Removing stale contender entry {}", name);
                self.client
                    .delete_once(&path::join(&self.layout.election_path, &name))
                    .await?;
            }
        }
        Ok(())
    }

    /// Settle on a single contender entry for this round
    ///
    /// A create that was applied but whose reply was lost gets retried and
    /// leaves a second entry under this node's prefix. The lowest one is
    /// kept and the others are withdrawn, so no orphan blocks the queue.
    async fn settle_entry(&self, created: String) -> Result<String> {
        let prefix = contender_prefix(&self.identity);
        let children = self.client.get_children(&self.layout.election_path).await?;
        let own: Vec<&str> = queue_order(&children)
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();

        let Some((keep, extra)) = own.split_first() else {
            return Ok(created);
        };
        for name in extra {
            tracing::debug!("Withdrawing duplicate contender entry {}", name);
            self.client
                .delete_once(&path::join(&self.layout.election_path, name))
                .await?;
        }
        Ok(path::join(&self.layout.election_path, keep))
    }

    /// Wait until `entry` heads the queue
    async fn await_turn(
        &self,
        entry: &str,
        events: &mut mpsc::UnboundedReceiver<ChildEvent>,
    ) -> Result<Turn> {
        let own = path::name(entry);

        loop {
            let children = self.client.get_children(&self.layout.election_path).await?;
            let queue = queue_order(&children);
            match queue.iter().position(|name| *name == own) {
                Some(0) => return Ok(Turn::Elected(entry.to_string())),
                Some(pos) => tracing::debug!("{} is #{} in the election queue", self.identity, pos + 1),
                None => {
                    tracing::warn!("Contender entry {} vanished", entry);
                    return Ok(Turn::Requeue);
                }
            }

            // Only a removal can move this entry to the head
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ChildEvent::Removed(_)) => break,
                        Some(_) => {}
                        None => return Ok(Turn::Requeue),
                    },
                    _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                }
            }
        }
    }

    /// Hold leadership for one stint
    async fn lead(&self, entry: &str) -> RelinquishReason {
        let mut transitions = self.connection.subscribe();
        let state = self.connection.state();
        if state != ConnectionState::Connected {
            tracing::warn!("{} reached the head of the queue while {:?}", self.identity, state);
            let _ = self.client.delete_once(entry).await;
            return RelinquishReason::ConnectionLost(state);
        }

        let stint = self.stints.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shutdown.child_token();
        self.stint_tx.send_replace(Some(token.clone()));

        self.set_phase(ElectorPhase::Leading);
        self.is_leader.store(true, Ordering::SeqCst);
        self.leader_tx.send_replace(true);
        let _ = self.events.send(LeadershipEvent::Acquired { stint });
        tracing::info!("{} acquired leadership (stint {})", self.identity, stint);
        self.audit
            .record(AuditEvent::new(self.identity.to_string(), AuditKind::LeadershipAcquired))
            .await;

        let reason = self.hold(stint, &token, &mut transitions).await;
        self.relinquish(stint, entry, &token, reason).await
    }

    async fn hold(
        &self,
        stint: u64,
        token: &CancellationToken,
        transitions: &mut broadcast::Receiver<ConnectionTransition>,
    ) -> RelinquishReason {
        let prepare = async {
            let created_at = chrono::Utc::now().to_rfc3339();
            if let Err(e) = self
                .client
                .create_persistent_if_absent(&self.layout.membership_path, created_at.as_bytes())
                .await
            {
                tracing::warn!("Could not ensure {}: {}", self.layout.membership_path, e);
            }
            if let Err(e) = self.watcher.activate().await {
                tracing::warn!("Could not start membership watch: {}", e);
            }
        };

        tokio::select! {
            _ = prepare => {}
            reason = self.interruption(token, transitions) => return reason,
        }

        let ctx = LeadershipContext {
            identity: self.identity.clone(),
            stint,
            cancel: token.clone(),
        };
        let task = self.task.clone();
        let mut handle = tokio::spawn(async move { task.take_leadership(ctx).await });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(())) => RelinquishReason::Completed,
                Ok(Err(e)) => {
                    tracing::warn!("Leadership task failed: {}", e);
                    RelinquishReason::Failed(e.to_string())
                }
                Err(e) if e.is_panic() => {
                    tracing::error!("Leadership task panicked");
                    RelinquishReason::Failed("leadership task panicked".into())
                }
                Err(e) => RelinquishReason::Failed(e.to_string()),
            },
            reason = self.interruption(token, transitions) => {
                self.set_phase(ElectorPhase::Relinquishing);
                self.step_down();
                token.cancel();
                if tokio::time::timeout(TASK_STOP_GRACE, &mut handle).await.is_err() {
                    tracing::warn!("Leadership task ignored cancellation, aborting");
                    handle.abort();
                }
                reason
            }
        }
    }

    /// Resolves when the stint must end for a reason other than the task
    async fn interruption(
        &self,
        token: &CancellationToken,
        transitions: &mut broadcast::Receiver<ConnectionTransition>,
    ) -> RelinquishReason {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return if self.shutdown.is_cancelled() {
                        RelinquishReason::Shutdown
                    } else {
                        RelinquishReason::Interrupted
                    };
                }
                transition = transitions.recv() => match transition {
                    Ok(ConnectionTransition::Suspended) => {
                        return RelinquishReason::ConnectionLost(ConnectionState::Suspended)
                    }
                    Ok(ConnectionTransition::Lost) => {
                        return RelinquishReason::ConnectionLost(ConnectionState::Lost)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let state = self.connection.state();
                        if state != ConnectionState::Connected {
                            return RelinquishReason::ConnectionLost(state);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return RelinquishReason::ConnectionLost(self.connection.state());
                    }
                },
            }
        }
    }

    async fn relinquish(
        &self,
        stint: u64,
        entry: &str,
        token: &CancellationToken,
        reason: RelinquishReason,
    ) -> RelinquishReason {
        self.set_phase(ElectorPhase::Relinquishing);
        self.step_down();
        token.cancel();
        self.stint_tx.send_replace(None);

        self.watcher.deactivate().await;

        let _ = self.events.send(LeadershipEvent::Lost {
            stint,
            reason: reason.clone(),
        });
        tracing::info!(
            "{} relinquished leadership (stint {}): {:?}",
            self.identity,
            stint,
            reason
        );
        self.audit
            .record(
                AuditEvent::new(self.identity.to_string(), AuditKind::LeadershipLost)
                    .with_detail(format!("{:?}", reason)),
            )
            .await;

        if let Err(e) = self.client.delete_once(entry).await {
            tracing::debug!("Could not remove contender entry {}: {}", entry, e);
        }

        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::config::PathConfig;
    use crate::election::ParkUntilCancelled;
    use crate::ensemble::{
        ChildWatch, CreateMode, Ensemble, EnsembleTree, MemoryEnsemble, NodeStat, RetryPolicy, SessionEvent,
        WatchId,
    };

    struct Finite(Duration);

    #[async_trait::async_trait]
    impl LeadershipTask for Finite {
        async fn take_leadership(&self, _ctx: LeadershipContext) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl LeadershipTask for Failing {
        async fn take_leadership(&self, _ctx: LeadershipContext) -> Result<()> {
            Err(Error::LeadershipTask("boom".into()))
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl LeadershipTask for Panicking {
        async fn take_leadership(&self, _ctx: LeadershipContext) -> Result<()> {
            panic!("boom")
        }
    }

    struct Stubborn;

    #[async_trait::async_trait]
    impl LeadershipTask for Stubborn {
        async fn take_leadership(&self, _ctx: LeadershipContext) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Peer {
        backend: Arc<MemoryEnsemble>,
        connection: Arc<ConnectionStateManager>,
        elector: LeaderElector,
        audit: Arc<MemoryAudit>,
    }

    async fn peer(tree: Arc<EnsembleTree>, host: &str, task: Arc<dyn LeadershipTask>) -> Peer {
        let backend = Arc::new(MemoryEnsemble::new(tree));
        let (connection, elector, audit) = elector_on(backend.clone(), host, task).await;
        Peer {
            backend,
            connection,
            elector,
            audit,
        }
    }

    async fn elector_on(
        backend: Arc<dyn Ensemble>,
        host: &str,
        task: Arc<dyn LeadershipTask>,
    ) -> (Arc<ConnectionStateManager>, LeaderElector, Arc<MemoryAudit>) {
        let client = Arc::new(EnsembleClient::new(
            backend,
            RetryPolicy::forever(Duration::from_millis(5)),
        ));
        let connection = Arc::new(ConnectionStateManager::new(&client));
        connection.start().await.unwrap();
        client.connect().await.unwrap();

        let identity = NodeIdentity::new(host, 1);
        let layout = PathLayout::new(&PathConfig::default(), &identity).unwrap();
        let audit = Arc::new(MemoryAudit::new());
        let watcher = Arc::new(MembershipWatcher::new(
            client.clone(),
            identity.to_string(),
            layout.membership_path.clone(),
            audit.clone(),
        ));

        let config = ElectionConfig {
            auto_requeue: true,
            contend_retry_ms: 10,
        };
        let elector = LeaderElector::new(
            ElectorDeps {
                client,
                connection: connection.clone(),
                watcher,
                audit: audit.clone(),
                identity,
                layout,
            },
            task,
            &config,
            &CancellationToken::new(),
        );
        elector.start().await.unwrap();

        (connection, elector, audit)
    }

    /// Applies the first sequential create, then reports the reply as lost
    struct LostReply {
        inner: MemoryEnsemble,
        armed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Ensemble for LostReply {
        async fn connect(&self) -> Result<()> {
            self.inner.connect().await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }

        async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
            let created = self.inner.create(path, data, mode).await?;
            if mode.is_sequential() && self.armed.swap(false, Ordering::SeqCst) {
                return Err(Error::ConnectionLoss("reply dropped".into()));
            }
            Ok(created)
        }

        async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
            self.inner.exists(path).await
        }

        async fn get_children(&self, path: &str) -> Result<Vec<String>> {
            self.inner.get_children(path).await
        }

        async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
            self.inner.get_data(path).await
        }

        async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<NodeStat> {
            self.inner.set_data(path, data).await
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }

        async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
            self.inner.watch_children(path).await
        }

        async fn unwatch(&self, id: WatchId) -> Result<()> {
            self.inner.unwatch(id).await
        }

        fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
            self.inner.session_events()
        }

        fn session_id(&self) -> Option<u64> {
            self.inner.session_id()
        }
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

    async fn next(rx: &mut broadcast::Receiver<LeadershipEvent>) -> LeadershipEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_node_leads_and_parks() {
        let p = peer(Arc::new(EnsembleTree::new()), "a", Arc::new(ParkUntilCancelled)).await;

        assert!(eventually(|| p.elector.is_leader()).await);
        assert_eq!(p.elector.phase(), ElectorPhase::Leading);
        assert_eq!(p.elector.stints(), 1);
        assert!(*p.elector.leadership().borrow());

        p.elector.close().await.unwrap();
        assert!(!p.elector.is_leader());
        assert_eq!(p.elector.phase(), ElectorPhase::Idle);
        assert_eq!(
            p.audit.kinds().await,
            vec![AuditKind::LeadershipAcquired, AuditKind::LeadershipLost]
        );
    }

    #[tokio::test]
    async fn test_completed_task_requeues_and_events_alternate() {
        let p = peer(
            Arc::new(EnsembleTree::new()),
            "a",
            Arc::new(Finite(Duration::from_millis(20))),
        )
        .await;
        let mut rx = p.elector.subscribe();

        assert_eq!(next(&mut rx).await, LeadershipEvent::Acquired { stint: 1 });
        assert_eq!(
            next(&mut rx).await,
            LeadershipEvent::Lost {
                stint: 1,
                reason: RelinquishReason::Completed
            }
        );
        assert_eq!(next(&mut rx).await, LeadershipEvent::Acquired { stint: 2 });
        assert!(matches!(next(&mut rx).await, LeadershipEvent::Lost { stint: 2, .. }));

        p.elector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_and_panicking_tasks_relinquish() {
        let failing = peer(Arc::new(EnsembleTree::new()), "f", Arc::new(Failing)).await;
        let mut rx = failing.elector.subscribe();
        next(&mut rx).await;
        assert_eq!(
            next(&mut rx).await,
            LeadershipEvent::Lost {
                stint: 1,
                reason: RelinquishReason::Failed("Leadership task failed: boom".into())
            }
        );
        failing.elector.close().await.unwrap();

        let panicking = peer(Arc::new(EnsembleTree::new()), "p", Arc::new(Panicking)).await;
        let mut rx = panicking.elector.subscribe();
        next(&mut rx).await;
        assert_eq!(
            next(&mut rx).await,
            LeadershipEvent::Lost {
                stint: 1,
                reason: RelinquishReason::Failed("leadership task panicked".into())
            }
        );
        panicking.elector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_suspension_forfeits_leadership() {
        let p = peer(Arc::new(EnsembleTree::new()), "a", Arc::new(Stubborn)).await;
        assert!(eventually(|| p.elector.is_leader()).await);
        let mut rx = p.elector.subscribe();

        p.backend.suspend().await;
        assert!(eventually(|| !p.elector.is_leader()).await);
        assert_eq!(
            next(&mut rx).await,
            LeadershipEvent::Lost {
                stint: 1,
                reason: RelinquishReason::ConnectionLost(ConnectionState::Suspended)
            }
        );
        assert_eq!(p.connection.state(), ConnectionState::Suspended);

        // Same session back: the stale entry is cleared and leadership returns
        p.backend.resume().await;
        assert_eq!(next(&mut rx).await, LeadershipEvent::Acquired { stint: 2 });
        assert!(p.elector.is_leader());

        p.elector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_loss_forfeits_leadership() {
        let p = peer(Arc::new(EnsembleTree::new()), "a", Arc::new(ParkUntilCancelled)).await;
        assert!(eventually(|| p.elector.is_leader()).await);
        let mut rx = p.elector.subscribe();

        p.backend.expire().await;
        assert!(eventually(|| !p.elector.is_leader()).await);
        assert_eq!(
            next(&mut rx).await,
            LeadershipEvent::Lost {
                stint: 1,
                reason: RelinquishReason::ConnectionLost(ConnectionState::Lost)
            }
        );

        p.backend.reconnect().await;
        assert_eq!(next(&mut rx).await, LeadershipEvent::Acquired { stint: 2 });
        p.elector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_hands_over() {
        let tree = Arc::new(EnsembleTree::new());
        let a = peer(tree.clone(), "a", Arc::new(ParkUntilCancelled)).await;
        assert!(eventually(|| a.elector.is_leader()).await);
        let b = peer(tree.clone(), "b", Arc::new(ParkUntilCancelled)).await;

        // b must be queued behind a before the hand-over
        let mut queued = false;
        for _ in 0..400 {
            if tree.get_children("/fleet/leader").await.unwrap().len() == 2 {
                queued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queued);

        assert!(!b.elector.interrupt_leadership());
        assert!(a.elector.interrupt_leadership());

        assert!(eventually(|| b.elector.is_leader()).await);
        assert!(!a.elector.is_leader());
        assert!(eventually(|| a.elector.phase() == ElectorPhase::Contending).await);

        b.elector.close().await.unwrap();
        assert!(eventually(|| a.elector.is_leader()).await);
        a.elector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_create_reply_leaves_no_orphan() {
        let tree = Arc::new(EnsembleTree::new());
        let backend = Arc::new(LostReply {
            inner: MemoryEnsemble::new(tree.clone()),
            armed: AtomicBool::new(true),
        });
        let (_connection, elector, _audit) = elector_on(backend, "a", Arc::new(ParkUntilCancelled)).await;

        assert!(eventually(|| elector.is_leader()).await);
        assert_eq!(
            tree.get_children("/fleet/leader").await.unwrap(),
            vec!["_c_a:1-lock-0000000000"]
        );

        elector.close().await.unwrap();
    }
}
