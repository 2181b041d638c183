//! Remote Ensemble
//!
//! [`Ensemble`] backend talking to an [`EnsembleServer`](super::EnsembleServer)
//! over TCP. A supervisor task keeps the link alive with pings, resumes
//! the same session after a dropped link and opens a fresh one once the
//! server reports the old session expired. Child watches are re-attached
//! on resume, and changes missed while the link was down are replayed as
//! synthetic events.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{is_disconnect, read_frame, write_frame, Frame, Op, Reply, WireError};
use crate::config::EnsembleConfig;
use crate::ensemble::{ChildEvent, ChildWatch, CreateMode, Ensemble, NodeStat, SessionEvent, WatchId};
use crate::error::{Error, Result};

/// Time the writer gets to flush after its link is dropped
const WRITER_DRAIN: Duration = Duration::from_millis(200);

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Reply, WireError>>>;

#[derive(Debug, Clone)]
struct Settings {
    address: String,
    session_timeout: Duration,
    connect_timeout: Duration,
    reconnect_interval: Duration,
}

/// Live connection to the server
#[derive(Clone)]
struct Link {
    out: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<PendingMap>>,
}

struct LinkTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct LocalWatch {
    path: String,
    tx: mpsc::UnboundedSender<ChildEvent>,
    /// Children as last reported, used to replay missed changes
    children: BTreeSet<String>,
}

impl LocalWatch {
    fn apply(&mut self, event: &ChildEvent) {
        match event {
            ChildEvent::Added(name) => {
                self.children.insert(name.clone());
            }
            ChildEvent::Removed(name) => {
                self.children.remove(name);
            }
            ChildEvent::Updated(_) => {}
        }
    }
}

enum Handshake {
    Established(TcpStream, u64),
    Expired,
}

struct Shared {
    settings: Settings,
    /// 0 = no session
    session: AtomicU64,
    connected_once: AtomicBool,
    link: RwLock<Option<Link>>,
    events: broadcast::Sender<SessionEvent>,
    watches: Mutex<HashMap<WatchId, LocalWatch>>,
    next_xid: AtomicU64,
    next_watch: AtomicU64,
    epoch: Instant,
    /// Milliseconds since `epoch` at which the server was last heard
    last_heard: AtomicU64,
}

/// Ensemble session over the network
pub struct RemoteEnsemble {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl RemoteEnsemble {
    /// Create a session handle for the server at `address`
    pub fn new(address: impl Into<String>, session_timeout: Duration) -> Self {
        Self::with_settings(Settings {
            address: address.into(),
            session_timeout,
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(500),
        })
    }

    /// Create a session handle from the ensemble configuration
    pub fn from_config(config: &EnsembleConfig) -> Self {
        Self::with_settings(Settings {
            address: config.address.clone(),
            session_timeout: config.session_timeout(),
            connect_timeout: config.connect_timeout(),
            reconnect_interval: config.retry_interval(),
        })
    }

    fn with_settings(settings: Settings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                settings,
                session: AtomicU64::new(0),
                connected_once: AtomicBool::new(false),
                link: RwLock::new(None),
                events,
                watches: Mutex::new(HashMap::new()),
                next_xid: AtomicU64::new(1),
                next_watch: AtomicU64::new(1),
                epoch: Instant::now(),
                last_heard: AtomicU64::new(0),
            }),
            supervisor: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Server address
    pub fn address(&self) -> &str {
        &self.shared.settings.address
    }

    /// Whether a link to the server is currently up
    pub async fn is_linked(&self) -> bool {
        self.shared.link.read().await.is_some()
    }

    async fn call(&self, op: Op) -> Result<Reply> {
        if self.closed.is_cancelled() {
            return Err(Error::NotStarted("ensemble session".into()));
        }
        self.shared.request(op).await
    }
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn mark_heard(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_heard.store(now, Ordering::SeqCst);
    }

    fn silence(&self) -> Duration {
        let heard = Duration::from_millis(self.last_heard.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(heard)
    }

    async fn request(&self, op: Op) -> Result<Reply> {
        let link = match self.link.read().await.clone() {
            Some(link) => link,
            None if !self.connected_once.load(Ordering::SeqCst) => {
                return Err(Error::NotStarted("ensemble session".into()));
            }
            None => return Err(Error::ConnectionLoss("no link to ensemble".into())),
        };

        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        link.pending.lock().await.insert(xid, tx);

        if link.out.send(Frame::Request { xid, op }).is_err() {
            link.pending.lock().await.remove(&xid);
            return Err(Error::ConnectionLoss("link closed".into()));
        }

        match tokio::time::timeout(self.settings.session_timeout, rx).await {
            Ok(Ok(result)) => result.map_err(Error::from),
            Ok(Err(_)) => Err(Error::ConnectionLoss("link dropped before reply".into())),
            Err(_) => {
                link.pending.lock().await.remove(&xid);
                Err(Error::ConnectionTimeout(self.settings.address.clone()))
            }
        }
    }

    /// Install a handshaken stream as the live link
    async fn attach(self: &Arc<Self>, stream: TcpStream) -> LinkTasks {
        let (reader, mut writer) = stream.into_split();
        let (out, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let pending = Arc::new(Mutex::new(PendingMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!("Ensemble write failed: {}", e);
                    break;
                }
            }
        });
        let reader = tokio::spawn(read_loop(self.clone(), reader, pending.clone()));

        self.mark_heard();
        *self.link.write().await = Some(Link { out, pending });
        LinkTasks { reader, writer }
    }

    /// Drop the live link, failing requests still waiting on it
    async fn detach(&self, tasks: LinkTasks) {
        tasks.reader.abort();
        if let Some(link) = self.link.write().await.take() {
            link.pending.lock().await.clear();
        }

        let mut writer = tasks.writer;
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
    }

    async fn deliver(&self, watch_id: WatchId, event: ChildEvent) {
        let mut watches = self.watches.lock().await;
        let gone = match watches.get_mut(&watch_id) {
            Some(watch) => {
                watch.apply(&event);
                watch.tx.send(event).is_err()
            }
            None => false,
        };
        if gone {
            watches.remove(&watch_id);
        }
    }

    /// Re-register watches on a resumed session and replay missed changes
    async fn reattach_watches(&self) {
        let snapshot: Vec<(WatchId, String)> = self
            .watches
            .lock()
            .await
            .iter()
            .map(|(id, w)| (*id, w.path.clone()))
            .collect();

        for (watch_id, path) in snapshot {
            let op = Op::WatchChildren {
                path: path.clone(),
                watch_id,
            };
            if let Err(e) = self.request(op).await {
                tracing::warn!("Failed to re-attach watch on {}: {}", path, e);
                continue;
            }

            let current: BTreeSet<String> = match self.request(Op::GetChildren { path: path.clone() }).await {
                Ok(Reply::Children(children)) => children.into_iter().collect(),
                Ok(_) | Err(Error::NoNode(_)) => BTreeSet::new(),
                Err(e) => {
                    tracing::warn!("Failed to resync children of {}: {}", path, e);
                    continue;
                }
            };

            let mut watches = self.watches.lock().await;
            if let Some(watch) = watches.get_mut(&watch_id) {
                let missed: Vec<ChildEvent> = watch
                    .children
                    .difference(&current)
                    .map(|n| ChildEvent::Removed(n.clone()))
                    .chain(current.difference(&watch.children).map(|n| ChildEvent::Added(n.clone())))
                    .collect();
                if !missed.is_empty() {
                    tracing::debug!("Replaying {} missed change(s) on {}", missed.len(), path);
                }
                for event in missed {
                    let _ = watch.tx.send(event);
                }
                watch.children = current;
            }
        }
    }

    /// Keep the link alive; returns why it ended
    async fn hold(&self, tasks: &mut LinkTasks, closed: &CancellationToken) -> &'static str {
        let interval = (self.settings.session_timeout / 3).max(Duration::from_millis(10));
        let read_timeout = self.settings.session_timeout * 2 / 3;
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = closed.cancelled() => return "closed",
                _ = &mut tasks.reader => return "ensemble closed the link",
                _ = ticker.tick() => {
                    if self.silence() > read_timeout {
                        return "ensemble stopped answering";
                    }
                    let out = self.link.read().await.as_ref().map(|l| l.out.clone());
                    match out {
                        Some(out) if out.send(Frame::Ping).is_ok() => {}
                        _ => return "writer stopped",
                    }
                }
            }
        }
    }

    /// Dial until a session is back; `None` once closed
    async fn reestablish(self: &Arc<Self>, closed: &CancellationToken) -> Option<LinkTasks> {
        let mut resume = Some(self.session.load(Ordering::SeqCst)).filter(|id| *id != 0);

        loop {
            tokio::select! {
                _ = closed.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.reconnect_interval) => {}
            }

            let attempt = tokio::select! {
                _ = closed.cancelled() => return None,
                result = dial(&self.settings, resume) => result,
            };

            match attempt {
                Ok(Handshake::Established(stream, session_id)) => {
                    let tasks = self.attach(stream).await;
                    self.session.store(session_id, Ordering::SeqCst);
                    if resume.is_some() {
                        tracing::info!("Ensemble session {:#x} resumed", session_id);
                    } else {
                        tracing::info!("Ensemble session {:#x} established", session_id);
                    }
                    self.emit(SessionEvent::SyncConnected { session_id });
                    if resume.is_some() {
                        self.reattach_watches().await;
                    }
                    return Some(tasks);
                }
                Ok(Handshake::Expired) => {
                    tracing::warn!("Ensemble session expired");
                    self.watches.lock().await.clear();
                    self.session.store(0, Ordering::SeqCst);
                    self.emit(SessionEvent::Expired);
                    resume = None;
                }
                Err(e) => {
                    tracing::debug!("Reconnect to {} failed: {}", self.settings.address, e);
                }
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, pending: Arc<Mutex<PendingMap>>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                if !is_disconnect(&e) {
                    tracing::debug!("Ensemble read failed: {}", e);
                }
                break;
            }
        };
        shared.mark_heard();

        match frame {
            Frame::Response { xid, result } => {
                if let Some(tx) = pending.lock().await.remove(&xid) {
                    let _ = tx.send(result);
                }
            }
            Frame::Event { watch_id, event } => shared.deliver(watch_id, event).await,
            Frame::Pong => {}
            Frame::SessionExpired => {
                tracing::debug!("Ensemble reports the session expired");
                break;
            }
            other => {
                tracing::warn!("Unexpected {} from ensemble", other.type_name());
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut tasks: LinkTasks, closed: CancellationToken) {
    loop {
        let reason = shared.hold(&mut tasks, &closed).await;
        shared.detach(tasks).await;
        if closed.is_cancelled() {
            break;
        }

        tracing::warn!("Ensemble link lost: {}", reason);
        shared.emit(SessionEvent::Disconnected);

        tasks = match shared.reestablish(&closed).await {
            Some(tasks) => tasks,
            None => break,
        };
    }
}

/// Connect and say hello, resuming `session` if given
async fn dial(settings: &Settings, session: Option<u64>) -> Result<Handshake> {
    match tokio::time::timeout(settings.connect_timeout, handshake(settings, session)).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectionTimeout(settings.address.clone())),
    }
}

async fn handshake(settings: &Settings, session: Option<u64>) -> Result<Handshake> {
    let mut stream = TcpStream::connect(&settings.address)
        .await
        .map_err(|e| Error::ConnectionFailed {
            address: settings.address.clone(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;

    let hello = Frame::Hello {
        session_id: session,
        timeout_ms: settings.session_timeout.as_millis() as u64,
    };
    write_frame(&mut stream, &hello).await?;

    match read_frame(&mut stream).await? {
        Frame::HelloAck { session_id, .. } => Ok(Handshake::Established(stream, session_id)),
        Frame::SessionExpired => Ok(Handshake::Expired),
        other => Err(Error::Network(format!(
            "Expected HelloAck, got {}",
            other.type_name()
        ))),
    }
}

#[async_trait::async_trait]
impl Ensemble for RemoteEnsemble {
    async fn connect(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if self.closed.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let (stream, session_id) = match dial(&self.shared.settings, None).await? {
            Handshake::Established(stream, session_id) => (stream, session_id),
            Handshake::Expired => return Err(Error::SessionExpired),
        };

        let tasks = self.shared.attach(stream).await;
        self.shared.session.store(session_id, Ordering::SeqCst);
        self.shared.connected_once.store(true, Ordering::SeqCst);
        tracing::info!(
            "Ensemble session {:#x} established with {}",
            session_id,
            self.shared.settings.address
        );
        self.shared.emit(SessionEvent::SyncConnected { session_id });

        *supervisor = Some(tokio::spawn(supervise(
            self.shared.clone(),
            tasks,
            self.closed.clone(),
        )));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if self.closed.is_cancelled() {
            return Ok(());
        }

        if let Some(link) = self.shared.link.read().await.as_ref() {
            let _ = link.out.send(Frame::Goodbye);
        }
        self.closed.cancel();
        if let Some(handle) = supervisor.take() {
            let _ = handle.await;
        }

        self.shared.watches.lock().await.clear();
        self.shared.session.store(0, Ordering::SeqCst);
        self.shared.emit(SessionEvent::Closed);
        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let op = Op::Create {
            path: path.to_string(),
            data,
            mode,
        };
        match self.call(op).await? {
            Reply::Created(actual) => Ok(actual),
            other => Err(unexpected("create", &other)),
        }
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        match self.call(Op::Exists { path: path.to_string() }).await? {
            Reply::Stat(stat) => Ok(stat),
            other => Err(unexpected("exists", &other)),
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        match self.call(Op::GetChildren { path: path.to_string() }).await? {
            Reply::Children(children) => Ok(children),
            other => Err(unexpected("get_children", &other)),
        }
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        match self.call(Op::GetData { path: path.to_string() }).await? {
            Reply::Data(data, stat) => Ok((data, stat)),
            other => Err(unexpected("get_data", &other)),
        }
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<NodeStat> {
        let op = Op::SetData {
            path: path.to_string(),
            data,
        };
        match self.call(op).await? {
            Reply::Updated(stat) => Ok(stat),
            other => Err(unexpected("set_data", &other)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.call(Op::Delete { path: path.to_string() }).await?;
        Ok(())
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        let watch_id = self.shared.next_watch.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::unbounded_channel();

        // Registered first so no event can race ahead of the entry
        self.shared.watches.lock().await.insert(
            watch_id,
            LocalWatch {
                path: path.to_string(),
                tx,
                children: BTreeSet::new(),
            },
        );

        let op = Op::WatchChildren {
            path: path.to_string(),
            watch_id,
        };
        if let Err(e) = self.call(op).await {
            self.shared.watches.lock().await.remove(&watch_id);
            return Err(e);
        }

        if let Ok(Reply::Children(children)) = self.call(Op::GetChildren { path: path.to_string() }).await {
            if let Some(watch) = self.shared.watches.lock().await.get_mut(&watch_id) {
                watch.children.extend(children);
            }
        }

        Ok(ChildWatch { id: watch_id, events })
    }

    async fn unwatch(&self, id: WatchId) -> Result<()> {
        if self.shared.watches.lock().await.remove(&id).is_none() {
            return Ok(());
        }
        // Detaching works on a degraded link too; the server drops the rest
        if let Err(e) = self.shared.request(Op::Unwatch { watch_id: id }).await {
            tracing::debug!("Server-side unwatch of {} failed: {}", id, e);
        }
        Ok(())
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    fn session_id(&self) -> Option<u64> {
        match self.shared.session.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

fn unexpected(op: &str, reply: &Reply) -> Error {
    Error::Network(format!("Unexpected reply to {}: {:?}", op, reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::EnsembleTree;
    use crate::network::EnsembleServer;
    use std::net::SocketAddr;

    async fn serve_on(addr: &str, tree: Arc<EnsembleTree>) -> (Arc<EnsembleServer>, SocketAddr) {
        let server = Arc::new(EnsembleServer::new(addr, tree));
        let mut bound = None;
        for _ in 0..50 {
            match server.bind().await {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let listener = bound.unwrap();
        let local = listener.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, local)
    }

    async fn next(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn next_child(watch: &mut ChildWatch) -> ChildEvent {
        tokio::time::timeout(Duration::from_secs(5), watch.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn remote(addr: SocketAddr) -> RemoteEnsemble {
        let mut config = EnsembleConfig::with_address(addr.to_string());
        config.session_timeout_ms = 900;
        config.retry_interval_ms = 50;
        RemoteEnsemble::from_config(&config)
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let ensemble = RemoteEnsemble::new("127.0.0.1:1", Duration::from_secs(1));
        assert!(matches!(ensemble.exists("/").await, Err(Error::NotStarted(_))));
        assert!(ensemble.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_ephemerals_follow_the_session() {
        let tree = Arc::new(EnsembleTree::new());
        let (server, addr) = serve_on("127.0.0.1:0", tree.clone()).await;

        let a = remote(addr);
        let b = remote(addr);
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        assert_ne!(a.session_id(), b.session_id());

        a.create("/fleet", Vec::new(), CreateMode::Persistent).await.unwrap();
        let mut watch = b.watch_children("/fleet").await.unwrap();

        let seq = a
            .create("/fleet/_c_a-lock-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(seq, "/fleet/_c_a-lock-0000000000");
        assert_eq!(next_child(&mut watch).await, ChildEvent::Added("_c_a-lock-0000000000".into()));

        assert!(matches!(
            a.create("/fleet", Vec::new(), CreateMode::Persistent).await,
            Err(Error::NodeExists(_))
        ));

        a.close().await.unwrap();
        assert_eq!(next_child(&mut watch).await, ChildEvent::Removed("_c_a-lock-0000000000".into()));
        assert_eq!(b.get_children("/fleet").await.unwrap(), Vec::<String>::new());

        b.unwatch(watch.id).await.unwrap();
        b.close().await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_resume_then_expiry() {
        let tree = Arc::new(EnsembleTree::new());
        let (server, addr) = serve_on("127.0.0.1:0", tree.clone()).await;

        let ensemble = remote(addr);
        let mut events = ensemble.session_events();
        ensemble.connect().await.unwrap();
        let first = ensemble.session_id().unwrap();
        assert_eq!(next(&mut events).await, SessionEvent::SyncConnected { session_id: first });

        ensemble.create("/m", Vec::new(), CreateMode::Persistent).await.unwrap();
        let mut watch = ensemble.watch_children("/m").await.unwrap();

        // Drop the link; the session survives and is resumed
        server.stop();
        assert_eq!(next(&mut events).await, SessionEvent::Disconnected);
        tree.create(0, "/m/missed", Vec::new(), CreateMode::Persistent).await.unwrap();
        let (server, _) = serve_on(&addr.to_string(), tree.clone()).await;
        assert_eq!(next(&mut events).await, SessionEvent::SyncConnected { session_id: first });
        assert_eq!(next_child(&mut watch).await, ChildEvent::Added("missed".into()));

        // Drop it again and let the session die meanwhile
        server.stop();
        assert_eq!(next(&mut events).await, SessionEvent::Disconnected);
        tree.expire_session(first).await;
        let (server, _) = serve_on(&addr.to_string(), tree.clone()).await;
        assert_eq!(next(&mut events).await, SessionEvent::Expired);
        match next(&mut events).await {
            SessionEvent::SyncConnected { session_id } => assert_ne!(session_id, first),
            other => panic!("unexpected {:?}", other),
        }
        assert!(watch.events.recv().await.is_none());

        ensemble.close().await.unwrap();
        assert_eq!(next(&mut events).await, SessionEvent::Closed);
        server.stop();
    }
}
