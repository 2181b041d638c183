//! Ensemble Server
//!
//! Single-process development ensemble: serves one in-memory
//! [`EnsembleTree`] over the framed protocol. Sessions outlive their TCP
//! connection until they stay silent past their timeout, at which point
//! the reaper expires them and their ephemeral nodes disappear.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{is_disconnect, read_frame, write_frame, Frame, Op, Reply, WireError};
use crate::ensemble::{ChildWatch, EnsembleTree, WatchId};
use crate::error::{Error, Result};

/// How often idle sessions are looked for
const REAP_INTERVAL: Duration = Duration::from_millis(250);

/// Time a new connection has to say hello
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest session timeout granted
const MIN_SESSION_TIMEOUT: Duration = Duration::from_millis(100);

/// Development ensemble server
pub struct EnsembleServer {
    /// Bind address
    bind_address: String,
    /// Served tree
    tree: Arc<EnsembleTree>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl EnsembleServer {
    pub fn new(bind_address: impl Into<String>, tree: Arc<EnsembleTree>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address: bind_address.into(),
            tree,
            shutdown,
        }
    }

    /// The served tree
    pub fn tree(&self) -> &Arc<EnsembleTree> {
        &self.tree
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Ensemble server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let reaper = tokio::spawn(reap(self.tree.clone(), self.shutdown.subscribe()));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let tree = self.tree.clone();
                            let shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, addr, tree, shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        reaper.abort();
        tracing::info!("Ensemble server stopped");
        Ok(())
    }

    /// Stop the server; sessions stay in the tree
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Expire sessions that went silent
async fn reap(tree: Arc<EnsembleTree>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for session in tree.idle_sessions().await {
                    if tree.expire_session(session).await {
                        tracing::info!("Session {:#x} expired", session);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Watches attached through one connection, keyed by the client's id
type ConnectionWatches = HashMap<WatchId, (WatchId, JoinHandle<()>)>;

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    tree: Arc<EnsembleTree>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| Error::ConnectionTimeout(addr.to_string()))??;

    let (session, timeout) = match hello {
        Frame::Hello { session_id, timeout_ms } => {
            let timeout = Duration::from_millis(timeout_ms).max(MIN_SESSION_TIMEOUT);
            match session_id {
                Some(id) if tree.touch(id).await => {
                    tracing::debug!("Session {:#x} resumed from {}", id, addr);
                    (id, timeout)
                }
                Some(id) => {
                    tracing::debug!("Refusing expired session {:#x} from {}", id, addr);
                    write_frame(&mut writer, &Frame::SessionExpired).await?;
                    return Ok(());
                }
                None => {
                    let id = tree.open_session(timeout).await;
                    tracing::info!("Session {:#x} opened by {}", id, addr);
                    (id, timeout)
                }
            }
        }
        other => {
            return Err(Error::Network(format!(
                "Expected Hello from {}, got {}",
                addr,
                other.type_name()
            )));
        }
    };

    write_frame(
        &mut writer,
        &Frame::HelloAck {
            session_id: session,
            timeout_ms: timeout.as_millis() as u64,
        },
    )
    .await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("Write failed: {}", e);
                break;
            }
        }
    });

    let mut watches = ConnectionWatches::new();
    let outcome = tokio::select! {
        outcome = serve_session(&mut reader, session, timeout, &tree, &out_tx, &mut watches) => outcome,
        _ = shutdown.changed() => Ok(false),
    };

    for (_, (tree_watch, task)) in watches.drain() {
        task.abort();
        tree.unwatch(tree_watch).await;
    }

    if matches!(outcome, Ok(true)) && tree.expire_session(session).await {
        tracing::info!("Session {:#x} closed by {}", session, addr);
    }

    // Flush whatever is queued (a trailing SessionExpired in particular)
    drop(out_tx);
    let _ = writer_task.await;

    outcome.map(|_| ())
}

/// Serve requests until the link ends; true if the client said goodbye
async fn serve_session(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    session: u64,
    timeout: Duration,
    tree: &Arc<EnsembleTree>,
    out: &mpsc::UnboundedSender<Frame>,
    watches: &mut ConnectionWatches,
) -> Result<bool> {
    loop {
        let frame = match tokio::time::timeout(timeout, read_frame(reader)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) if is_disconnect(&e) => return Ok(false),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::debug!("Session {:#x} link idle, dropping it", session);
                return Ok(false);
            }
        };

        if !tree.touch(session).await {
            let _ = out.send(Frame::SessionExpired);
            return Ok(false);
        }

        match frame {
            Frame::Ping => {
                let _ = out.send(Frame::Pong);
            }
            Frame::Goodbye => return Ok(true),
            Frame::Request { xid, op } => {
                tracing::trace!("Session {:#x} xid {} {}", session, xid, op.name());
                let (result, attached) = execute(tree, session, op, watches).await;
                let _ = out.send(Frame::Response { xid, result });

                // Events may only follow the response that announced the watch
                if let Some((client_id, watch)) = attached {
                    let task = tokio::spawn(forward_events(client_id, watch.events, out.clone()));
                    watches.insert(client_id, (watch.id, task));
                }
            }
            other => {
                tracing::warn!("Unexpected {} on session {:#x}", other.type_name(), session);
            }
        }
    }
}

async fn execute(
    tree: &EnsembleTree,
    session: u64,
    op: Op,
    watches: &mut ConnectionWatches,
) -> (std::result::Result<Reply, WireError>, Option<(WatchId, ChildWatch)>) {
    let result = match op {
        Op::Create { path, data, mode } => tree.create(session, &path, data, mode).await.map(Reply::Created),
        Op::Exists { path } => tree.exists(&path).await.map(Reply::Stat),
        Op::GetChildren { path } => tree.get_children(&path).await.map(Reply::Children),
        Op::GetData { path } => tree.get_data(&path).await.map(|(data, stat)| Reply::Data(data, stat)),
        Op::SetData { path, data } => tree.set_data(&path, data).await.map(Reply::Updated),
        Op::Delete { path } => tree.delete(&path).await.map(|_| Reply::Done),
        Op::WatchChildren { path, watch_id } => {
            if let Some((stale, task)) = watches.remove(&watch_id) {
                task.abort();
                tree.unwatch(stale).await;
            }
            return match tree.watch_children(session, &path).await {
                Ok(watch) => (Ok(Reply::Done), Some((watch_id, watch))),
                Err(e) => (Err(WireError::from(&e)), None),
            };
        }
        Op::Unwatch { watch_id } => {
            if let Some((tree_watch, task)) = watches.remove(&watch_id) {
                task.abort();
                tree.unwatch(tree_watch).await;
            }
            Ok(Reply::Done)
        }
    };

    (result.map_err(|e| WireError::from(&e)), None)
}

async fn forward_events(
    watch_id: WatchId,
    mut events: mpsc::UnboundedReceiver<crate::ensemble::ChildEvent>,
    out: mpsc::UnboundedSender<Frame>,
) {
    while let Some(event) = events.recv().await {
        if out.send(Frame::Event { watch_id, event }).is_err() {
            break;
        }
    }
}
