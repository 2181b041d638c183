//! Ensemble client
//!
//! Lifecycle-tracking wrapper around an [`Ensemble`] backend. Every
//! operation except the `_once` variants runs under the retry policy, and
//! `close()` preempts all in-flight retries.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{path, ChildWatch, CreateMode, Ensemble, NodeStat, RetryPolicy, SessionEvent, WatchId};
use crate::error::{Error, Result};

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    Latent,
    Started,
    Stopped,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Latent,
            1 => ClientState::Started,
            _ => ClientState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ClientState::Latent => 0,
            ClientState::Started => 1,
            ClientState::Stopped => 2,
        }
    }
}

/// Result of an ephemeral create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Node created at the returned path
    Created(String),
    /// A node already existed at the path
    AlreadyExists,
}

/// Client for a coordination ensemble
pub struct EnsembleClient {
    backend: Arc<dyn Ensemble>,
    retry: RetryPolicy,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl EnsembleClient {
    /// Create a latent client
    pub fn new(backend: Arc<dyn Ensemble>, retry: RetryPolicy) -> Self {
        Self::with_cancel(backend, retry, CancellationToken::new())
    }

    /// Create a latent client whose retries also stop when `cancel` fires
    pub fn with_cancel(backend: Arc<dyn Ensemble>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            backend,
            retry,
            state: AtomicU8::new(ClientState::Latent.as_u8()),
            shutdown: cancel,
        }
    }

    /// Lifecycle state
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_started(&self) -> bool {
        self.state() == ClientState::Started
    }

    /// Current backend session, if any
    pub fn session_id(&self) -> Option<u64> {
        self.backend.session_id()
    }

    /// Subscribe to raw session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.backend.session_events()
    }

    /// Connect to the ensemble, retrying until it answers or the client closes
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ClientState::Started => return Ok(()),
            ClientState::Stopped => return Err(Error::ShuttingDown),
            ClientState::Latent => {}
        }

        let backend = &self.backend;
        self.retry
            .run("ensemble connect", &self.shutdown, || backend.connect())
            .await?;

        // close() may have raced the connect
        if self
            .state
            .compare_exchange(
                ClientState::Latent.as_u8(),
                ClientState::Started.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            let _ = self.backend.close().await;
            return Err(Error::ShuttingDown);
        }

        tracing::info!("Ensemble client started");
        Ok(())
    }

    /// Close the client, cancelling in-flight retries and ending the session
    pub async fn close(&self) -> Result<()> {
        let previous = ClientState::from_u8(self.state.swap(ClientState::Stopped.as_u8(), Ordering::SeqCst));
        if previous == ClientState::Stopped {
            return Ok(());
        }

        self.shutdown.cancel();
        if previous == ClientState::Started {
            self.backend.close().await?;
            tracing::info!("Ensemble client closed");
        }
        Ok(())
    }

    fn guard(&self) -> Result<()> {
        match self.state() {
            ClientState::Started => Ok(()),
            ClientState::Latent => Err(Error::NotStarted("ensemble client".into())),
            ClientState::Stopped => Err(Error::ShuttingDown),
        }
    }

    /// Create an ephemeral node owned by this session
    pub async fn create_ephemeral(&self, node_path: &str, payload: &[u8]) -> Result<CreateOutcome> {
        self.guard()?;
        let backend = &self.backend;
        let result = self
            .retry
            .run("create ephemeral", &self.shutdown, || {
                backend.create(node_path, payload.to_vec(), CreateMode::Ephemeral)
            })
            .await;

        match result {
            Ok(actual) => Ok(CreateOutcome::Created(actual)),
            Err(Error::NodeExists(_)) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    /// Create an ephemeral node with an ensemble-assigned sequence suffix
    pub async fn create_ephemeral_sequential(&self, prefix: &str, payload: &[u8]) -> Result<String> {
        self.guard()?;
        let backend = &self.backend;
        self.retry
            .run("create sequential", &self.shutdown, || {
                backend.create(prefix, payload.to_vec(), CreateMode::EphemeralSequential)
            })
            .await
    }

    /// Create a durable node and any missing ancestors
    ///
    /// Returns whether the node itself was created by this call.
    pub async fn create_persistent_if_absent(&self, node_path: &str, payload: &[u8]) -> Result<bool> {
        self.guard()?;
        path::validate(node_path)?;

        let backend = &self.backend;
        let mut created = false;

        for segment in path::ancestors(node_path) {
            let data = if segment == node_path { payload.to_vec() } else { Vec::new() };
            let result = self
                .retry
                .run("create persistent", &self.shutdown, || {
                    backend.create(&segment, data.clone(), CreateMode::Persistent)
                })
                .await;

            match result {
                Ok(_) => {
                    tracing::debug!("Created durable node {}", segment);
                    created = segment == node_path;
                }
                Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(created)
    }

    /// Whether a node exists
    pub async fn exists(&self, node_path: &str) -> Result<bool> {
        Ok(self.stat(node_path).await?.is_some())
    }

    /// Stat a node
    pub async fn stat(&self, node_path: &str) -> Result<Option<NodeStat>> {
        self.guard()?;
        let backend = &self.backend;
        self.retry
            .run("exists", &self.shutdown, || backend.exists(node_path))
            .await
    }

    /// List a node's children
    pub async fn get_children(&self, node_path: &str) -> Result<Vec<String>> {
        self.guard()?;
        let backend = &self.backend;
        self.retry
            .run("get children", &self.shutdown, || backend.get_children(node_path))
            .await
    }

    /// List a node's children with a single attempt
    pub async fn get_children_once(&self, node_path: &str) -> Result<Vec<String>> {
        self.guard()?;
        self.backend.get_children(node_path).await
    }

    /// Read a node's payload
    pub async fn get_data(&self, node_path: &str) -> Result<Vec<u8>> {
        self.guard()?;
        let backend = &self.backend;
        let (data, _) = self
            .retry
            .run("get data", &self.shutdown, || backend.get_data(node_path))
            .await?;
        Ok(data)
    }

    /// Delete a node
    pub async fn delete(&self, node_path: &str) -> Result<()> {
        self.guard()?;
        let backend = &self.backend;
        self.retry
            .run("delete", &self.shutdown, || backend.delete(node_path))
            .await
    }

    /// Delete a node with a single attempt; a missing node is not an error
    pub async fn delete_once(&self, node_path: &str) -> Result<()> {
        self.guard()?;
        match self.backend.delete(node_path).await {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Attach a child watch
    pub async fn watch_children(&self, node_path: &str) -> Result<ChildWatch> {
        self.guard()?;
        let backend = &self.backend;
        self.retry
            .run("watch children", &self.shutdown, || backend.watch_children(node_path))
            .await
    }

    /// Detach a child watch (single attempt)
    pub async fn unwatch(&self, id: WatchId) -> Result<()> {
        self.backend.unwatch(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{EnsembleTree, MemoryEnsemble};
    use std::time::Duration;

    fn client() -> (Arc<MemoryEnsemble>, EnsembleClient) {
        let backend = Arc::new(MemoryEnsemble::new(Arc::new(EnsembleTree::new())));
        let client = EnsembleClient::new(backend.clone(), RetryPolicy::forever(Duration::from_millis(5)));
        (backend, client)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (_backend, client) = client();
        assert_eq!(client.state(), ClientState::Latent);
        assert!(matches!(client.exists("/").await, Err(Error::NotStarted(_))));

        client.connect().await.unwrap();
        assert!(client.is_started());
        assert!(client.exists("/").await.unwrap());

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Stopped);
        assert!(matches!(client.connect().await, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let (_backend, client) = client();
        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_create_persistent_creates_ancestors() {
        let (backend, client) = client();
        client.connect().await.unwrap();

        assert!(client.create_persistent_if_absent("/a/b/c", b"x").await.unwrap());
        assert!(!client.create_persistent_if_absent("/a/b/c", b"x").await.unwrap());

        let stat = backend.exists("/a/b").await.unwrap().unwrap();
        assert!(!stat.is_ephemeral());
        assert_eq!(client.get_data("/a/b/c").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_create_ephemeral_outcomes() {
        let (_backend, client) = client();
        client.connect().await.unwrap();
        client.create_persistent_if_absent("/m", b"").await.unwrap();

        assert_eq!(
            client.create_ephemeral("/m/n", b"").await.unwrap(),
            CreateOutcome::Created("/m/n".into())
        );
        assert_eq!(client.create_ephemeral("/m/n", b"").await.unwrap(), CreateOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn test_retries_survive_transient_failures() {
        let (backend, client) = client();
        client.connect().await.unwrap();

        backend.fail_next(5);
        assert_eq!(client.get_children("/").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_once_variants_do_not_retry() {
        let (backend, client) = client();
        client.connect().await.unwrap();

        backend.fail_next(1);
        assert!(client.get_children_once("/").await.is_err());
        assert!(client.delete_once("/missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_preempts_retry() {
        let (backend, client) = client();
        let client = Arc::new(client);
        client.connect().await.unwrap();
        backend.suspend().await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.exists("/").await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        client.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
