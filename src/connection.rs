//! Connection State Manager
//!
//! Turns raw session events into the connection state machine:
//!
//! ```text
//! Disconnected --SyncConnected--> Connected
//! Connected    --Disconnected---> Suspended
//! Suspended    --same session---> Connected   (Resumed)
//! Connected/Suspended --Expired-> Lost
//! Lost         --new session----> Connected   (Reconnected)
//! ```
//!
//! A new session id seen while Suspended is an implicit expiry and yields
//! both `Lost` and `Reconnected`. Transitions are processed by a single
//! event-loop task and delivered to each listener in order.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ensemble::{EnsembleClient, SessionEvent};
use crate::error::{Error, Result};

/// Connection state as seen by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Suspended,
    Lost,
}

/// A change of connection state delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionTransition {
    /// First session established
    Connected,
    /// Link dropped, session possibly alive
    Suspended,
    /// Same session back after a suspension
    Resumed,
    /// Session gone along with its ephemeral nodes
    Lost,
    /// New session after a loss
    Reconnected,
}

impl ConnectionTransition {
    /// State the node is in after this transition
    pub fn state(&self) -> ConnectionState {
        match self {
            ConnectionTransition::Connected
            | ConnectionTransition::Resumed
            | ConnectionTransition::Reconnected => ConnectionState::Connected,
            ConnectionTransition::Suspended => ConnectionState::Suspended,
            ConnectionTransition::Lost => ConnectionState::Lost,
        }
    }
}

/// Receives connection transitions, one at a time, in ensemble order
#[async_trait::async_trait]
pub trait ConnectionStateListener: Send + Sync {
    async fn state_changed(&self, transition: ConnectionTransition);
}

/// Apply one session event to the state machine
///
/// Returns the transitions to deliver, in order. `session` tracks the last
/// session id seen.
pub fn apply_event(
    state: ConnectionState,
    session: &mut Option<u64>,
    event: SessionEvent,
) -> Vec<ConnectionTransition> {
    use ConnectionState as S;
    use ConnectionTransition as T;

    match event {
        SessionEvent::SyncConnected { session_id } => {
            let same = *session == Some(session_id);
            *session = Some(session_id);
            match state {
                S::Disconnected => vec![T::Connected],
                S::Lost => vec![T::Reconnected],
                S::Suspended if same => vec![T::Resumed],
                S::Connected if same => Vec::new(),
                S::Suspended | S::Connected => vec![T::Lost, T::Reconnected],
            }
        }
        SessionEvent::Disconnected => match state {
            S::Connected => vec![T::Suspended],
            _ => Vec::new(),
        },
        SessionEvent::Expired => match state {
            S::Connected | S::Suspended => vec![T::Lost],
            _ => Vec::new(),
        },
        SessionEvent::Closed => Vec::new(),
    }
}

/// Tracks the connection state of one ensemble client
pub struct ConnectionStateManager {
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionTransition>,
    running: AtomicBool,
    shutdown: CancellationToken,
    events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionStateManager {
    /// Create a manager for a client
    ///
    /// Subscribes immediately so no event emitted before `start()` is lost.
    pub fn new(client: &EnsembleClient) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);

        Self {
            state_tx,
            transitions,
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            events: Mutex::new(Some(client.subscribe())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch the current state
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionTransition> {
        self.transitions.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the event loop
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let mut events = match self.events.lock().await.take() {
            Some(rx) => rx,
            None => return Ok(()),
        };

        let state_tx = self.state_tx.clone();
        let transitions = self.transitions.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut session = None;

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Connection manager lagged, {} session event(s) dropped", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                tracing::debug!("Session event: {:?}", event);

                if event == SessionEvent::Closed {
                    state_tx.send_replace(ConnectionState::Disconnected);
                    break;
                }

                let current = *state_tx.borrow();
                for transition in apply_event(current, &mut session, event) {
                    match transition {
                        ConnectionTransition::Suspended => {
                            tracing::warn!("Ensemble connection suspended")
                        }
                        ConnectionTransition::Lost => tracing::warn!("Ensemble session lost"),
                        other => tracing::info!("Ensemble connection: {:?}", other),
                    }
                    state_tx.send_replace(transition.state());
                    let _ = transitions.send(transition);
                }
            }

            tracing::debug!("Connection state loop stopped");
        });

        self.tasks.lock().await.push(handle);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Attach a listener; fails with `NotStarted` until the manager runs
    pub async fn add_listener(&self, listener: Arc<dyn ConnectionStateListener>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotStarted("connection state manager".into()));
        }

        let mut rx = self.transitions.subscribe();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let transition = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    t = rx.recv() => t,
                };

                match transition {
                    Ok(t) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = listener.state_changed(t) => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Connection listener lagged, {} transition(s) dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Attach a listener, retrying with a fixed delay until it succeeds
    ///
    /// Returns `Error::Cancelled` as soon as `cancel` fires.
    pub async fn attach_with_retry(
        &self,
        listener: Arc<dyn ConnectionStateListener>,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.add_listener(listener.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!("Could not attach connection listener: {}, retrying", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Stop the event loop and every listener task
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.running.store(false, Ordering::SeqCst);
        self.events.lock().await.take();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("Connection listener task panicked");
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}
