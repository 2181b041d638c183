//! Registration Manager
//!
//! Keeps this node's ephemeral entry under the membership path. The entry
//! is created at startup and recreated whenever a new session replaces a
//! lost one. After a resumed session it is only re-validated.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::connection::{ConnectionStateListener, ConnectionTransition};
use crate::ensemble::{CreateOutcome, EnsembleClient, RetryPolicy};
use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, PathLayout};

/// Registers this node in the membership tree
pub struct RegistrationManager {
    client: Arc<EnsembleClient>,
    identity: NodeIdentity,
    layout: PathLayout,
    policy: RetryPolicy,
    audit: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
}

impl RegistrationManager {
    pub fn new(
        client: Arc<EnsembleClient>,
        identity: NodeIdentity,
        layout: PathLayout,
        policy: RetryPolicy,
        audit: Arc<dyn AuditSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            identity,
            layout,
            policy,
            audit,
            shutdown,
        }
    }

    /// Path of this node's entry
    pub fn node_path(&self) -> &str {
        &self.layout.this_node_path
    }

    /// Make sure this node's entry exists
    ///
    /// Idempotent. Failures are logged and audited, never returned; the
    /// result says whether the node is registered afterward.
    pub async fn register_self(&self) -> bool {
        if !self.client.is_started() || self.shutdown.is_cancelled() {
            tracing::debug!("Skipping registration of {}: client not running", self.identity);
            return false;
        }

        let result = self
            .policy
            .run_if(
                "registration",
                &self.shutdown,
                |e| {
                    !matches!(
                        e,
                        Error::Cancelled | Error::ShuttingDown | Error::NotStarted(_) | Error::SessionExpired
                    )
                },
                || self.try_register(),
            )
            .await;

        match result {
            Ok(true) => {
                tracing::info!("Registered {} at {}", self.identity, self.layout.this_node_path);
                self.audit
                    .record(
                        AuditEvent::new(self.identity.to_string(), AuditKind::Registered)
                            .with_detail(self.layout.this_node_path.clone()),
                    )
                    .await;
                true
            }
            Ok(false) => {
                tracing::debug!("{} already registered", self.identity);
                true
            }
            Err(Error::Cancelled) | Err(Error::ShuttingDown) => false,
            Err(e) => {
                tracing::error!("Failed to register {}: {}", self.identity, e);
                self.audit
                    .record(
                        AuditEvent::new(self.identity.to_string(), AuditKind::RegistrationFailed)
                            .with_detail(e.to_string()),
                    )
                    .await;
                false
            }
        }
    }

    /// Re-check the entry after a resumed session, recreating it only if gone
    pub async fn revalidate(&self) -> bool {
        match self.owned_by_current_session().await {
            Ok(true) => {
                tracing::debug!("Registration of {} still valid", self.identity);
                true
            }
            Ok(false) => {
                tracing::warn!("Registration of {} missing after resume, recreating", self.identity);
                self.register_self().await
            }
            Err(e) => {
                tracing::warn!("Could not re-validate registration of {}: {}", self.identity, e);
                false
            }
        }
    }

    /// One registration attempt; `Ok(true)` if this call created the entry
    async fn try_register(&self) -> Result<bool> {
        if self.owned_by_current_session().await? {
            return Ok(false);
        }

        self.client
            .create_persistent_if_absent(&self.layout.membership_path, timestamp().as_bytes())
            .await?;

        match self
            .client
            .create_ephemeral(&self.layout.this_node_path, timestamp().as_bytes())
            .await?
        {
            CreateOutcome::Created(_) => Ok(true),
            CreateOutcome::AlreadyExists => {
                // Left over from a session the ensemble has not reaped yet
                tracing::debug!("Replacing stale entry {}", self.layout.this_node_path);
                self.client.delete_once(&self.layout.this_node_path).await?;
                Err(Error::NodeExists(self.layout.this_node_path.clone()))
            }
        }
    }

    /// Whether the entry exists and belongs to the live session
    async fn owned_by_current_session(&self) -> Result<bool> {
        let stat = self.client.stat(&self.layout.this_node_path).await?;
        Ok(match stat {
            Some(stat) => stat.ephemeral_owner.is_some() && stat.ephemeral_owner == self.client.session_id(),
            None => false,
        })
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait::async_trait]
impl ConnectionStateListener for RegistrationManager {
    async fn state_changed(&self, transition: ConnectionTransition) {
        match transition {
            ConnectionTransition::Connected | ConnectionTransition::Reconnected => {
                self.register_self().await;
            }
            ConnectionTransition::Resumed => {
                self.revalidate().await;
            }
            ConnectionTransition::Suspended | ConnectionTransition::Lost => {}
        }
    }
}
