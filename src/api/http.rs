//! HTTP API Server
//!
//! Status queries, recent state log rows and forced relinquishment.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::audit::StateLog;
use crate::config::ApiConfig;
use crate::connection::ConnectionState;
use crate::election::ElectorPhase;
use crate::error::{Error, Result};
use crate::node::ClusterNode;

/// Default and maximum number of state log rows per request
const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 1000;

/// Shared application state
pub struct AppState {
    pub node: Arc<ClusterNode>,
    /// Present when the state log is enabled
    pub state_log: Option<Arc<StateLog>>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node: Arc<ClusterNode>, state_log: Option<Arc<StateLog>>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { node, state_log }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/members", get(handle_members))
            .route("/audit", get(handle_audit))
            .route("/admin/relinquish", post(handle_relinquish))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }

    /// Stop serving
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_leader: bool,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub host: String,
    pub epoch: i64,
    pub is_living: bool,
    pub is_leader: bool,
    pub connection: String,
    pub phase: String,
    pub stints: u64,
    pub membership_path: String,
    pub election_path: String,
}

/// Members response
#[derive(Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    pub node_id: String,
    pub members: Vec<String>,
}

/// Relinquish response
#[derive(Debug, Serialize, Deserialize)]
pub struct RelinquishResponse {
    pub relinquished: bool,
    pub node_id: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

fn error_response(status: StatusCode, error: impl Into<String>, code: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn connection_name(state: ConnectionState) -> String {
    format!("{:?}", state)
}

fn phase_name(phase: ElectorPhase) -> String {
    format!("{:?}", phase)
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.node.is_living();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            node_id: state.node.service_name(),
            is_leader: state.node.is_leader(),
        }),
    )
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node = &state.node;
    let identity = node.identity();
    let layout = node.layout();

    Json(StatusResponse {
        node_id: node.service_name(),
        host: identity.host.clone(),
        epoch: identity.epoch,
        is_living: node.is_living(),
        is_leader: node.is_leader(),
        connection: connection_name(node.connection_state()),
        phase: phase_name(node.phase()),
        stints: node.stints(),
        membership_path: layout.membership_path.clone(),
        election_path: layout.election_path.clone(),
    })
}

async fn handle_members(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(MembersResponse {
        node_id: state.node.service_name(),
        members: state.node.member_list().await,
    })
}

async fn handle_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> axum::response::Response {
    let Some(log) = state.state_log.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "State log is disabled", "STATE_LOG_DISABLED");
    };

    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).min(MAX_AUDIT_LIMIT);
    match log.recent(limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            tracing::error!("State log query failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "STATE_LOG_ERROR")
        }
    }
}

async fn handle_relinquish(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let node_id = state.node.service_name();
    if state.node.interrupt_leadership() {
        tracing::warn!("Leadership relinquish requested over HTTP");
        Json(RelinquishResponse {
            relinquished: true,
            node_id,
        })
        .into_response()
    } else {
        error_response(
            StatusCode::CONFLICT,
            format!("Node {} is not the leader", node_id),
            "NOT_LEADER",
        )
    }
}
