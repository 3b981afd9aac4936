//! HTTP API Server
//!
//! JSON API for local clients: reads, writes and node introspection.

use std::sync::Arc;
use std::time::Instant;
use axum::{
    body::Bytes,
    extract::{Path, Query, State, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::clock::VectorClock;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::id::{Counter, NodeId};
use crate::membership::Neighbor;
use crate::node::{Node, NodeStats};
use crate::replication::{NeighborHealth, RoundReport};
use crate::store::Record;

/// Records returned by `GET /kv` when no limit is given
const DEFAULT_LIST_LIMIT: usize = 100;

/// Shared application state
pub struct AppState {
    pub node: Arc<Node>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node: Arc<Node>) -> Self {
        let state = Arc::new(AppState {
            node,
            started: Instant::now(),
        });

        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            // Records
            .route("/kv", get(handle_list))
            .route("/kv/:key", get(handle_get).put(handle_put))
            // Replication state
            .route("/clock", get(handle_clock))
            .route("/neighbors", get(handle_neighbors))
            .route("/sync", post(handle_sync))
            // Status and info
            .route("/status", get(handle_status))
            .route("/stats", get(handle_stats))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// JSON view of a record
///
/// Values are opaque bytes; UTF-8 values are shown as `value`, anything
/// else as `value_bytes`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordView {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_bytes: Option<Vec<u8>>,
    pub version: String,
    pub origin: NodeId,
    pub counter: Counter,
    pub clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}

impl From<Record> for RecordView {
    fn from(record: Record) -> Self {
        let version = record.version.to_string();
        let (value, value_bytes) = match String::from_utf8(record.value) {
            Ok(text) => (Some(text), None),
            Err(e) => (None, Some(e.into_bytes())),
        };

        Self {
            key: record.key,
            value,
            value_bytes,
            version,
            origin: record.version.node,
            counter: record.version.counter,
            clock: record.clock,
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// Clock response
#[derive(Debug, Serialize, Deserialize)]
pub struct ClockResponse {
    pub node_id: NodeId,
    pub clock: VectorClock,
    pub generation: u64,
}

/// Neighbor with anti-entropy contact history
#[derive(Debug, Serialize)]
pub struct NeighborView {
    #[serde(flatten)]
    pub neighbor: Neighbor,
    #[serde(flatten)]
    pub health: NeighborHealth,
    /// Clock and generation as of the last completed pull
    pub synced_clock: VectorClock,
    pub synced_generation: u64,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: NodeId,
    pub last_counter: Counter,
    pub clock: VectorClock,
    pub neighbors: usize,
    pub online_neighbors: usize,
    pub anti_entropy_rounds: u64,
    pub uptime_seconds: u64,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: NodeId,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned from a handler
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::MalformedRecord(_) => (StatusCode::BAD_REQUEST, "MALFORMED_RECORD"),
            Error::CounterExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "COUNTER_EXHAUSTED"),
            Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!("API request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

async fn handle_put(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult<Json<RecordView>> {
    let record = state.node.put(&key, body.to_vec()).await?;
    Ok(Json(record.into()))
}

async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    match state.node.get(&key).await? {
        Some(record) => Ok(Json(RecordView::from(record)).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Key {} not found", key),
                code: "NOT_FOUND".to_string(),
            }),
        )
            .into_response()),
    }
}

async fn handle_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RecordView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let records = state.node.list(limit).await?;
    Ok(Json(records.into_iter().map(RecordView::from).collect()))
}

async fn handle_clock(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.node.summary().await;
    Json(ClockResponse {
        node_id: state.node.node_id().clone(),
        clock: summary.clock,
        generation: summary.generation,
    })
}

async fn handle_neighbors(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<NeighborView>>> {
    let neighbors = state.node.neighbors().await?;
    let reconciler = state.node.reconciler();
    let health = reconciler.health().await;
    let synced = reconciler.cache().snapshot().await;

    let views = neighbors
        .into_iter()
        .map(|neighbor| {
            let summary = synced.get(&neighbor.id).cloned().unwrap_or_default();
            NeighborView {
                health: health.get(&neighbor.id).cloned().unwrap_or_default(),
                synced_clock: summary.clock,
                synced_generation: summary.generation,
                neighbor,
            }
        })
        .collect();

    Ok(Json(views))
}

async fn handle_sync(State(state): State<Arc<AppState>>) -> ApiResult<Json<RoundReport>> {
    let report = state.node.run_anti_entropy().await?;
    Ok(Json(report))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let neighbors = state.node.neighbors().await?;
    let stats = state.node.stats().await;

    Ok(Json(StatusResponse {
        node_id: state.node.node_id().clone(),
        last_counter: stats.last_counter,
        clock: state.node.clock().await,
        neighbors: neighbors.len(),
        online_neighbors: neighbors.iter().filter(|n| n.online).count(),
        anti_entropy_rounds: stats.anti_entropy_rounds,
        uptime_seconds: state.started.elapsed().as_secs(),
    }))
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<NodeStats> {
    Json(state.node.stats().await)
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node.node_id().clone(),
    })
}
