//! HTTP ingress and reporting endpoints.
//!
//! Thin layer over [`Aggregator`]: request bodies are deserialized and
//! validated here, so nothing malformed ever reaches the queue.
//!
//! - `POST /publish`: one event or an array of events
//! - `GET /events?topic=...`: stored events for a topic
//! - `GET /stats`: counters plus per-topic totals
//! - `GET /health`: liveness probe

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::errors::AggregatorError;
use crate::models::{PublishBody, StoredRecord};
use crate::stats::StatsSnapshot;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub aggregator: AggregatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    aggregator: Arc<Aggregator>,
}

impl AppState {
    #[must_use]
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/publish", post(publish_handler))
        .route("/events", get(events_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Start the aggregator and serve HTTP until Ctrl+C.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let aggregator = Arc::new(Aggregator::start(config.aggregator.clone()).await?);
    let app = create_router(AppState::new(Arc::clone(&aggregator)));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("aggregator listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let report = aggregator.shutdown().await;
    tracing::info!(
        stopped = report.stopped,
        failed = report.failed,
        aborted = report.aborted,
        "server stopped"
    );

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {}", e);
        // Without a signal handler, keep serving instead of exiting at once.
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

// ============================================================================
// Responses
// ============================================================================

/// Body returned by a successful publish.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishResponse {
    pub status: String,
    pub received_count: usize,
}

/// Body returned by `/stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub queued: u64,
    pub topics: BTreeMap<String, u64>,
}

/// Error mapped onto an HTTP status with a JSON body.
struct ApiError(AggregatorError);

impl From<AggregatorError> for ApiError {
    fn from(e: AggregatorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AggregatorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn publish_handler(
    State(state): State<AppState>,
    Json(body): Json<PublishBody>,
) -> Result<Json<PublishResponse>, ApiError> {
    let received_count = state.aggregator.publish(body.into_events())?;
    tracing::debug!(received_count, "events queued");

    Ok(Json(PublishResponse {
        status: "queued".into(),
        received_count,
    }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    topic: Option<String>,
}

async fn events_handler(
    State(state): State<AppState>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<Vec<StoredRecord>>, Response> {
    let topic = params
        .topic
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "query parameter 'topic' is required" })),
            )
                .into_response()
        })?;

    let records = state
        .aggregator
        .query()
        .list_by_topic(&topic)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(records))
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.aggregator.stats();
    let queued = state.aggregator.pending();
    let topics = state.aggregator.query().counts_by_topic().await?;

    Ok(Json(StatsResponse {
        stats,
        queued,
        topics,
    }))
}

async fn health_handler() -> &'static str {
    "ok"
}
