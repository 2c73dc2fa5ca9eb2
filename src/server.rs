//! HTTP transport for node polls.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/internal/nodes/{uuid}/poll` | Heartbeat + outcomes in, task batch out |
//! | `POST` | `/internal/nodes/{uuid}/callback` | Report a single task outcome |
//! | `GET`  | `/internal/nodes` | Registry listing with liveness |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "heartbeat is missing 'name'" } }
//! ```
//!
//! Error codes: `bad_request` (400) for malformed bodies, missing heartbeat
//! fields and uuid problems; `validation_failed` (422) when a well-formed
//! heartbeat describes an invalid node; `not_found` (404); `internal` (500).

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use fleet_coordinator_core::clock::{Clock, SystemClock};
use fleet_coordinator_core::dispatch::{OutcomeReport, PollResponse, Reconciler, TaskOutcome};
use fleet_coordinator_core::error::CoordinatorError;
use fleet_coordinator_core::models::Node;
use fleet_coordinator_core::nodes::{is_online, BackoffRegistry, Heartbeat};
use fleet_coordinator_core::store::Store;

use crate::config::Config;
use crate::housekeeping::run_housekeeping_loop;
use crate::sqlite_store::SqliteStore;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler<SqliteStore>>,
}

/// Build the router over an existing reconciler.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/internal/nodes", get(handle_list_nodes))
        .route("/internal/nodes/{uuid}/poll", post(handle_poll))
        .route("/internal/nodes/{uuid}/callback", post(handle_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the database, start the housekeeping loop and serve until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        clock.clone(),
        BackoffRegistry::new(config.backoff_policy()),
        config.dispatch_settings(),
    ));

    tokio::spawn(run_housekeeping_loop(store, clock, Arc::new(config.clone())));

    let app = router(AppState { reconciler });
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "coordinator listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn validation_failed(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        code: "validation_failed".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match CoordinatorError::find(&err) {
            Some(e) if e.is_validation() => validation_failed(e.to_string()),
            Some(e) => not_found(e.to_string()),
            None => {
                tracing::error!(error = %format!("{:#}", err), "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal".to_string(),
                    message: err.to_string(),
                }
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

/// Parse a uuid path segment.
fn path_uuid(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|e| bad_request(format!("invalid node uuid '{}': {}", raw, e)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /internal/nodes/{uuid}/poll ============

#[derive(Deserialize)]
pub struct PollRequest {
    pub heartbeat: Heartbeat,
    #[serde(default)]
    pub outcomes: Vec<TaskOutcome>,
}

/// A heartbeat without a uuid takes it from the path; one that names a
/// different node is rejected.
async fn handle_poll(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    body: Result<Json<PollRequest>, JsonRejection>,
) -> Result<Json<PollResponse>, AppError> {
    let uuid = path_uuid(&uuid)?;
    let Json(mut request) = body?;
    match request.heartbeat.uuid.as_deref() {
        None => request.heartbeat.uuid = Some(uuid.to_string()),
        Some(reported) => {
            if Uuid::parse_str(reported).ok() != Some(uuid) {
                return Err(bad_request(format!(
                    "heartbeat uuid '{}' does not match path uuid {}",
                    reported, uuid
                )));
            }
        }
    }
    if let Some(field) = request.heartbeat.missing_field() {
        return Err(bad_request(format!("heartbeat is missing '{}'", field)));
    }

    let response = state
        .reconciler
        .poll(&request.heartbeat, &request.outcomes)
        .await?;
    Ok(Json(response))
}

// ============ POST /internal/nodes/{uuid}/callback ============

async fn handle_callback(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    body: Result<Json<TaskOutcome>, JsonRejection>,
) -> Result<(StatusCode, Json<OutcomeReport>), AppError> {
    let uuid = path_uuid(&uuid)?;
    let Json(outcome) = body?;
    let node = state
        .reconciler
        .store()
        .find_node_by_uuid(&uuid)
        .await?
        .ok_or_else(|| not_found(format!("node {} not found", uuid)))?;
    let node_id = node
        .id
        .ok_or_else(|| not_found(format!("node {} not found", uuid)))?;

    let report = state.reconciler.apply_outcomes(node_id, &[outcome]).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

// ============ GET /internal/nodes ============

#[derive(Serialize)]
struct NodeView {
    #[serde(flatten)]
    node: Node,
    online: bool,
    free_bytes: u64,
}

#[derive(Serialize)]
struct NodeListResponse {
    nodes: Vec<NodeView>,
}

async fn handle_list_nodes(
    State(state): State<AppState>,
) -> Result<Json<NodeListResponse>, AppError> {
    let now = state.reconciler.clock().now();
    let nodes = state
        .reconciler
        .store()
        .list_nodes()
        .await?
        .into_iter()
        .map(|node| NodeView {
            online: is_online(&node, now),
            free_bytes: node.free_bytes(),
            node,
        })
        .collect();
    Ok(Json(NodeListResponse { nodes }))
}
