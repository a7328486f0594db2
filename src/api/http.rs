//! HTTP API Server
//!
//! REST API for replicated writes, cluster status and member administration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::action::{Action, Operation, Value};
use crate::cluster::{ClusterCoordinator, MemberStatus};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::sync::SyncOutcome;

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<ClusterCoordinator>,
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, coordinator: Arc<ClusterCoordinator>) -> Self {
        let state = Arc::new(AppState {
            coordinator,
            started_at: Instant::now(),
        });
        Self { config, state }
    }

    /// Build the router with all routes and layers
    pub fn router(&self) -> Router {
        let router = Router::new()
            // Writes
            .route("/write/insert", post(handle_insert))
            .route("/write/update", post(handle_update))
            .route("/write/delete", post(handle_delete))
            .route("/write/sql", post(handle_sql))
            // Status
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            // Member administration
            .route("/members/:label/pause", post(handle_pause))
            .route("/members/:label/unpause", post(handle_unpause))
            .route("/members/:label/recover", post(handle_recover))
            .layer(TraceLayer::new_for_http());

        let router = if self.config.cors_enabled {
            router.layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        } else {
            router
        };

        router.with_state(Arc::clone(&self.state))
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Insert request
#[derive(Debug, Deserialize, Serialize)]
pub struct InsertRequest {
    pub table: String,
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Update request
#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateRequest {
    pub table: String,
    pub set: BTreeMap<String, serde_json::Value>,
    pub where_key: BTreeMap<String, serde_json::Value>,
}

/// Delete request
#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteRequest {
    pub table: String,
    pub where_key: BTreeMap<String, serde_json::Value>,
}

/// Raw SQL request
#[derive(Debug, Deserialize, Serialize)]
pub struct SqlRequest {
    pub sql: String,
    pub table: Option<String>,
}

/// Write response
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    pub action: Uuid,
    /// Members the write was queued to
    pub members: Vec<String>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub cluster: String,
    pub template: Option<String>,
    pub active_members: usize,
    pub uptime_seconds: u64,
}

/// Member administration response
#[derive(Debug, Serialize, Deserialize)]
pub struct MemberResponse {
    pub member: String,
    pub changed: bool,
}

/// Recovery response
#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub member: String,
    pub outcome: SyncOutcome,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn from_error(e: &Error) -> Response {
    let (status, code) = match e {
        Error::MemberNotFound(_) => (StatusCode::NOT_FOUND, "MEMBER_NOT_FOUND"),
        Error::NoTemplate(_) => (StatusCode::SERVICE_UNAVAILABLE, "NO_ACTIVE_MEMBERS"),
        Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        Error::MemberUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "MEMBER_UNAVAILABLE"),
        Error::Sync { .. } => (StatusCode::CONFLICT, "INVALID_MEMBER_STATE"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    error_response(status, code, e)
}

fn split(map: BTreeMap<String, serde_json::Value>) -> (Vec<String>, Vec<Value>) {
    map.into_iter()
        .map(|(column, value)| (column, Value::from_json(&value)))
        .unzip()
}

/// Replicate an operation and describe where it went
async fn replicate(state: &AppState, operation: Operation) -> Response {
    let action = Action::from_operation(operation);
    let id = action.id();

    match state.coordinator.replicate(action).await {
        Ok(copies) => Json(WriteResponse {
            success: true,
            action: id,
            members: copies.into_iter().map(|(label, _)| label).collect(),
        })
        .into_response(),
        Err(e) => {
            tracing::warn!("Write {} rejected: {}", id, e);
            from_error(&e)
        }
    }
}

// ============ Handlers ============

async fn handle_insert(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InsertRequest>,
) -> Response {
    if req.table.is_empty() || req.values.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "table and values are required");
    }

    let (columns, values) = split(req.values);
    replicate(&state, Operation::Insert {
        table: req.table,
        columns,
        values,
    })
    .await
}

async fn handle_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateRequest>,
) -> Response {
    if req.table.is_empty() || req.set.is_empty() || req.where_key.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "table, set and where_key are required",
        );
    }

    let (set_columns, set_values) = split(req.set);
    let (key_columns, key_values) = split(req.where_key);
    replicate(&state, Operation::Update {
        table: req.table,
        set_columns,
        set_values,
        key_columns,
        key_values,
    })
    .await
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteRequest>,
) -> Response {
    // An empty key would delete the whole table
    if req.table.is_empty() || req.where_key.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "table and where_key are required");
    }

    let (key_columns, key_values) = split(req.where_key);
    replicate(&state, Operation::Delete {
        table: req.table,
        key_columns,
        key_values,
    })
    .await
}

async fn handle_sql(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SqlRequest>,
) -> Response {
    if req.sql.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "sql is required");
    }

    replicate(&state, Operation::RawSql {
        sql: req.sql,
        affects_table: req.table,
    })
    .await
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let active = coordinator.active_members().await.len();
    let response = HealthResponse {
        healthy: active > 0,
        cluster: coordinator.label().to_string(),
        template: coordinator.template_label().await,
        active_members: active,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };

    let status = if response.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.status().await)
}

async fn handle_pause(
    State(state): State<Arc<AppState>>,
    Path(label): Path<String>,
) -> Response {
    match state.coordinator.pause(&label).await {
        Ok(changed) => Json(MemberResponse { member: label, changed }).into_response(),
        Err(e) => from_error(&e),
    }
}

async fn handle_unpause(
    State(state): State<Arc<AppState>>,
    Path(label): Path<String>,
) -> Response {
    if state.coordinator.member_status(&label).await == Some(MemberStatus::Quarantined) {
        return error_response(
            StatusCode::CONFLICT,
            "INVALID_MEMBER_STATE",
            format!("{} is quarantined; recover it instead", label),
        );
    }

    match state.coordinator.unpause(&label).await {
        Ok(changed) => Json(MemberResponse { member: label, changed }).into_response(),
        Err(e) => from_error(&e),
    }
}

async fn handle_recover(
    State(state): State<Arc<AppState>>,
    Path(label): Path<String>,
) -> Response {
    match state.coordinator.recover(&label).await {
        Ok(outcome) => {
            let status = if outcome.is_success() {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (status, Json(RecoverResponse { member: label, outcome })).into_response()
        }
        Err(e) => from_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ColumnDef, TableDescriptor};
    use crate::config::{ClusterConfig, QueueConfig, SyncConfig};
    use crate::cluster::Coordinator;
    use crate::member::InMemoryMember;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn users() -> TableDescriptor {
        TableDescriptor::new(
            "users",
            vec![
                ColumnDef::new("id", "int").primary(),
                ColumnDef::new("name", "varchar(32)"),
            ],
        )
    }

    async fn server() -> (HttpServer, Arc<ClusterCoordinator>, Arc<InMemoryMember>) {
        let queue = QueueConfig {
            capacity: 64,
            remove_timeout_ms: 20,
            poll_interval_ms: 1,
            stop_timeout_ms: 200,
            event_capacity: 1024,
        };
        let sync = SyncConfig {
            poll_interval_ms: 50,
            max_rounds: 10,
        };
        let coordinator = Arc::new(ClusterCoordinator::new(&ClusterConfig::default(), queue, sync));
        coordinator.spawn_event_loop();
        coordinator.track_table(users()).await;

        let db1 = Arc::new(InMemoryMember::new("db-1"));
        coordinator.join(db1.clone()).await.unwrap();
        coordinator
            .replicate(Action::from_operation(Operation::CreateTable {
                table: users(),
                if_not_exists: false,
            }))
            .await
            .unwrap();

        let server = HttpServer::new(ApiConfig::default(), coordinator.clone());
        (server, coordinator, db1)
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_replicated() {
        let (server, coordinator, db1) = server().await;

        let response = server
            .router()
            .oneshot(post(
                "/write/insert",
                serde_json::json!({"table": "users", "values": {"id": 1, "name": "ann"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: WriteResponse = body_json(response).await;
        assert!(body.success);
        assert_eq!(body.members, vec!["db-1"]);

        assert!(coordinator.wait_until_synchronized("db-1", Duration::from_secs(1)).await);
        assert_eq!(
            db1.scan("users").await.unwrap(),
            vec![vec![Value::Int(1), Value::String("ann".into())]]
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_requires_key() {
        let (server, coordinator, _db1) = server().await;

        let response = server
            .router()
            .oneshot(post("/write/delete", serde_json::json!({"table": "users", "where_key": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.code, "INVALID_REQUEST");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (server, coordinator, _db1) = server().await;

        let response = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.template.as_deref(), Some("db-1"));
        assert_eq!(health.active_members, 1);

        let response = server
            .router()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: serde_json::Value = body_json(response).await;
        assert_eq!(status["members"][0]["label"], "db-1");
        assert_eq!(status["members"][0]["status"], "Active");
        assert_eq!(status["tracked_tables"][0], "users");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_and_unpause_member() {
        let (server, coordinator, _db1) = server().await;

        let response = server
            .router()
            .oneshot(post("/members/db-1/pause", serde_json::json!({})))
            .await
            .unwrap();
        let body: MemberResponse = body_json(response).await;
        assert!(body.changed);
        assert!(coordinator.registry().worker("db-1").await.unwrap().is_paused());

        let response = server
            .router()
            .oneshot(post("/members/db-1/unpause", serde_json::json!({})))
            .await
            .unwrap();
        let body: MemberResponse = body_json(response).await;
        assert!(body.changed);

        let response = server
            .router()
            .oneshot(post("/members/db-9/pause", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_active_member_conflicts() {
        let (server, coordinator, _db1) = server().await;

        let response = server
            .router()
            .oneshot(post("/members/db-1/recover", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_writes_after_shutdown_are_unavailable() {
        let (server, coordinator, _db1) = server().await;
        coordinator.shutdown().await;

        let response = server
            .router()
            .oneshot(post(
                "/write/insert",
                serde_json::json!({"table": "users", "values": {"id": 1}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
