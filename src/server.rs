//! HTTP API for the retrieval engine.
//!
//! The tenant is taken from the `x-tenant-id` header, which the
//! authenticating gateway in front of this service is expected to set.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/query` | Answer a query for the calling tenant |
//! | `GET`  | `/v1/modes` | Modes unlocked by the calling tenant's plan |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid request: query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `quota_exceeded` (429),
//! `embedding_failed` (502), `upstream_error` (502), `store_unavailable` (503).

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use docgraph_core::error::QueryError;
use docgraph_core::query::{QueryRequest, QueryResult};

use crate::config::Config;
use crate::db;
use crate::query::QueryService;

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Clone)]
struct AppState {
    service: Arc<QueryService>,
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let service = Arc::new(QueryService::from_config(config, pool)?);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    println!("dgx server listening on http://{}", config.server.bind);

    axum::serve(listener, router(service)).await?;
    Ok(())
}

/// Build the application router around an existing service.
pub fn router(service: Arc<QueryService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/query", post(handle_query))
        .route("/v1/modes", get(handle_modes))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { service })
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

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::Validation(_) => StatusCode::BAD_REQUEST,
            QueryError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            QueryError::EmbeddingFailed(_) | QueryError::UpstreamCompletion(_) => {
                StatusCode::BAD_GATEWAY
            }
            QueryError::StoreAccess(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "query failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn tenant_from(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| unauthorized(format!("missing {} header", TENANT_HEADER)))
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

// ============ POST /v1/query ============

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResult>, AppError> {
    let tenant = tenant_from(&headers)?;
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    let result = state.service.execute_query(&tenant, &request).await?;
    Ok(Json(result))
}

// ============ GET /v1/modes ============

#[derive(Serialize)]
struct ModesResponse {
    plan: String,
    modes: Vec<String>,
}

async fn handle_modes(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ModesResponse>, AppError> {
    let tenant = tenant_from(&headers)?;
    let tm = state.service.tenant_modes(&tenant).await?;
    Ok(Json(ModesResponse {
        plan: tm.plan,
        modes: tm.modes.iter().map(|m| m.as_str().to_string()).collect(),
    }))
}
