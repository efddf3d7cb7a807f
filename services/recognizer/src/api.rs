use crate::config::ApiConfig;
use crate::query::{PlateView, QueryService};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryService>,
    pub default_limit: u32,
    pub max_limit: u32,
}

impl AppState {
    pub fn new(query: Arc<QueryService>, config: &ApiConfig) -> Self {
        Self {
            query,
            default_limit: config.default_limit,
            max_limit: config.max_limit,
        }
    }
}

/// Query parameters for the plate list
#[derive(Debug, Deserialize)]
pub struct PlateListQuery {
    /// Maximum results
    pub limit: Option<u32>,
}

/// Plate list response
#[derive(Debug, Serialize)]
pub struct PlateListResponse {
    pub plates: Vec<PlateView>,
}

/// Bulk delete response
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: u64,
}

/// Latest plate text response
#[derive(Debug, Serialize)]
pub struct LatestPlateResponse {
    pub plate: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn effective_limit(requested: Option<u32>, default: u32, max: u32) -> u32 {
    requested.unwrap_or(default).min(max)
}

/// Create the API router; `public_root` is served under `/static`
pub fn create_router(state: AppState, config: &ApiConfig, public_root: PathBuf) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/plates", get(list_plates).delete(delete_plates))
        .route("/api/v1/plates/latest", get(latest_plate_record))
        .route("/api/v1/snapshot", get(snapshot_image))
        .route("/api/v1/snapshot/plate", get(snapshot_plate))
        .nest_service("/static", ServeDir::new(public_root))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1")
        .fetch_one(state.query.store().pool())
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "service": "plate-recognizer",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Most recent plates, newest first
#[instrument(skip(state))]
async fn list_plates(
    State(state): State<AppState>,
    Query(params): Query<PlateListQuery>,
) -> Result<Json<PlateListResponse>, ApiError> {
    let limit = effective_limit(params.limit, state.default_limit, state.max_limit);

    let plates = state.query.recent(limit).await.map_err(|e| {
        error!(error = %e, "Failed to query plates");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to query plates",
            "QUERY_ERROR",
        )
    })?;

    Ok(Json(PlateListResponse { plates }))
}

#[instrument(skip(state))]
async fn latest_plate_record(
    State(state): State<AppState>,
) -> Result<Json<PlateView>, ApiError> {
    let latest = state.query.latest().await.map_err(|e| {
        error!(error = %e, "Failed to query latest plate");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to query latest plate",
            "QUERY_ERROR",
        )
    })?;

    latest
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No plates recorded", "NOT_FOUND"))
}

/// Administrative reset
#[instrument(skip(state))]
async fn delete_plates(State(state): State<AppState>) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.query.delete_all().await.map_err(|e| {
        error!(error = %e, "Failed to delete plates");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to delete plates",
            "DELETE_ERROR",
        )
    })?;

    Ok(Json(DeleteResponse { deleted }))
}

async fn snapshot_image(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.query.snapshot() {
        Some(snapshot) => Ok((
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            snapshot.jpeg.clone(),
        )
            .into_response()),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "No plate recognized yet",
            "NOT_FOUND",
        )),
    }
}

async fn snapshot_plate(State(state): State<AppState>) -> Json<LatestPlateResponse> {
    Json(LatestPlateResponse {
        plate: state.query.latest_plate(),
    })
}

/// Start the query API server
pub async fn start_api_server(state: AppState, config: &ApiConfig, public_root: PathBuf) -> Result<()> {
    let router = create_router(state, config, public_root);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting query API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
