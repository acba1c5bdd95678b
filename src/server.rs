//! HTTP server for annex-db
//!
//! # Endpoints
//!
//! - `GET /health` - liveness
//! - `GET /search?database=&key=&limit=&epsilon=` - neighbours of a stored key
//! - `POST /databases/:database/search` - neighbours of a raw vector
//! - `PUT|POST /databases/:database/features/:key` - journal an insert
//! - `DELETE /databases/:database/features/:key` - journal a removal
//! - `POST /databases/:database/apply` - drain the journal now
//! - `GET /databases/:database/stats` - store counters
//!
//! Store calls block on disk, so every handler runs them through
//! `spawn_blocking`.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query as QueryParams, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};

use crate::error::StoreError;
use crate::registry::Databases;
use crate::store::{Neighbor, Query, Store};

pub struct AppState {
    pub databases: Arc<Databases>,
    /// Bounds requests in flight
    pub limiter: Arc<Semaphore>,
}

impl AppState {
    pub fn new(databases: Arc<Databases>, max_connections: usize) -> Self {
        Self {
            databases,
            limiter: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub databases: usize,
}

#[derive(Debug, Deserialize)]
pub struct KeySearchParams {
    pub database: String,
    pub key: u64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VectorSearchRequest {
    pub features: Vec<f32>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeaturesRequest {
    pub features: Vec<f32>,
}

/// Acknowledgement of a journaled mutation
#[derive(Debug, Serialize, Deserialize)]
pub struct MutationResponse {
    pub key: u64,
    pub seq: u64,
}

fn default_limit() -> usize {
    10
}

fn default_epsilon() -> f32 {
    0.1
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        code: code.to_string(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

fn classify_store_error(err: &StoreError) -> (StatusCode, &'static str) {
    match err {
        StoreError::UnknownKey(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unknown_key"),
        StoreError::DuplicateKey(_) => (StatusCode::UNPROCESSABLE_ENTITY, "duplicate_key"),
        StoreError::DimensionMismatch { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "dimension_mismatch")
        }
        err if err.is_validation() => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_request"),
        StoreError::ApplyFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "apply_failed"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
    }
}

fn store_error_response(err: StoreError) -> Response {
    let (status, code) = classify_store_error(&err);
    if status.is_server_error() {
        tracing::error!("request failed: {}", err);
    }
    error_response(status, code, err.to_string())
}

/// Run a store call on the blocking pool.
async fn run_blocking<T, F>(f: F) -> anyhow::Result<Result<T, StoreError>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("store task join error: {}", e))
}

fn join_error_response(err: anyhow::Error) -> Response {
    tracing::error!("{}", err);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
}

fn search_response(result: anyhow::Result<Result<Vec<Neighbor>, StoreError>>) -> Response {
    match result {
        Ok(Ok(hits)) if hits.is_empty() => {
            error_response(StatusCode::NOT_FOUND, "not_found", "no neighbours found")
        }
        Ok(Ok(hits)) => (StatusCode::OK, Json(hits)).into_response(),
        Ok(Err(StoreError::UnknownKey(key))) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("key {key} is not active"),
        ),
        Ok(Err(err)) => store_error_response(err),
        Err(err) => join_error_response(err),
    }
}

fn lookup(state: &AppState, name: &str, missing: StatusCode) -> Result<Arc<Store>, Response> {
    state.databases.get(name).ok_or_else(|| {
        error_response(
            missing,
            "unknown_database",
            format!("database '{name}' does not exist"),
        )
    })
}

fn parse_key(raw: &str) -> Result<u64, Response> {
    raw.parse::<u64>().map_err(|e| {
        error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_key",
            format!("invalid key '{raw}': {e}"),
        )
    })
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        databases: state.databases.len(),
    })
}

/// GET /search - neighbours of an existing key
async fn search_by_key(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<KeySearchParams>,
) -> Response {
    let store = match lookup(&state, &params.database, StatusCode::NOT_FOUND) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = run_blocking(move || {
        store.search(Query::Key(params.key), params.limit, params.epsilon)
    })
    .await;
    search_response(result)
}

/// POST /databases/:database/search - neighbours of a raw vector
async fn search_by_vector(
    State(state): State<Arc<AppState>>,
    Path(database): Path<String>,
    Json(body): Json<VectorSearchRequest>,
) -> Response {
    let store = match lookup(&state, &database, StatusCode::NOT_FOUND) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = run_blocking(move || {
        store.search(Query::Vector(&body.features), body.limit, body.epsilon)
    })
    .await;
    search_response(result)
}

async fn mutate<F>(state: &AppState, database: &str, raw_key: &str, op: F) -> Response
where
    F: FnOnce(&Store, u64) -> Result<u64, StoreError> + Send + 'static,
{
    let store = match lookup(state, database, StatusCode::UNPROCESSABLE_ENTITY) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let key = match parse_key(raw_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    match run_blocking(move || op(store.as_ref(), key)).await {
        Ok(Ok(seq)) => (StatusCode::OK, Json(MutationResponse { key, seq })).into_response(),
        Ok(Err(err)) => store_error_response(err),
        Err(err) => join_error_response(err),
    }
}

/// PUT /databases/:database/features/:key
async fn add_features(
    State(state): State<Arc<AppState>>,
    Path((database, key)): Path<(String, String)>,
    Json(body): Json<FeaturesRequest>,
) -> Response {
    mutate(&state, &database, &key, move |store, key| {
        store.add_item(key, &body.features)
    })
    .await
}

/// DELETE /databases/:database/features/:key
async fn remove_features(
    State(state): State<Arc<AppState>>,
    Path((database, key)): Path<(String, String)>,
) -> Response {
    mutate(&state, &database, &key, |store, key| store.remove_item(key)).await
}

/// POST /databases/:database/apply
async fn apply(State(state): State<Arc<AppState>>, Path(database): Path<String>) -> Response {
    let store = match lookup(&state, &database, StatusCode::UNPROCESSABLE_ENTITY) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    match run_blocking(move || store.apply()).await {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(err)) => store_error_response(err),
        Err(err) => join_error_response(err),
    }
}

/// GET /databases/:database/stats
async fn stats(State(state): State<Arc<AppState>>, Path(database): Path<String>) -> Response {
    let store = match lookup(&state, &database, StatusCode::NOT_FOUND) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    match run_blocking(move || Ok(store.stats())).await {
        Ok(Ok(stats)) => (StatusCode::OK, Json(stats)).into_response(),
        Ok(Err(err)) => store_error_response(err),
        Err(err) => join_error_response(err),
    }
}

/// Reject with 503 once `limiter` is exhausted.
async fn limit_in_flight(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Ok(_permit) = state.limiter.clone().try_acquire_owned() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded",
            "too many requests in flight",
        );
    };
    next.run(request).await
}

/// Create the axum router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/search", get(search_by_key))
        .route("/databases/:database/search", post(search_by_vector))
        .route(
            "/databases/:database/features/:key",
            put(add_features).post(add_features).delete(remove_features),
        )
        .route("/databases/:database/apply", post(apply))
        .route("/databases/:database/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), limit_in_flight))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(state: Arc<AppState>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    tracing::info!("annex-db listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
