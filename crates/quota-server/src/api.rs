//! Admin API over the usage registry

use crate::error::ApiError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use quota_engine::{EngineError, UsageService};
use quota_types::{now_timestamp, QuotaPatch, UserRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UsageService>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct PatchUserRequest {
    pub username: Option<String>,
    #[serde(flatten)]
    pub patch: QuotaPatch,
}

#[derive(Debug, Deserialize)]
pub struct DeleteUserRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tracked_users: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/users",
            get(list_users)
                .post(create_user)
                .patch(patch_user)
                .delete(delete_user),
        )
        .route("/api/users/:username", get(get_user))
        .route("/api/service/restart", post(restart_service))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        tracked_users: state.service.registry().len(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.metrics().export() {
        Ok(metrics) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("Error exporting metrics: {}", e),
        ),
    }
}

async fn list_users(State(state): State<AppState>) -> Json<BTreeMap<String, UserRecord>> {
    let users = state
        .service
        .list_users()
        .into_iter()
        .map(|record| (record.username.clone(), record))
        .collect();
    Json(users)
}

async fn get_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<UserRecord>, ApiError> {
    Ok(Json(state.service.get_user(&username)?))
}

async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserRecord>), ApiError> {
    let Json(req) = payload?;
    let record = state
        .service
        .create_user(&req.username, &req.password, now_timestamp())
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn patch_user(
    State(state): State<AppState>,
    payload: Result<Json<PatchUserRequest>, JsonRejection>,
) -> Result<Json<UserRecord>, ApiError> {
    let Json(req) = payload?;
    let username = req
        .username
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("username is required".to_string()))?;
    let record = state.service.patch_user(&username, &req.patch).await?;
    Ok(Json(record))
}

async fn delete_user(
    State(state): State<AppState>,
    payload: Result<Json<DeleteUserRequest>, JsonRejection>,
) -> Result<Json<UserRecord>, ApiError> {
    let Json(req) = payload?;
    match state.service.delete_user(&req.username).await {
        Ok(record) => Ok(Json(record)),
        // deleting an unknown user is a client error, not a missing resource
        Err(EngineError::UserNotFound(name)) => {
            Err(ApiError::BadRequest(format!("unknown user: {}", name)))
        }
        Err(e) => Err(e.into()),
    }
}

async fn restart_service(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.service.restart_proxy().await?;
    Ok(Json(serde_json::json!({ "status": "restarted" })))
}
