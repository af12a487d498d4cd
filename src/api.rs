//! Provisioning API Server

use crate::lifecycle::ProfileManager;
use crate::profile::{ProfileId, ProfileSummary};
use crate::sync::SyncOutcome;
use crate::ProvisionError;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    manager: Arc<ProfileManager>,
    token: Arc<str>,
}

impl AppState {
    pub fn new(manager: Arc<ProfileManager>, token: &str) -> Self {
        Self {
            manager,
            token: Arc::from(token),
        }
    }

    fn authorize(&self, token: Option<&str>) -> Result<(), ProvisionError> {
        match token {
            Some(given) if constant_time_eq(given.as_bytes(), self.token.as_bytes()) => Ok(()),
            _ => Err(ProvisionError::Unauthorized),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/profiles", get(list_profiles).post(create_profile))
        .route("/profiles/:id", axum::routing::delete(delete_profile))
        .route("/profiles/:id/config", get(profile_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ProvisionError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Provisioning API listening on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    token: Option<String>,
    ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ProfileOut {
    #[serde(flatten)]
    profile: ProfileSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeletedOut {
    status: &'static str,
    profile_id: ProfileId,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorOut {
    detail: String,
}

/// Malformed path or query parameters answer with the usual error body
fn profile_id(path: Result<Path<ProfileId>, PathRejection>) -> Result<ProfileId, ProvisionError> {
    path.map(|Path(id)| id)
        .map_err(|e| ProvisionError::InvalidRequest(e.body_text()))
}

/// 202 plus a warning when the daemon was not told to reload
fn degraded(outcome: &SyncOutcome) -> (StatusCode, Option<String>) {
    match outcome {
        SyncOutcome::Applied => (StatusCode::OK, None),
        SyncOutcome::Degraded(reason) => (
            StatusCode::ACCEPTED,
            Some(ProvisionError::SyncDegraded(reason.clone()).to_string()),
        ),
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn create_profile(
    State(state): State<AppState>,
    query: Result<Query<CreateQuery>, QueryRejection>,
) -> Result<Response, ProvisionError> {
    let Query(query) = query.map_err(|e| ProvisionError::InvalidRequest(e.body_text()))?;
    state.authorize(query.token.as_deref())?;

    let created = state.manager.create(query.ttl_secs.map(Duration::from_secs)).await?;
    let (status, warning) = degraded(&created.outcome);
    let status = if status == StatusCode::OK { StatusCode::CREATED } else { status };

    let body = ProfileOut {
        profile: created.profile.summary(),
        warning,
    };
    Ok((status, Json(body)).into_response())
}

async fn list_profiles(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<ProfileSummary>>, ProvisionError> {
    state.authorize(query.token.as_deref())?;

    let profiles = state.manager.list()?;
    Ok(Json(profiles.iter().map(|p| p.summary()).collect()))
}

async fn profile_config(
    State(state): State<AppState>,
    id: Result<Path<ProfileId>, PathRejection>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ProvisionError> {
    state.authorize(query.token.as_deref())?;
    let id = profile_id(id)?;

    let rendered = state.manager.render(id).await?;
    let mut response = ([(header::CONTENT_TYPE, rendered.content_type)], rendered.body).into_response();
    if let Some(filename) = rendered.filename {
        if let Ok(value) = format!("attachment; filename={filename}").parse() {
            response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

async fn delete_profile(
    State(state): State<AppState>,
    id: Result<Path<ProfileId>, PathRejection>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ProvisionError> {
    state.authorize(query.token.as_deref())?;
    let id = profile_id(id)?;

    let outcome = state.manager.delete(id).await?;
    let (status, warning) = degraded(&outcome);
    let body = DeletedOut {
        status: "deleted",
        profile_id: id,
        warning,
    };
    Ok((status, Json(body)).into_response())
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProvisionError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
            ProvisionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProvisionError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProvisionError::ExternalSync(_) => StatusCode::BAD_GATEWAY,
            ProvisionError::SyncDegraded(_) => StatusCode::ACCEPTED,
            ProvisionError::DuplicateIdentity(_) => StatusCode::CONFLICT,
            ProvisionError::GenerationFailed(_)
            | ProvisionError::ConfigCorrupt(_)
            | ProvisionError::Render(_)
            | ProvisionError::Store(_)
            | ProvisionError::Config(_)
            | ProvisionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(ErrorOut { detail: self.to_string() })).into_response()
    }
}
