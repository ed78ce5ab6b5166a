//! Session lifecycle handlers: create, status, seek, terminate.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Response, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use spindrift_core::session::SessionError;
use spindrift_core::{ClientCapabilities, RegistryError, SourceId};
use tracing::{info, warn};

use super::{error_response, parse_session_id};
use crate::server::AppState;

/// Request body for session creation.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Library id of the source to stream
    pub source_id: String,
    /// Client decode capabilities; baseline browser profile when omitted
    #[serde(default)]
    pub capabilities: Option<ClientCapabilities>,
    /// Playback start position in seconds
    #[serde(default)]
    pub start_offset_secs: Option<f64>,
}

/// Response body for session creation.
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub generation: u64,
    /// Keyframe-aligned offset the stream actually starts at
    pub start_offset_secs: f64,
    pub mode: &'static str,
    pub manifest_url: String,
}

/// Map registry failures onto status codes.
fn registry_error_response(error: RegistryError) -> Response<Body> {
    match error {
        RegistryError::Quota(e) => {
            warn!("Session admission denied by quota: {}", e);
            error_response(StatusCode::INSUFFICIENT_STORAGE, &e.to_string())
        }
        RegistryError::RegistryFull { .. } => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &error.to_string())
        }
        RegistryError::SessionNotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, &error.to_string())
        }
        RegistryError::Session(e) => session_error_response(e),
    }
}

/// Map session control failures onto status codes.
fn session_error_response(error: SessionError) -> Response<Body> {
    match error {
        SessionError::SeekBeyondEnd { .. } => {
            error_response(StatusCode::BAD_REQUEST, &error.to_string())
        }
        SessionError::InvalidState { .. } => {
            error_response(StatusCode::CONFLICT, &error.to_string())
        }
        SessionError::Quota(e) => {
            error_response(StatusCode::INSUFFICIENT_STORAGE, &e.to_string())
        }
        SessionError::Segment(e) => error_response(StatusCode::GONE, &e.to_string()),
    }
}

/// Create a transcode session for a library source.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response<Body> {
    let source_id = match SourceId::parse(&request.source_id) {
        Ok(id) => id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid source id"),
    };

    let Some(source) = state.library.source(source_id).await else {
        return error_response(StatusCode::NOT_FOUND, "source not found in library");
    };

    let offset = Duration::from_secs_f64(request.start_offset_secs.unwrap_or(0.0).max(0.0));
    if offset > source.duration {
        return error_response(
            StatusCode::BAD_REQUEST,
            "start offset beyond source duration",
        );
    }

    let capabilities = request.capabilities.unwrap_or_default();
    let session = match state
        .registry
        .create_session(source, &capabilities, offset)
        .await
    {
        Ok(session) => session,
        Err(e) => return registry_error_response(e),
    };

    info!(
        "Session {} created for source {}",
        session.id(),
        request.source_id
    );

    let response = CreateSessionResponse {
        session_id: session.id().to_string(),
        generation: session.generation(),
        start_offset_secs: session.current_offset().as_secs_f64(),
        mode: session.profile().mode.label(),
        manifest_url: format!("/Sessions/{}/manifest", session.id()),
    };
    (StatusCode::CREATED, Json(response)).into_response()
}

/// Query parameters for seek requests.
#[derive(Debug, Deserialize)]
pub struct SeekQuery {
    /// Target position in seconds
    pub offset: f64,
}

/// Response body for seek requests.
#[derive(Debug, Serialize)]
pub struct SeekResponse {
    /// Fresh segment-index generation started by this seek
    pub generation: u64,
    /// Keyframe-aligned offset the new run actually starts at
    pub aligned_offset_secs: f64,
}

/// Seek the session to a new offset, starting a fresh generation.
pub async fn seek_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SeekQuery>,
) -> Response<Body> {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let session = match state.registry.session(session_id).await {
        Ok(session) => session,
        Err(e) => return registry_error_response(e),
    };

    if !query.offset.is_finite() || query.offset < 0.0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid seek offset");
    }

    match session.seek(Duration::from_secs_f64(query.offset)).await {
        Ok(aligned) => Json(SeekResponse {
            generation: session.generation(),
            aligned_offset_secs: aligned.as_secs_f64(),
        })
        .into_response(),
        Err(e) => session_error_response(e),
    }
}

/// Current session state as JSON.
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response<Body> {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let session = match state.registry.session(session_id).await {
        Ok(session) => session,
        Err(e) => return registry_error_response(e),
    };

    let status = serde_json::json!({
        "session_id": session.id().to_string(),
        "source_id": session.source().id.to_string(),
        "state": session.state().label(),
        "generation": session.generation(),
        "mode": session.profile().mode.label(),
        "current_offset_secs": session.current_offset().as_secs_f64(),
        "restart_count": session.restart_count(),
        "idle_secs": session.idle_for().as_secs_f64(),
    });
    Json(status).into_response()
}

/// Terminate a session and reclaim its resources.
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response<Body> {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state
        .registry
        .stop_session(session_id, "client terminated")
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => registry_error_response(e),
    }
}

/// Health check with registry and quota statistics.
pub async fn health(State(state): State<AppState>) -> Response<Body> {
    let stats = state.registry.stats().await;
    let body = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_sessions": stats.active_sessions,
        "capacity": stats.capacity,
        "quota": stats.quota,
    });
    Json(body).into_response()
}
