//! Manifest and segment delivery handlers.
//!
//! Segment requests block up to a bounded wait for readiness; a segment
//! still in production answers with a retryable not-yet-ready status
//! rather than an error, and anything a seek has superseded answers gone.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Response, StatusCode};
use serde::Deserialize;
use spindrift_core::SegmentError;
use spindrift_core::manifest::{MANIFEST_CONTENT_TYPE, render_manifest};
use tracing::debug;

use super::{error_response, parse_session_id};
use crate::server::AppState;

/// Query parameters addressing a specific encode-run generation.
#[derive(Debug, Deserialize)]
pub struct GenerationQuery {
    /// Generation the client believes is active; omitted means active
    pub generation: Option<u64>,
}

/// Map segment store failures onto status codes.
///
/// Timeouts are retryable (the client should poll); stale generations and
/// torn-down sessions are gone for good and require a manifest re-fetch.
fn segment_error_response(error: SegmentError, retry_after_secs: u32) -> Response<Body> {
    match error {
        SegmentError::Timeout { .. } => Response::builder()
            .status(StatusCode::TOO_EARLY)
            .header("content-type", "application/json")
            .header("retry-after", retry_after_secs.to_string())
            .body(Body::from(
                serde_json::json!({ "error": "segment not yet ready, retry" }).to_string(),
            ))
            .expect("static response construction"),
        SegmentError::StaleGeneration { requested, active } => error_response(
            StatusCode::GONE,
            &format!("generation {requested} superseded by {active}; re-fetch the manifest"),
        ),
        SegmentError::SegmentUnavailable { .. } => {
            error_response(StatusCode::GONE, &error.to_string())
        }
        SegmentError::Io { .. } => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string())
        }
    }
}

/// Serve the active generation's playlist.
pub async fn serve_manifest(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<GenerationQuery>,
) -> Response<Body> {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let session = match state.registry.session(session_id).await {
        Ok(session) => session,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "session not found"),
    };

    match session.manifest_snapshot(query.generation) {
        Ok(snapshot) => {
            let playlist = render_manifest(&snapshot, session.profile().segment_duration);
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", MANIFEST_CONTENT_TYPE)
                .header("cache-control", "no-store")
                .body(Body::from(playlist))
                .expect("static response construction")
        }
        Err(e) => segment_error_response(e, state.http.retry_after_secs),
    }
}

/// Serve one segment's bytes, waiting briefly for readiness.
pub async fn serve_segment(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, u32)>,
    Query(query): Query<GenerationQuery>,
) -> Response<Body> {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let session = match state.registry.session(session_id).await {
        Ok(session) => session,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "session not found"),
    };

    let generation = query.generation.unwrap_or_else(|| session.generation());
    let segment = match session
        .await_segment(generation, index, state.http.segment_wait)
        .await
    {
        Ok(segment) => segment,
        Err(e) => {
            debug!(
                "Segment {}/{} for session {} not served: {}",
                generation, index, session_id, e
            );
            return segment_error_response(e, state.http.retry_after_secs);
        }
    };

    let bytes = match tokio::fs::read(&segment.path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to read segment file: {e}"),
            );
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", session.profile().container.mime_type())
        .header("content-length", bytes.len().to_string())
        .header("cache-control", "no-store")
        .body(Body::from(bytes))
        .expect("static response construction")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_timeout_maps_to_retryable_too_early() {
        let response = segment_error_response(
            SegmentError::Timeout {
                index: 3,
                waited: Duration::from_secs(2),
            },
            1,
        );

        assert_eq!(response.status(), StatusCode::TOO_EARLY);
        assert_eq!(response.headers()["retry-after"], "1");
    }

    #[test]
    fn test_stale_generation_maps_to_gone() {
        let response = segment_error_response(
            SegmentError::StaleGeneration {
                requested: 1,
                active: 2,
            },
            1,
        );
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[test]
    fn test_unavailable_maps_to_gone() {
        let response = segment_error_response(
            SegmentError::SegmentUnavailable {
                index: 0,
                reason: "encode run ended".to_string(),
            },
            1,
        );
        assert_eq!(response.status(), StatusCode::GONE);
    }
}
