//! HTTP handlers for session control and segment delivery.

pub mod sessions;
pub mod streaming;

use axum::body::Body;
use axum::http::{Response, StatusCode};
pub use sessions::{create_session, health, seek_session, session_status, stop_session};
use spindrift_core::SessionId;
pub use streaming::{serve_manifest, serve_segment};

/// JSON error response with the given status.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("static response construction")
}

/// Parse a session id path parameter, mapping failures to 400.
pub(crate) fn parse_session_id(raw: &str) -> Result<SessionId, Response<Body>> {
    SessionId::parse(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid session id"))
}
