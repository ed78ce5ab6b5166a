//! HTTP server wiring for Spindrift.
//!
//! Builds the session/manifest/segment router around the process-wide
//! session registry. The registry is created by the caller on startup and
//! drained here on graceful shutdown.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use spindrift_core::config::HttpConfig;
use spindrift_core::{MediaLibrary, SessionRegistry};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{
    create_session, health, seek_session, serve_manifest, serve_segment, session_status,
    stop_session,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub library: Arc<dyn MediaLibrary>,
    pub http: HttpConfig,
}

/// Build the session/manifest/segment router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/Sessions", post(create_session))
        .route("/Sessions/{session_id}/status", get(session_status))
        .route("/Sessions/{session_id}/manifest", get(serve_manifest))
        .route(
            "/Sessions/{session_id}/segments/{index}",
            get(serve_segment),
        )
        .route("/Sessions/{session_id}/seek", post(seek_session))
        .route("/Sessions/{session_id}", delete(stop_session))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until interrupted, then drain the registry.
///
/// # Errors
/// Returns any bind or serve error from the underlying listener.
pub async fn run_server(
    registry: Arc<SessionRegistry>,
    library: Arc<dyn MediaLibrary>,
    http: HttpConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, http.port));
    let state = AppState {
        registry: Arc::clone(&registry),
        library,
        http,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Spindrift listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Drain all sessions through the same stop path as explicit
    // termination before the process exits.
    registry.shutdown().await;
    Ok(())
}
