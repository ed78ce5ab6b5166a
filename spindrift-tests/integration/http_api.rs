//! HTTP endpoint integration tests over the full stack.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use spindrift_core::config::SpindriftConfig;
use spindrift_core::media::{ContainerFormat, MediaSource, SourceId};
use spindrift_core::probe::SimulationProber;
use spindrift_core::{InMemoryMediaLibrary, SessionRegistry, SimulationBackend};
use spindrift_web::{AppState, build_router};
use tempfile::TempDir;
use tower::util::ServiceExt;

struct TestApp {
    router: Router,
    source_id: SourceId,
    _workdir: TempDir,
}

fn test_app_with_config(mut mutate: impl FnMut(&mut SpindriftConfig)) -> TestApp {
    let workdir = tempfile::tempdir().unwrap();
    let mut config = SpindriftConfig::for_testing(workdir.path().to_path_buf());
    // HTTP tests run on the real clock; keep sessions alive throughout.
    config.session.idle_timeout = Duration::from_secs(600);
    mutate(&mut config);
    let http = config.http.clone();

    let registry = SessionRegistry::new(
        config,
        Arc::new(SimulationBackend::new()),
        Arc::new(SimulationProber::new(Duration::from_secs(2))),
    );

    let library = Arc::new(InMemoryMediaLibrary::new());
    let source_id = library.insert(MediaSource {
        id: SourceId::new(),
        path: PathBuf::from("/media/feature.mkv"),
        duration: Duration::from_secs(600),
        container: ContainerFormat::Mkv,
        video: None,
        audio: None,
    });

    let router = build_router(AppState {
        registry,
        library,
        http,
    });

    TestApp {
        router,
        source_id,
        _workdir: workdir,
    }
}

fn test_app() -> TestApp {
    test_app_with_config(|_| {})
}

async fn json_body(response: axum::http::Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_session(app: &TestApp) -> (String, u64) {
    let body = serde_json::json!({ "source_id": app.source_id.to_string() }).to_string();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/Sessions")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = json_body(response).await;
    (
        json["session_id"].as_str().unwrap().to_string(),
        json["generation"].as_u64().unwrap(),
    )
}

#[tokio::test]
async fn create_manifest_and_segment_round_trip() {
    let app = test_app();
    let (session_id, generation) = create_session(&app).await;

    // The simulated encoder produces segment 0 well within the bounded
    // wait; the response carries the segment container's MIME type.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!(
                "/Sessions/{session_id}/segments/0?generation={generation}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/mp2t");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(!bytes.is_empty());

    // With at least one segment produced, the manifest lists it under the
    // active generation.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/Sessions/{session_id}/manifest"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/vnd.apple.mpegurl"
    );
    let playlist = response.into_body().collect().await.unwrap().to_bytes();
    let playlist = String::from_utf8(playlist.to_vec()).unwrap();
    assert!(playlist.starts_with("#EXTM3U"));
    assert!(playlist.contains(&format!("segments/0?generation={generation}")));
}

#[tokio::test]
async fn pending_segment_answers_retryable_not_ready() {
    let app = test_app();
    let (session_id, generation) = create_session(&app).await;

    // Index 80 (of 100 the run will produce) cannot exist yet: the
    // bounded wait elapses and the client is told to retry.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!(
                "/Sessions/{session_id}/segments/80?generation={generation}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_EARLY);
    assert!(response.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn seek_supersedes_generation_and_stale_requests_answer_gone() {
    let app = test_app();
    let (session_id, old_generation) = create_session(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post(format!("/Sessions/{session_id}/seek?offset=300"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let new_generation = json["generation"].as_u64().unwrap();
    assert!(new_generation > old_generation);
    assert_eq!(json["aligned_offset_secs"].as_f64().unwrap(), 300.0);

    // Both manifest and segment requests against the superseded
    // generation fail with gone, prompting a manifest re-fetch.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!(
                "/Sessions/{session_id}/manifest?generation={old_generation}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!(
                "/Sessions/{session_id}/segments/0?generation={old_generation}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn unknown_and_invalid_sessions_are_rejected() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!(
                "/Sessions/{}/manifest",
                spindrift_core::SessionId::new()
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/Sessions/not-a-uuid/manifest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn terminated_session_is_gone_from_the_registry() {
    let app = test_app();
    let (session_id, generation) = create_session(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::delete(format!("/Sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!(
                "/Sessions/{session_id}/segments/0?generation={generation}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn quota_exhaustion_rejects_session_creation() {
    let app = test_app_with_config(|config| {
        config.quota.capacity_bytes = 0;
    });

    let body = serde_json::json!({ "source_id": app.source_id.to_string() }).to_string();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/Sessions")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
}

#[tokio::test]
async fn seek_beyond_source_duration_is_a_client_error() {
    let app = test_app();
    let (session_id, _) = create_session(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post(format!("/Sessions/{session_id}/seek?offset=100000"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_reports_sessions_and_quota() {
    let app = test_app();
    let _ = create_session(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["active_sessions"].as_u64().unwrap(), 1);
    assert!(json["quota"]["capacity_bytes"].as_u64().unwrap() > 0);
}
