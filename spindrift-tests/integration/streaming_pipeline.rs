//! Full pipeline integration: registry, sessions, segments, seeks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spindrift_core::config::SpindriftConfig;
use spindrift_core::media::{ContainerFormat, MediaSource, SourceId};
use spindrift_core::probe::SimulationProber;
use spindrift_core::profile::ClientCapabilities;
use spindrift_core::segment::SegmentError;
use spindrift_core::{SessionRegistry, SimulationBackend};
use tempfile::TempDir;

fn test_source(duration_secs: u64) -> MediaSource {
    MediaSource {
        id: SourceId::new(),
        path: PathBuf::from("/media/feature.mkv"),
        duration: Duration::from_secs(duration_secs),
        container: ContainerFormat::Mkv,
        video: None,
        audio: None,
    }
}

fn registry_with_prober(
    workdir: &TempDir,
    prober: SimulationProber,
) -> Arc<SessionRegistry> {
    let mut config = SpindriftConfig::for_testing(workdir.path().to_path_buf());
    // These tests sleep on the virtual clock; keep the reaper out of the way.
    config.session.idle_timeout = Duration::from_secs(600);
    SessionRegistry::new(
        config,
        Arc::new(SimulationBackend::new()),
        Arc::new(prober),
    )
}

#[tokio::test(start_paused = true)]
async fn first_segment_of_long_source_is_ready_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_prober(&dir, SimulationProber::new(Duration::from_secs(2)));

    // 3600-second source, 6-second segments: the first await must return a
    // ready segment starting at zero within a two-second bound.
    let session = registry
        .create_session(test_source(3600), &ClientCapabilities::default(), Duration::ZERO)
        .await
        .unwrap();

    let segment = session
        .await_segment(session.generation(), 0, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(segment.start, Duration::ZERO);
    assert!(segment.duration <= Duration::from_secs(6));
    assert!(segment.byte_len > 0);
}

#[tokio::test(start_paused = true)]
async fn segments_become_ready_in_strictly_increasing_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_prober(&dir, SimulationProber::new(Duration::from_secs(2)));

    let session = registry
        .create_session(test_source(60), &ClientCapabilities::default(), Duration::ZERO)
        .await
        .unwrap();
    let generation = session.generation();

    let mut previous_start = None;
    for index in 0..10 {
        let segment = session
            .await_segment(generation, index, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(segment.index, index);
        if let Some(previous) = previous_start {
            assert!(segment.start > previous);
        }
        previous_start = Some(segment.start);
    }
}

#[tokio::test(start_paused = true)]
async fn seek_lands_on_keyframe_not_requested_offset() {
    let dir = tempfile::tempdir().unwrap();
    // Keyframes at 0, 997.4s and 1003s: a seek to 1000s must restart at
    // 997.4s.
    let prober = SimulationProber::with_timestamps(vec![
        Duration::ZERO,
        Duration::from_secs_f64(997.4),
        Duration::from_secs_f64(1003.0),
    ]);
    let registry = registry_with_prober(&dir, prober);

    let session = registry
        .create_session(test_source(3600), &ClientCapabilities::default(), Duration::ZERO)
        .await
        .unwrap();
    let old_generation = session.generation();

    let aligned = session.seek(Duration::from_secs(1000)).await.unwrap();
    assert_eq!(aligned, Duration::from_secs_f64(997.4));

    let new_generation = session.generation();
    assert!(new_generation > old_generation);

    let segment = session
        .await_segment(new_generation, 0, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(segment.start, Duration::from_secs_f64(997.4));

    // The superseded generation is no longer addressable.
    let stale = session
        .await_segment(old_generation, 0, Duration::from_secs(1))
        .await;
    assert!(matches!(
        stale,
        Err(SegmentError::SegmentUnavailable { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn quota_accounting_matches_stored_segments() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_prober(&dir, SimulationProber::new(Duration::from_secs(2)));

    let session = registry
        .create_session(test_source(30), &ClientCapabilities::default(), Duration::ZERO)
        .await
        .unwrap();
    let generation = session.generation();

    // Wait until the short run completes: five 6-second segments.
    let mut total_bytes = 0;
    for index in 0..5 {
        let segment = session
            .await_segment(generation, index, Duration::from_secs(30))
            .await
            .unwrap();
        total_bytes += segment.byte_len;
    }

    let usage = registry.quota().usage();
    assert_eq!(usage.used_bytes, total_bytes);

    // Discarding one segment releases exactly its bytes.
    let second = session
        .await_segment(generation, 1, Duration::from_secs(1))
        .await
        .unwrap();
    session.discard_segment(1);
    assert_eq!(
        registry.quota().usage().used_bytes,
        total_bytes - second.byte_len
    );

    // Removing the session leaves nothing accounted.
    registry
        .stop_session(session.id(), "test teardown")
        .await
        .unwrap();
    let usage = registry.quota().usage();
    assert_eq!(usage.used_bytes, 0);
    assert_eq!(usage.reserved_bytes, 0);
}

#[tokio::test(start_paused = true)]
async fn completed_run_serves_endlist_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_prober(&dir, SimulationProber::new(Duration::from_secs(2)));

    let session = registry
        .create_session(test_source(30), &ClientCapabilities::default(), Duration::ZERO)
        .await
        .unwrap();
    let generation = session.generation();

    for index in 0..5 {
        session
            .await_segment(generation, index, Duration::from_secs(30))
            .await
            .unwrap();
    }

    // Give the supervisor time to observe the clean exit.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = session.manifest_snapshot(Some(generation)).unwrap();
    assert!(snapshot.ended);
    assert_eq!(snapshot.entries.len(), 5);

    let playlist = spindrift_core::manifest::render_manifest(&snapshot, Duration::from_secs(6));
    assert!(playlist.contains("#EXT-X-ENDLIST"));
}

#[tokio::test(start_paused = true)]
async fn probe_failure_still_allows_playback() {
    let dir = tempfile::tempdir().unwrap();
    let prober = SimulationProber::failing(spindrift_core::ProbeError::ProbeFailed {
        reason: "corrupt container".to_string(),
    });
    let registry = registry_with_prober(&dir, prober);

    let session = registry
        .create_session(test_source(600), &ClientCapabilities::default(), Duration::ZERO)
        .await
        .unwrap();

    // Alignment is disabled: seeks use the exact requested offset.
    let aligned = session.seek(Duration::from_secs_f64(123.7)).await.unwrap();
    assert_eq!(aligned, Duration::from_secs_f64(123.7));

    let segment = session
        .await_segment(session.generation(), 0, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(segment.start, Duration::from_secs_f64(123.7));
}
