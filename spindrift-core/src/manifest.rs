//! Playlist rendering for the active encode run.
//!
//! Renders an HLS-style media playlist from a run snapshot. Only the
//! active generation is ever rendered; staleness is decided by the store
//! before a snapshot exists. Pending segments are listed with the target
//! duration so clients know to poll for them.

use std::time::Duration;

use crate::segment::RunSnapshot;

/// MIME type for rendered playlists.
pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Render the run snapshot as a media playlist.
///
/// Segment URIs are relative to the session endpoint and carry the
/// generation, so a request surviving past a seek is rejected instead of
/// served from the wrong run.
pub fn render_manifest(snapshot: &RunSnapshot, target_duration: Duration) -> String {
    let mut out = String::with_capacity(256 + snapshot.entries.len() * 64);

    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        target_duration.as_secs_f64().ceil() as u64
    ));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str(&format!(
        "#EXT-X-DISCONTINUITY-SEQUENCE:{}\n",
        snapshot.generation
    ));

    for entry in &snapshot.entries {
        let duration = if entry.ready {
            entry.duration
        } else {
            target_duration
        };
        out.push_str(&format!("#EXTINF:{:.3},\n", duration.as_secs_f64()));
        out.push_str(&format!(
            "segments/{}?generation={}\n",
            entry.index, snapshot.generation
        ));
    }

    if snapshot.ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::ManifestEntry;

    fn snapshot(ended: bool) -> RunSnapshot {
        RunSnapshot {
            generation: 3,
            start_offset: Duration::from_secs(60),
            entries: vec![
                ManifestEntry {
                    index: 0,
                    start: Duration::from_secs(60),
                    duration: Duration::from_secs(6),
                    ready: true,
                },
                ManifestEntry {
                    index: 1,
                    start: Duration::from_secs(66),
                    duration: Duration::ZERO,
                    ready: false,
                },
            ],
            ended,
        }
    }

    #[test]
    fn test_manifest_lists_active_generation() {
        let manifest = render_manifest(&snapshot(false), Duration::from_secs(6));

        assert!(manifest.starts_with("#EXTM3U\n"));
        assert!(manifest.contains("#EXT-X-TARGETDURATION:6\n"));
        assert!(manifest.contains("#EXT-X-DISCONTINUITY-SEQUENCE:3\n"));
        assert!(manifest.contains("segments/0?generation=3\n"));
        assert!(manifest.contains("segments/1?generation=3\n"));
        assert!(!manifest.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_pending_segments_use_target_duration() {
        let manifest = render_manifest(&snapshot(false), Duration::from_secs(6));

        // Ready segment uses its real duration, pending one the target.
        let extinf_lines: Vec<&str> = manifest
            .lines()
            .filter(|l| l.starts_with("#EXTINF"))
            .collect();
        assert_eq!(extinf_lines, vec!["#EXTINF:6.000,", "#EXTINF:6.000,"]);
    }

    #[test]
    fn test_ended_run_carries_endlist() {
        let manifest = render_manifest(&snapshot(true), Duration::from_secs(6));
        assert!(manifest.ends_with("#EXT-X-ENDLIST\n"));
    }
}
