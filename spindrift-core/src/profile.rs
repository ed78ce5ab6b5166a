//! Encode profile resolution from client capabilities.
//!
//! `resolve_profile` is a pure policy function: given an immutable source
//! descriptor and what the client claims to decode, it picks the cheapest
//! viable delivery mode. Cost order is fixed: exact codec match beats a
//! container remux, which beats a full re-encode.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::{AudioCodec, ContainerFormat, MediaSource, VideoCodec};

/// Bitrate ladder for full re-encodes: (height, video kbit/s).
const TRANSCODE_LADDER: &[(u32, u32)] = &[
    (2160, 15000),
    (1080, 5000),
    (720, 2500),
    (480, 1000),
];

/// Audio bitrate used when re-encoding audio, in kbit/s.
const TRANSCODE_AUDIO_KBPS: u32 = 192;

/// What the requesting client can decode and how much it can take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    pub video_codecs: Vec<VideoCodec>,
    pub audio_codecs: Vec<AudioCodec>,
    pub containers: Vec<ContainerFormat>,
    /// Upper bound on total stream bitrate in kbit/s
    pub max_bitrate_kbps: Option<u32>,
    /// Upper bound on vertical resolution
    pub max_height: Option<u32>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        // Baseline browser profile: H.264/AAC in segmented TS or MP4.
        Self {
            video_codecs: vec![VideoCodec::H264],
            audio_codecs: vec![AudioCodec::Aac],
            containers: vec![ContainerFormat::MpegTs, ContainerFormat::Mp4],
            max_bitrate_kbps: None,
            max_height: None,
        }
    }
}

/// How the encoder treats the source streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileMode {
    /// Source codecs and container already satisfy the client; streams are
    /// copied byte for byte
    PassThrough,
    /// Codecs are fine but the container is not; copy streams into the
    /// segment container
    Remux,
    /// Full re-encode to the target codecs
    Transcode,
}

impl ProfileMode {
    /// Short label for logs and status payloads.
    pub fn label(&self) -> &'static str {
        match self {
            ProfileMode::PassThrough => "pass-through",
            ProfileMode::Remux => "remux",
            ProfileMode::Transcode => "transcode",
        }
    }
}

/// Container used for produced segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentContainer {
    /// MPEG transport stream segments
    MpegTs,
    /// Fragmented MP4 segments
    Fmp4,
}

impl SegmentContainer {
    /// Get file extension for segment files.
    pub fn extension(&self) -> &'static str {
        match self {
            SegmentContainer::MpegTs => "ts",
            SegmentContainer::Fmp4 => "m4s",
        }
    }

    /// Get MIME type for HTTP Content-Type headers.
    pub fn mime_type(&self) -> &'static str {
        match self {
            SegmentContainer::MpegTs => "video/mp2t",
            SegmentContainer::Fmp4 => "video/iso.segment",
        }
    }
}

/// Immutable encode target chosen for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    pub mode: ProfileMode,
    /// Target video codec; ignored when streams are copied
    pub video_codec: VideoCodec,
    /// Target audio codec; ignored when streams are copied
    pub audio_codec: AudioCodec,
    /// Target video bitrate in kbit/s; None when copying
    pub video_bitrate_kbps: Option<u32>,
    /// Target vertical resolution; None when copying
    pub target_height: Option<u32>,
    pub container: SegmentContainer,
    pub segment_duration: Duration,
}

impl EncodeProfile {
    /// Check whether the profile re-encodes any stream.
    pub fn requires_transcode(&self) -> bool {
        self.mode == ProfileMode::Transcode
    }

    /// Rough output size for an encode run of `duration`, in bytes.
    ///
    /// Used only for up-front quota reservations, so an over-estimate is
    /// preferable to an under-estimate.
    pub fn estimated_bytes(&self, duration: Duration, source: &MediaSource) -> u64 {
        let video_kbps = self
            .video_bitrate_kbps
            .or_else(|| source.video.as_ref().and_then(|v| v.bitrate_kbps))
            .unwrap_or(5000);
        let audio_kbps = source
            .audio
            .as_ref()
            .and_then(|a| a.bitrate_kbps)
            .unwrap_or(TRANSCODE_AUDIO_KBPS);

        let total_kbps = u64::from(video_kbps) + u64::from(audio_kbps);
        total_kbps * 1000 / 8 * duration.as_secs().max(1)
    }
}

/// Resolve the cheapest profile the client can play.
///
/// Pure and deterministic: no I/O, no clock, same inputs same output.
/// Priority-ordered rule list:
/// 1. exact codec and container match - pass-through, zero encode cost
/// 2. codec match only - remux into the segment container, copy streams
/// 3. otherwise - full re-encode at the highest ladder rung within the
///    client's declared bitrate and resolution limits
pub fn resolve_profile(
    source: &MediaSource,
    caps: &ClientCapabilities,
    segment_duration: Duration,
) -> EncodeProfile {
    let video_ok = source
        .video
        .as_ref()
        .is_none_or(|v| caps.video_codecs.contains(&v.codec));
    let audio_ok = source
        .audio
        .as_ref()
        .is_none_or(|a| caps.audio_codecs.contains(&a.codec));
    let container_ok = caps.containers.contains(&source.container);
    let bitrate_ok = match (source_bitrate_kbps(source), caps.max_bitrate_kbps) {
        (Some(actual), Some(limit)) => actual <= limit,
        _ => true,
    };
    let height_ok = match (source.video_height(), caps.max_height) {
        (Some(actual), Some(limit)) => actual <= limit,
        _ => true,
    };

    let copy_codecs = video_ok && audio_ok && bitrate_ok && height_ok;

    if copy_codecs && container_ok {
        return EncodeProfile {
            mode: ProfileMode::PassThrough,
            video_codec: source
                .video
                .as_ref()
                .map(|v| v.codec)
                .unwrap_or(VideoCodec::H264),
            audio_codec: source
                .audio
                .as_ref()
                .map(|a| a.codec)
                .unwrap_or(AudioCodec::Aac),
            video_bitrate_kbps: None,
            target_height: None,
            container: SegmentContainer::MpegTs,
            segment_duration,
        };
    }

    if copy_codecs {
        return EncodeProfile {
            mode: ProfileMode::Remux,
            video_codec: source
                .video
                .as_ref()
                .map(|v| v.codec)
                .unwrap_or(VideoCodec::H264),
            audio_codec: source
                .audio
                .as_ref()
                .map(|a| a.codec)
                .unwrap_or(AudioCodec::Aac),
            video_bitrate_kbps: None,
            target_height: None,
            container: SegmentContainer::MpegTs,
            segment_duration,
        };
    }

    let (target_height, video_bitrate_kbps) = select_ladder_rung(source, caps);

    EncodeProfile {
        mode: ProfileMode::Transcode,
        video_codec: caps
            .video_codecs
            .first()
            .copied()
            .unwrap_or(VideoCodec::H264),
        audio_codec: caps
            .audio_codecs
            .first()
            .copied()
            .unwrap_or(AudioCodec::Aac),
        video_bitrate_kbps: Some(video_bitrate_kbps),
        target_height: Some(target_height),
        container: SegmentContainer::MpegTs,
        segment_duration,
    }
}

/// Total declared source bitrate, when the library knows it.
fn source_bitrate_kbps(source: &MediaSource) -> Option<u32> {
    let video = source.video.as_ref().and_then(|v| v.bitrate_kbps);
    let audio = source.audio.as_ref().and_then(|a| a.bitrate_kbps);
    match (video, audio) {
        (Some(v), Some(a)) => Some(v + a),
        (Some(v), None) => Some(v),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// Highest ladder rung within the client's limits and the source height.
///
/// Never upscales: rungs above the source's own resolution are skipped.
fn select_ladder_rung(source: &MediaSource, caps: &ClientCapabilities) -> (u32, u32) {
    let source_height = source.video_height().unwrap_or(u32::MAX);

    for &(height, bitrate) in TRANSCODE_LADDER {
        if height > source_height {
            continue;
        }
        if caps.max_height.is_some_and(|limit| height > limit) {
            continue;
        }
        if caps
            .max_bitrate_kbps
            .is_some_and(|limit| bitrate + TRANSCODE_AUDIO_KBPS > limit)
        {
            continue;
        }
        return (height, bitrate);
    }

    // Nothing fits; serve the floor rung rather than refusing playback.
    let &(height, bitrate) = TRANSCODE_LADDER.last().unwrap();
    (height, bitrate)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::media::{AudioStream, SourceId, VideoStream};

    fn h264_mp4_source() -> MediaSource {
        MediaSource {
            id: SourceId::new(),
            path: PathBuf::from("/media/movie.mp4"),
            duration: Duration::from_secs(3600),
            container: ContainerFormat::Mp4,
            video: Some(VideoStream {
                codec: VideoCodec::H264,
                width: 1920,
                height: 1080,
                bitrate_kbps: Some(4500),
            }),
            audio: Some(AudioStream {
                codec: AudioCodec::Aac,
                channels: 2,
                bitrate_kbps: Some(160),
            }),
        }
    }

    fn hevc_mkv_source() -> MediaSource {
        let mut source = h264_mp4_source();
        source.container = ContainerFormat::Mkv;
        source.video.as_mut().unwrap().codec = VideoCodec::Hevc;
        source
    }

    #[test]
    fn test_exact_match_is_pass_through() {
        let profile = resolve_profile(
            &h264_mp4_source(),
            &ClientCapabilities::default(),
            Duration::from_secs(6),
        );

        assert_eq!(profile.mode, ProfileMode::PassThrough);
        assert_eq!(profile.video_bitrate_kbps, None);
        assert!(!profile.requires_transcode());
    }

    #[test]
    fn test_container_mismatch_is_remux_only() {
        let mut source = h264_mp4_source();
        source.container = ContainerFormat::Mkv;

        let caps = ClientCapabilities {
            containers: vec![ContainerFormat::Mp4],
            ..Default::default()
        };
        let profile = resolve_profile(&source, &caps, Duration::from_secs(6));

        assert_eq!(profile.mode, ProfileMode::Remux);
        assert_eq!(profile.video_codec, VideoCodec::H264);
        assert_eq!(profile.video_bitrate_kbps, None);
    }

    #[test]
    fn test_codec_mismatch_forces_transcode() {
        let profile = resolve_profile(
            &hevc_mkv_source(),
            &ClientCapabilities::default(),
            Duration::from_secs(6),
        );

        assert_eq!(profile.mode, ProfileMode::Transcode);
        assert_eq!(profile.video_codec, VideoCodec::H264);
        // 1080p source caps the ladder at the 1080p rung.
        assert_eq!(profile.target_height, Some(1080));
        assert_eq!(profile.video_bitrate_kbps, Some(5000));
    }

    #[test]
    fn test_ladder_respects_client_limits() {
        let caps = ClientCapabilities {
            max_bitrate_kbps: Some(3000),
            max_height: Some(720),
            ..Default::default()
        };
        let profile = resolve_profile(&hevc_mkv_source(), &caps, Duration::from_secs(6));

        assert_eq!(profile.target_height, Some(720));
        assert_eq!(profile.video_bitrate_kbps, Some(2500));
    }

    #[test]
    fn test_ladder_floor_when_nothing_fits() {
        let caps = ClientCapabilities {
            max_bitrate_kbps: Some(100),
            ..Default::default()
        };
        let profile = resolve_profile(&hevc_mkv_source(), &caps, Duration::from_secs(6));

        assert_eq!(profile.target_height, Some(480));
        assert_eq!(profile.video_bitrate_kbps, Some(1000));
    }

    #[test]
    fn test_bitrate_cap_breaks_pass_through() {
        let caps = ClientCapabilities {
            max_bitrate_kbps: Some(2000),
            ..Default::default()
        };
        let profile = resolve_profile(&h264_mp4_source(), &caps, Duration::from_secs(6));

        // Source is 4660 kbit/s total, above the client cap.
        assert_eq!(profile.mode, ProfileMode::Transcode);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let source = hevc_mkv_source();
        let caps = ClientCapabilities::default();
        let a = resolve_profile(&source, &caps, Duration::from_secs(6));
        let b = resolve_profile(&source, &caps, Duration::from_secs(6));
        assert_eq!(a, b);
    }

    #[test]
    fn test_estimated_bytes_scales_with_duration() {
        let source = h264_mp4_source();
        let profile = resolve_profile(&source, &ClientCapabilities::default(), Duration::from_secs(6));

        let short = profile.estimated_bytes(Duration::from_secs(60), &source);
        let long = profile.estimated_bytes(Duration::from_secs(600), &source);
        assert_eq!(long, short * 10);
    }
}
