//! Media source descriptors supplied by the library subsystem.
//!
//! Spindrift never scans libraries itself; it receives immutable
//! `MediaSource` values describing an input file and only reads them.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a media source in the owning library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(Uuid);

impl SourceId {
    /// Create new random source id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse source id from its string form.
    ///
    /// # Errors
    /// Returns the underlying `uuid::Error` if the string is not a UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Container format of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerFormat {
    /// MPEG-4 Part 14 container (.mp4)
    Mp4,
    /// Matroska Video container (.mkv)
    Mkv,
    /// Audio Video Interleave container (.avi)
    Avi,
    /// QuickTime movie container (.mov)
    Mov,
    /// WebM container (.webm)
    WebM,
    /// MPEG transport stream (.ts)
    MpegTs,
    /// Container format could not be determined
    Unknown,
}

impl ContainerFormat {
    /// Get file extension for this container.
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Avi => "avi",
            ContainerFormat::Mov => "mov",
            ContainerFormat::WebM => "webm",
            ContainerFormat::MpegTs => "ts",
            ContainerFormat::Unknown => "bin",
        }
    }

    /// Get MIME type for HTTP Content-Type headers.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "video/mp4",
            ContainerFormat::Mkv => "video/x-matroska",
            ContainerFormat::Avi => "video/x-msvideo",
            ContainerFormat::Mov => "video/quicktime",
            ContainerFormat::WebM => "video/webm",
            ContainerFormat::MpegTs => "video/mp2t",
            ContainerFormat::Unknown => "application/octet-stream",
        }
    }
}

/// Video codec identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    Hevc,
    Vp9,
    Av1,
    Mpeg4,
    Unknown,
}

impl VideoCodec {
    /// Get encoder name as passed to the external encoder.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libaom-av1",
            VideoCodec::Mpeg4 => "mpeg4",
            VideoCodec::Unknown => "libx264",
        }
    }
}

/// Audio codec identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Aac,
    Ac3,
    Mp3,
    Opus,
    Flac,
    Unknown,
}

impl AudioCodec {
    /// Get encoder name as passed to the external encoder.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Ac3 => "ac3",
            AudioCodec::Mp3 => "libmp3lame",
            AudioCodec::Opus => "libopus",
            AudioCodec::Flac => "flac",
            AudioCodec::Unknown => "aac",
        }
    }
}

/// Video stream descriptor from the library's probe metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStream {
    pub codec: VideoCodec,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Average bitrate in kbit/s, if the library knows it
    pub bitrate_kbps: Option<u32>,
}

/// Audio stream descriptor from the library's probe metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStream {
    pub codec: AudioCodec,
    pub channels: u32,
    /// Average bitrate in kbit/s, if the library knows it
    pub bitrate_kbps: Option<u32>,
}

/// Immutable input descriptor owned by the external library subsystem.
///
/// The transcoding core only ever reads these; mutation happens in the
/// library when the underlying file changes, which produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    pub id: SourceId,
    /// Path or URI the encoder reads from
    pub path: PathBuf,
    /// Total duration of the source
    pub duration: Duration,
    pub container: ContainerFormat,
    pub video: Option<VideoStream>,
    pub audio: Option<AudioStream>,
}

impl MediaSource {
    /// Check whether the source has a video track.
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Vertical resolution of the primary video stream, if any.
    pub fn video_height(&self) -> Option<u32> {
        self.video.as_ref().map(|v| v.height)
    }
}
