//! Explicit encoder process invocations.
//!
//! Everything the external encoder needs is carried in one value and
//! rendered to argv in a single place. The argument layout is versioned so
//! a changed contract with the encoder shows up in logs and in tests
//! instead of as silently different process behavior.

use std::path::PathBuf;
use std::time::Duration;

use crate::media::MediaSource;
use crate::profile::{EncodeProfile, ProfileMode};

/// Version of the argument layout produced by `to_args`.
pub const INVOCATION_VERSION: u32 = 1;

/// Complete description of one encoder process launch.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderInvocation {
    /// Input path the encoder reads
    pub input: PathBuf,
    /// Offset into the source to start encoding from (keyframe-aligned by
    /// the caller)
    pub start_offset: Duration,
    /// How much of the source to encode; runs to end-of-source
    pub encode_duration: Duration,
    pub profile: EncodeProfile,
}

impl EncoderInvocation {
    /// Build an invocation covering the source from `start_offset` to its end.
    pub fn to_end_of_source(
        source: &MediaSource,
        profile: EncodeProfile,
        start_offset: Duration,
    ) -> Self {
        Self {
            input: source.path.clone(),
            start_offset,
            encode_duration: source.duration.saturating_sub(start_offset),
            profile,
        }
    }

    /// Render the invocation to encoder argv (version `INVOCATION_VERSION`).
    ///
    /// Output goes to stdout as a continuous stream in the segment
    /// container; machine-readable progress reports go to the stderr pipe.
    pub fn to_args(&self) -> Vec<String> {
        // stdin stays open: the graceful stop path sends the quit command
        // over it.
        let mut args: Vec<String> = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];

        // -ss before -i: input-side seeking lands on the demuxer's closest
        // prior keyframe, which the caller already aligned to.
        if self.start_offset > Duration::ZERO {
            args.push("-ss".to_string());
            args.push(format!("{:.3}", self.start_offset.as_secs_f64()));
        }

        args.push("-i".to_string());
        args.push(self.input.display().to_string());

        if self.encode_duration > Duration::ZERO {
            args.push("-t".to_string());
            args.push(format!("{:.3}", self.encode_duration.as_secs_f64()));
        }

        match self.profile.mode {
            ProfileMode::PassThrough | ProfileMode::Remux => {
                args.push("-c:v".to_string());
                args.push("copy".to_string());
                args.push("-c:a".to_string());
                args.push("copy".to_string());
            }
            ProfileMode::Transcode => {
                args.push("-c:v".to_string());
                args.push(self.profile.video_codec.encoder_name().to_string());
                if let Some(bitrate) = self.profile.video_bitrate_kbps {
                    args.push("-b:v".to_string());
                    args.push(format!("{bitrate}k"));
                }
                if let Some(height) = self.profile.target_height {
                    args.push("-vf".to_string());
                    args.push(format!("scale=-2:{height}"));
                }
                // Keyframe cadence matching the segment duration, so every
                // segment starts decodable.
                let gop_seconds = self.profile.segment_duration.as_secs_f64();
                args.push("-force_key_frames".to_string());
                args.push(format!("expr:gte(t,n_forced*{gop_seconds:.3})"));

                args.push("-c:a".to_string());
                args.push(self.profile.audio_codec.encoder_name().to_string());
                args.push("-b:a".to_string());
                args.push("192k".to_string());
            }
        }

        args.push("-f".to_string());
        args.push("mpegts".to_string());
        args.push("-progress".to_string());
        args.push("pipe:2".to_string());
        args.push("pipe:1".to_string());

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioCodec, ContainerFormat, SourceId, VideoCodec};
    use crate::profile::SegmentContainer;

    fn transcode_profile() -> EncodeProfile {
        EncodeProfile {
            mode: ProfileMode::Transcode,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
            video_bitrate_kbps: Some(2500),
            target_height: Some(720),
            container: SegmentContainer::MpegTs,
            segment_duration: Duration::from_secs(6),
        }
    }

    fn test_source() -> MediaSource {
        MediaSource {
            id: SourceId::new(),
            path: PathBuf::from("/media/movie.mkv"),
            duration: Duration::from_secs(3600),
            container: ContainerFormat::Mkv,
            video: None,
            audio: None,
        }
    }

    #[test]
    fn test_offset_and_remaining_duration() {
        let invocation = EncoderInvocation::to_end_of_source(
            &test_source(),
            transcode_profile(),
            Duration::from_secs_f64(997.4),
        );

        assert_eq!(invocation.encode_duration, Duration::from_secs_f64(2602.6));

        let args = invocation.to_args();
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        assert_eq!(args[ss + 1], "997.400");
        // Input-side seek: -ss precedes -i.
        assert!(ss < args.iter().position(|a| a == "-i").unwrap());
    }

    #[test]
    fn test_zero_offset_omits_seek() {
        let invocation = EncoderInvocation::to_end_of_source(
            &test_source(),
            transcode_profile(),
            Duration::ZERO,
        );
        assert!(!invocation.to_args().contains(&"-ss".to_string()));
    }

    #[test]
    fn test_transcode_args_carry_profile_parameters() {
        let invocation = EncoderInvocation::to_end_of_source(
            &test_source(),
            transcode_profile(),
            Duration::ZERO,
        );
        let args = invocation.to_args();

        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-b:v", "2500k"]));
        assert!(args.windows(2).any(|w| w == ["-vf", "scale=-2:720"]));
        assert!(args.windows(2).any(|w| w == ["-f", "mpegts"]));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn test_copy_modes_never_reencode() {
        let mut profile = transcode_profile();
        profile.mode = ProfileMode::Remux;
        let invocation =
            EncoderInvocation::to_end_of_source(&test_source(), profile, Duration::ZERO);
        let args = invocation.to_args();

        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
        assert!(!args.contains(&"-b:v".to_string()));
    }
}
