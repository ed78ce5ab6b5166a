//! Keyframe scanning through the external `ffprobe` binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{MediaProber, ProbeError};
use crate::config::ProbeConfig;
use crate::media::MediaSource;

/// Production prober that lists keyframe packets with `ffprobe`.
///
/// One scan per source: packets of the first video stream are dumped as
/// `pts_time,flags` pairs and the key-flagged ones become index entries.
pub struct FfprobeProber {
    binary_path: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    /// Create new prober, resolving the binary from config or PATH.
    ///
    /// # Errors
    /// - `ProbeError::BinaryNotFound` - No usable `ffprobe` binary
    pub fn new(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let binary_path = match &config.binary_path {
            Some(path) => path.clone(),
            None => which::which("ffprobe").map_err(|_| ProbeError::BinaryNotFound {
                name: "ffprobe".to_string(),
            })?,
        };

        Ok(Self {
            binary_path,
            timeout: config.probe_timeout,
        })
    }

    /// Parse `pts_time,flags` CSV lines into keyframe timestamps.
    fn parse_packet_lines(output: &str) -> Vec<Duration> {
        let mut timestamps = Vec::new();
        for line in output.lines() {
            let mut fields = line.trim().split(',');
            let (Some(pts), Some(flags)) = (fields.next(), fields.next()) else {
                continue;
            };
            if !flags.contains('K') {
                continue;
            }
            if let Ok(seconds) = pts.parse::<f64>() {
                if seconds.is_finite() && seconds >= 0.0 {
                    timestamps.push(Duration::from_secs_f64(seconds));
                }
            }
        }
        timestamps
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn keyframe_timestamps(
        &self,
        source: &MediaSource,
    ) -> Result<Vec<Duration>, ProbeError> {
        let mut cmd = tokio::process::Command::new(&self.binary_path);
        cmd.arg("-loglevel")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("packet=pts_time,flags")
            .arg("-of")
            .arg("csv=print_section=0")
            .arg(&source.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Scanning keyframes for {}: {:?}", source.id, cmd);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| ProbeError::SourceUnreadable {
                path: source.path.display().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "ffprobe failed for {} with {}: {}",
                source.id,
                output.status,
                stderr.trim()
            );
            return Err(ProbeError::ProbeFailed {
                reason: format!("ffprobe exited with {}: {}", output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_packet_lines(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_packet_lines_filters_keyframes() {
        let output = "0.000000,K__\n2.002000,___\n4.004000,K__\n6.006000,__D\n";
        let timestamps = FfprobeProber::parse_packet_lines(output);

        assert_eq!(
            timestamps,
            vec![
                Duration::from_secs_f64(0.0),
                Duration::from_secs_f64(4.004),
            ]
        );
    }

    #[test]
    fn test_parse_packet_lines_skips_malformed() {
        let output = "garbage\nN/A,K__\n-1.0,K__\n1.5,K__\n";
        let timestamps = FfprobeProber::parse_packet_lines(output);
        assert_eq!(timestamps, vec![Duration::from_secs_f64(1.5)]);
    }

    #[test]
    fn test_missing_binary_is_reported() {
        let config = ProbeConfig {
            binary_path: Some(PathBuf::from("/nonexistent/ffprobe")),
            ..Default::default()
        };
        // Explicit paths are trusted at construction; spawn failure surfaces
        // as SourceUnreadable at scan time instead.
        assert!(FfprobeProber::new(&config).is_ok());
    }
}
