//! Centralized configuration for Spindrift.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Spindrift components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SpindriftConfig {
    pub session: SessionConfig,
    pub encoder: EncoderConfig,
    pub quota: QuotaConfig,
    pub probe: ProbeConfig,
    pub http: HttpConfig,
}

/// Transcode session lifecycle configuration.
///
/// Controls the concurrency cap, idle reaping, and crash restart policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root directory for per-session working areas
    pub workdir: PathBuf,
    /// Maximum number of concurrently registered sessions
    pub max_sessions: usize,
    /// Sessions idle longer than this are reaped
    pub idle_timeout: Duration,
    /// Interval between idle sweeps
    pub reap_interval: Duration,
    /// Automatic encoder restarts allowed per encode run before `Errored`
    pub restart_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/tmp/spindrift"),
            max_sessions: 4,
            idle_timeout: Duration::from_secs(300), // 5 minutes
            reap_interval: Duration::from_secs(30),
            restart_budget: 2,
        }
    }
}

/// External encoder process configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Encoder binary path (None = discover on PATH)
    pub binary_path: Option<PathBuf>,
    /// Time allowed between spawn and first output byte
    pub startup_timeout: Duration,
    /// Grace period between termination signal and forced kill
    pub stop_grace: Duration,
    /// Target duration of one output segment
    pub segment_duration: Duration,
    /// Ready-but-unserved segments to keep ahead of playback before
    /// pausing the encoder drain
    pub throttle_window: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            startup_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            segment_duration: Duration::from_secs(6), // 6-second segments
            throttle_window: 8,
        }
    }
}

/// Disk quota configuration for segment storage.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Aggregate cap across all sessions' segments in bytes
    pub capacity_bytes: u64,
    /// Bytes reserved up front when a new encode run starts
    pub run_reservation_bytes: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            run_reservation_bytes: 64 * 1024 * 1024, // 64 MiB head start per run
        }
    }
}

/// Keyframe probing configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Prober binary path (None = discover on PATH)
    pub binary_path: Option<PathBuf>,
    /// Time allowed for one keyframe scan
    pub probe_timeout: Duration,
    /// Number of built keyframe indices kept in the LRU cache
    pub cache_entries: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            probe_timeout: Duration::from_secs(30),
            cache_entries: 64,
        }
    }
}

/// HTTP serving configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Listen port for the web server
    pub port: u16,
    /// How long a segment request may wait for readiness
    pub segment_wait: Duration,
    /// Retry-After hint returned with not-yet-ready responses, in seconds
    pub retry_after_secs: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            segment_wait: Duration::from_secs(2),
            retry_after_secs: 1,
        }
    }
}

impl SpindriftConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("SPINDRIFT_WORKDIR") {
            config.session.workdir = PathBuf::from(dir);
        }

        if let Ok(max) = std::env::var("SPINDRIFT_MAX_SESSIONS") {
            if let Ok(count) = max.parse::<usize>() {
                config.session.max_sessions = count;
            }
        }

        if let Ok(quota) = std::env::var("SPINDRIFT_QUOTA_BYTES") {
            if let Ok(bytes) = quota.parse::<u64>() {
                config.quota.capacity_bytes = bytes;
            }
        }

        if let Ok(path) = std::env::var("SPINDRIFT_ENCODER_PATH") {
            config.encoder.binary_path = Some(PathBuf::from(path));
        }

        if let Ok(secs) = std::env::var("SPINDRIFT_IDLE_TIMEOUT") {
            if let Ok(seconds) = secs.parse::<u64>() {
                config.session.idle_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(port) = std::env::var("SPINDRIFT_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.http.port = port;
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timeouts and small limits so tests exercise eviction and
    /// reaping without waiting on production-scale intervals.
    pub fn for_testing(workdir: PathBuf) -> Self {
        let mut config = Self::default();
        config.session.workdir = workdir;
        config.session.max_sessions = 2;
        config.session.idle_timeout = Duration::from_millis(200);
        config.session.reap_interval = Duration::from_millis(50);
        config.encoder.startup_timeout = Duration::from_millis(500);
        config.encoder.stop_grace = Duration::from_millis(100);
        config.encoder.segment_duration = Duration::from_secs(6);
        config.quota.capacity_bytes = 16 * 1024 * 1024;
        config.quota.run_reservation_bytes = 1024 * 1024;
        config.http.segment_wait = Duration::from_millis(500);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SpindriftConfig::default();

        assert_eq!(config.session.max_sessions, 4);
        assert_eq!(config.session.restart_budget, 2);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.encoder.segment_duration, Duration::from_secs(6));
        assert_eq!(config.quota.capacity_bytes, 2 * 1024 * 1024 * 1024);
        assert!(config.encoder.binary_path.is_none());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SPINDRIFT_MAX_SESSIONS", "16");
            std::env::set_var("SPINDRIFT_QUOTA_BYTES", "1048576");
            std::env::set_var("SPINDRIFT_IDLE_TIMEOUT", "60");
        }

        let config = SpindriftConfig::from_env();

        assert_eq!(config.session.max_sessions, 16);
        assert_eq!(config.quota.capacity_bytes, 1_048_576);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(60));

        // Cleanup
        unsafe {
            std::env::remove_var("SPINDRIFT_MAX_SESSIONS");
            std::env::remove_var("SPINDRIFT_QUOTA_BYTES");
            std::env::remove_var("SPINDRIFT_IDLE_TIMEOUT");
        }
    }

    #[test]
    fn test_testing_preset() {
        let config = SpindriftConfig::for_testing(PathBuf::from("/tmp/x"));
        assert_eq!(config.session.max_sessions, 2);
        assert!(config.session.idle_timeout < Duration::from_secs(1));
    }
}
