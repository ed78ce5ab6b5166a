//! Spindrift Core - transcoding session management and segmented streaming
//!
//! This crate provides the fundamental building blocks for adaptive
//! segmented media delivery: external encoder supervision, segment
//! production and readiness signaling, per-session state machines, and
//! process-wide session/quota management.

pub mod config;
pub mod encoder;
pub mod library;
pub mod manifest;
pub mod media;
pub mod probe;
pub mod profile;
pub mod quota;
pub mod segment;
pub mod session;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SpindriftConfig;
pub use encoder::{EncoderBackend, EncoderError, FfmpegBackend, SimulationBackend};
pub use library::{InMemoryMediaLibrary, MediaLibrary};
pub use media::{MediaSource, SourceId};
pub use probe::{FfprobeProber, KeyframeIndex, MediaProber, ProbeError, SimulationProber};
pub use profile::{ClientCapabilities, EncodeProfile, resolve_profile};
pub use quota::{DiskQuotaManager, QuotaError};
pub use segment::{Segment, SegmentError, SegmentStore};
pub use session::registry::{RegistryError, SessionRegistry};
pub use session::{SessionId, SessionState, TranscodeSession};

/// Core errors that can bubble up from any Spindrift subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SpindriftError {
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpindriftError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SpindriftError::Probe(_) => "Media analysis failed".to_string(),
            SpindriftError::Encoder(e) => match e {
                EncoderError::BinaryNotFound { name } => {
                    format!("Encoder binary '{name}' not found")
                }
                EncoderError::SpawnFailed { .. } => "Encoder could not be started".to_string(),
            },
            SpindriftError::Quota(_) => "Transcoding disk space exhausted".to_string(),
            SpindriftError::Segment(_) => "Stream segment unavailable".to_string(),
            SpindriftError::Session(_) => "Playback session error".to_string(),
            SpindriftError::Registry(RegistryError::RegistryFull { .. }) => {
                "Too many concurrent streams".to_string()
            }
            SpindriftError::Registry(_) => "Playback session error".to_string(),
            SpindriftError::Configuration { reason } => {
                format!("Configuration error: {reason}")
            }
            SpindriftError::Io(_) => "File system error occurred".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpindriftError>;
