//! External encoder orchestration.
//!
//! The encoder is an opaque process: this module builds its invocations,
//! supervises exactly one process per encode run, and cuts the output
//! stream into segments on encoded-time boundaries.

pub mod backend;
pub mod invocation;
pub mod supervisor;

pub use backend::{
    EncoderBackend, EncoderChild, EncoderError, EncoderEvent, FfmpegBackend, SimulationBackend,
};
pub use invocation::{EncoderInvocation, INVOCATION_VERSION};
pub use supervisor::{CrashCause, EncoderSupervisor, StopKind, SupervisorState};
