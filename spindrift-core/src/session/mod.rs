//! Transcode session state machine.
//!
//! A session is the unit the HTTP layer talks to: it owns exactly one
//! segment store and at most one live encoder supervisor, and coordinates
//! seeks, crash restarts, and termination. Eviction, idle reaping, and the
//! concurrency cap live one level up in the registry.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
// The tokio clock (rather than the std one) so idle accounting follows
// virtual time under `tokio::time::pause` in tests.
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EncoderConfig, SessionConfig};
use crate::encoder::{
    CrashCause, EncoderBackend, EncoderInvocation, EncoderSupervisor, StopKind, SupervisorState,
};
use crate::media::MediaSource;
use crate::probe::KeyframeIndex;
use crate::profile::EncodeProfile;
use crate::quota::{DiskQuotaManager, QuotaError};
use crate::segment::{Generation, RunSnapshot, Segment, SegmentError, SegmentStore};

/// Opaque session token handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse session id from its string form.
    ///
    /// # Errors
    /// Returns the underlying `uuid::Error` if the string is not a UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session control states.
///
/// `Streaming` is the steady state: the supervisor is running or has
/// completed, and segments are being served. `Stopped` and `Errored` are
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet encoding
    Idle,
    /// First encode run being launched
    Starting,
    /// Segments available for serving
    Streaming,
    /// Old run stopping, new run starting at the seek target
    Seeking,
    /// Terminated by client, eviction, reap, or quota
    Stopped { reason: String },
    /// Crash restart budget exhausted; last cause recorded
    Errored { cause: CrashCause },
}

impl SessionState {
    /// Check whether the session can never serve again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped { .. } | SessionState::Errored { .. })
    }

    /// Short state label for status payloads.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Streaming => "streaming",
            SessionState::Seeking => "seeking",
            SessionState::Stopped { .. } => "stopped",
            SessionState::Errored { .. } => "errored",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Errors from session control operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is {state}, cannot {operation}")]
    InvalidState { state: String, operation: String },

    #[error("Seek offset {offset:?} beyond source duration {duration:?}")]
    SeekBeyondEnd { offset: Duration, duration: Duration },

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

struct Inner {
    state: SessionState,
    supervisor: Option<Arc<EncoderSupervisor>>,
    restart_count: u32,
    current_offset: Duration,
    /// Bumped on every run launch and explicit stop; stale run monitors
    /// compare it before acting so a superseded run cannot restart itself
    epoch: u64,
}

/// One client's transcode: source, profile, store, and encoder lifecycle.
pub struct TranscodeSession {
    id: SessionId,
    source: MediaSource,
    profile: EncodeProfile,
    keyframes: Option<Arc<KeyframeIndex>>,
    store: Arc<SegmentStore>,
    backend: Arc<dyn EncoderBackend>,
    quota: Arc<DiskQuotaManager>,
    session_config: SessionConfig,
    encoder_config: EncoderConfig,
    /// Upper bound on the per-run quota reservation
    run_reservation_cap: u64,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
    inner: Mutex<Inner>,
}

impl TranscodeSession {
    /// Create new session in `Idle`; no process is spawned yet.
    ///
    /// `keyframes` is `None` when the probe failed, in which case seeks
    /// treat every requested offset as exact.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        source: MediaSource,
        profile: EncodeProfile,
        keyframes: Option<Arc<KeyframeIndex>>,
        backend: Arc<dyn EncoderBackend>,
        quota: Arc<DiskQuotaManager>,
        session_config: SessionConfig,
        encoder_config: EncoderConfig,
        run_reservation_cap: u64,
    ) -> Self {
        let store = Arc::new(SegmentStore::new(
            id,
            &session_config.workdir,
            profile.container.extension(),
            Arc::clone(&quota),
        ));
        let now = Instant::now();

        Self {
            id,
            source,
            profile,
            keyframes,
            store,
            backend,
            quota,
            session_config,
            encoder_config,
            run_reservation_cap,
            created_at: now,
            last_accessed: Mutex::new(now),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                supervisor: None,
                restart_count: 0,
                current_offset: Duration::ZERO,
                epoch: 0,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source(&self) -> &MediaSource {
        &self.source
    }

    pub fn profile(&self) -> &EncodeProfile {
        &self.profile
    }

    /// Current control state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    /// Active segment-index generation.
    pub fn generation(&self) -> Generation {
        self.store.generation()
    }

    /// Offset the current encode run started from.
    pub fn current_offset(&self) -> Duration {
        self.inner.lock().current_offset
    }

    /// Automatic restarts consumed by the current run.
    pub fn restart_count(&self) -> u32 {
        self.inner.lock().restart_count
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Update the last-accessed timestamp.
    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    /// Time since the session was last touched by any request.
    pub fn idle_for(&self) -> Duration {
        self.last_accessed.lock().elapsed()
    }

    /// Map a requested offset to its keyframe-aligned restart point.
    ///
    /// Falls back to the exact offset when no index could be built.
    pub fn align_offset(&self, offset: Duration) -> Duration {
        match &self.keyframes {
            Some(index) => index.nearest_at_or_before(offset),
            None => offset,
        }
    }

    fn expected_segments(&self, aligned: Duration) -> u32 {
        let remaining = self.source.duration.saturating_sub(aligned);
        let per_segment = self.profile.segment_duration.as_secs_f64();
        (remaining.as_secs_f64() / per_segment).ceil().max(1.0) as u32
    }

    /// Begin encoding from `offset` (Idle -> Starting -> Streaming).
    ///
    /// The caller has already reserved quota headroom for this first run.
    ///
    /// # Errors
    /// - `SessionError::InvalidState` - Session is not `Idle`
    pub async fn start(self: &Arc<Self>, offset: Duration) -> Result<Duration, SessionError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(SessionError::InvalidState {
                    state: inner.state.label().to_string(),
                    operation: "start".to_string(),
                });
            }
            inner.state = SessionState::Starting;
        }

        self.launch_run(offset).await
    }

    /// Seek to `offset` (Streaming -> Seeking -> Streaming).
    ///
    /// The current encoder is stopped, the keyframe index resolves the new
    /// restart point, and a fresh generation begins. Waiters on the old
    /// generation are released with `SegmentUnavailable`. Returns the
    /// aligned offset actually seeked to.
    ///
    /// # Errors
    /// - `SessionError::SeekBeyondEnd` - Offset past the source duration
    /// - `SessionError::InvalidState` - Terminal session or concurrent seek
    /// - `SessionError::Quota` - No headroom for the new encode run
    pub async fn seek(self: &Arc<Self>, offset: Duration) -> Result<Duration, SessionError> {
        self.touch();
        if offset > self.source.duration {
            return Err(SessionError::SeekBeyondEnd {
                offset,
                duration: self.source.duration,
            });
        }

        let supervisor = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Streaming | SessionState::Idle => {
                    inner.state = SessionState::Seeking;
                    inner.supervisor.take()
                }
                _ => {
                    return Err(SessionError::InvalidState {
                        state: inner.state.label().to_string(),
                        operation: "seek".to_string(),
                    });
                }
            }
        };

        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }

        // A seek starts a new encode run: refresh the headroom reservation.
        self.quota.cancel_reservation(self.id);
        let reservation = self.run_reservation(offset);
        if let Err(e) = self.quota.reserve(self.id, reservation) {
            warn!("Seek denied by quota for {}: {}", self.id, e);
            self.finalize_stop(&format!("disk quota exceeded: {e}"));
            return Err(e.into());
        }

        let aligned = self.launch_run(offset).await?;
        self.inner.lock().restart_count = 0;
        info!(
            "Session {} seeked to {:?} (aligned {:?}), generation {}",
            self.id,
            offset,
            aligned,
            self.store.generation()
        );
        Ok(aligned)
    }

    /// Stop the session for good (any state -> Stopped). Idempotent.
    ///
    /// The same path serves explicit client termination, idle reaping,
    /// and capacity eviction: the supervisor teardown always runs to
    /// completion and every segment waiter is released before the state
    /// reads `Stopped`.
    pub async fn stop(self: &Arc<Self>, reason: &str) {
        let supervisor = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = SessionState::Stopped {
                reason: reason.to_string(),
            };
            inner.epoch += 1;
            inner.supervisor.take()
        };

        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        self.store.shutdown(reason);
        self.quota.cancel_reservation(self.id);
        info!("Session {} stopped: {}", self.id, reason);
    }

    /// Wait for a segment of the given generation, bounded by `timeout`.
    ///
    /// # Errors
    /// Propagates `SegmentError` from the store; an `Errored` session fails
    /// with `SegmentUnavailable` carrying the recorded crash cause.
    pub async fn await_segment(
        &self,
        generation: Generation,
        index: u32,
        timeout: Duration,
    ) -> Result<Segment, SegmentError> {
        self.touch();
        self.store.await_segment(generation, index, timeout).await
    }

    /// Snapshot of the active run for manifest rendering.
    ///
    /// # Errors
    /// - `SegmentError::StaleGeneration` - Superseded generation requested
    /// - `SegmentError::SegmentUnavailable` - Session torn down
    pub fn manifest_snapshot(
        &self,
        generation: Option<Generation>,
    ) -> Result<RunSnapshot, SegmentError> {
        self.touch();
        self.store.snapshot(generation)
    }

    /// Discard a completed segment, returning its bytes to the quota pool.
    pub fn discard_segment(&self, index: u32) {
        self.store.discard(index);
    }

    /// Headroom reserved up front for an encode run from `offset`.
    ///
    /// The estimate is capped so a long source cannot reserve the whole
    /// quota before producing a byte.
    pub fn run_reservation(&self, offset: Duration) -> u64 {
        let remaining = self.source.duration.saturating_sub(offset);
        self.profile
            .estimated_bytes(remaining, &self.source)
            .min(self.run_reservation_cap)
    }

    /// Launch an encode run from `offset` under a fresh generation.
    async fn launch_run(self: &Arc<Self>, offset: Duration) -> Result<Duration, SessionError> {
        let aligned = self.align_offset(offset);
        let expected = self.expected_segments(aligned);
        if let Err(e) = self.store.begin_run(aligned, Some(expected)) {
            self.finalize_stop(&format!("failed to begin encode run: {e}"));
            return Err(e.into());
        }

        let invocation =
            EncoderInvocation::to_end_of_source(&self.source, self.profile.clone(), aligned);
        let supervisor = Arc::new(EncoderSupervisor::start(
            Arc::clone(&self.backend),
            invocation,
            Arc::clone(&self.store),
            &self.encoder_config,
        ));

        let installed = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Starting | SessionState::Seeking => {
                    inner.state = SessionState::Streaming;
                    inner.current_offset = aligned;
                    inner.epoch += 1;
                    inner.supervisor = Some(Arc::clone(&supervisor));
                    Some(inner.epoch)
                }
                _ => None,
            }
        };

        match installed {
            Some(epoch) => {
                self.spawn_monitor(supervisor, epoch);
                Ok(aligned)
            }
            None => {
                // A concurrent stop won the race; tear the fresh run down.
                supervisor.stop().await;
                Err(SessionError::InvalidState {
                    state: self.state().label().to_string(),
                    operation: "launch encode run".to_string(),
                })
            }
        }
    }

    /// Relaunch the encoder after a crash, continuing the same generation.
    async fn relaunch_after_crash(self: &Arc<Self>, epoch: u64) {
        let resume = self.store.resume_offset();
        let invocation =
            EncoderInvocation::to_end_of_source(&self.source, self.profile.clone(), resume);
        let supervisor = Arc::new(EncoderSupervisor::start(
            Arc::clone(&self.backend),
            invocation,
            Arc::clone(&self.store),
            &self.encoder_config,
        ));

        let installed = {
            let mut inner = self.inner.lock();
            if inner.epoch == epoch && inner.state == SessionState::Streaming {
                inner.supervisor = Some(Arc::clone(&supervisor));
                true
            } else {
                false
            }
        };

        if installed {
            info!(
                "Session {} restarted encoder from {:?} (restart {})",
                self.id,
                resume,
                self.restart_count()
            );
            self.spawn_monitor(supervisor, epoch);
        } else {
            supervisor.stop().await;
        }
    }

    fn spawn_monitor(self: &Arc<Self>, supervisor: Arc<EncoderSupervisor>, epoch: u64) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let terminal = supervisor.wait_terminal().await;
            session.handle_run_end(terminal, epoch).await;
        });
    }

    /// React to a run reaching a terminal supervisor state.
    async fn handle_run_end(self: &Arc<Self>, terminal: SupervisorState, epoch: u64) {
        match terminal {
            SupervisorState::Completed => {
                debug!("Session {} encode run completed", self.id);
                self.quota.cancel_reservation(self.id);
            }
            SupervisorState::Killed {
                kind: StopKind::Requested,
            } => {
                // Seek or stop initiated this; the initiator owns the
                // session transition.
            }
            SupervisorState::Killed {
                kind: StopKind::QuotaExceeded,
            } => {
                let ours = {
                    let mut inner = self.inner.lock();
                    if inner.epoch == epoch && inner.state == SessionState::Streaming {
                        inner.state = SessionState::Stopped {
                            reason: "disk quota exceeded".to_string(),
                        };
                        inner.supervisor = None;
                        true
                    } else {
                        false
                    }
                };
                if ours {
                    self.store.shutdown("disk quota exceeded");
                    self.quota.cancel_reservation(self.id);
                    warn!("Session {} stopped: active write breached disk quota", self.id);
                }
            }
            SupervisorState::Crashed { cause } => {
                let action = {
                    let mut inner = self.inner.lock();
                    if inner.epoch != epoch || inner.state != SessionState::Streaming {
                        None
                    } else if inner.restart_count < self.session_config.restart_budget {
                        inner.restart_count += 1;
                        inner.supervisor = None;
                        Some(true)
                    } else {
                        inner.state = SessionState::Errored {
                            cause: cause.clone(),
                        };
                        inner.supervisor = None;
                        Some(false)
                    }
                };

                match action {
                    Some(true) => {
                        warn!(
                            "Session {} encoder crashed ({}), restarting",
                            self.id, cause
                        );
                        self.relaunch_after_crash(epoch).await;
                    }
                    Some(false) => {
                        warn!(
                            "Session {} exhausted restart budget, errored: {}",
                            self.id, cause
                        );
                        self.store.shutdown(&format!("encoder failed: {cause}"));
                        self.quota.cancel_reservation(self.id);
                    }
                    None => {}
                }
            }
            SupervisorState::Starting | SupervisorState::Running => {
                unreachable!("wait_terminal only returns terminal states")
            }
        }
    }

    /// Transition to `Stopped` after a failure mid-operation.
    fn finalize_stop(&self, reason: &str) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = SessionState::Stopped {
                reason: reason.to_string(),
            };
            inner.epoch += 1;
            inner.supervisor = None;
        }
        self.store.shutdown(reason);
        self.quota.cancel_reservation(self.id);
    }

    /// Remove the session's on-disk working area. Called by the registry
    /// after removal, once the session is terminal.
    pub(crate) fn remove_working_area(&self) {
        self.store.remove_working_area();
    }
}
