//! Encoder process supervision for one encode run.
//!
//! A supervisor owns the full lifecycle of exactly one external encoder
//! process: spawn, startup watch, output draining into the segment store,
//! boundary cutting by elapsed encoded time, and teardown. It never
//! restarts anything itself; crash recovery policy lives with the owning
//! session.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backend::{EncoderBackend, EncoderChild, EncoderEvent};
use super::invocation::EncoderInvocation;
use crate::config::EncoderConfig;
use crate::quota::QuotaError;
use crate::segment::{SegmentError, SegmentStore};

/// Number of encoder diagnostic lines kept for crash reports.
const STDERR_TAIL_LINES: usize = 16;

/// Why an encode run ended in `Crashed`.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CrashCause {
    #[error("Encoder spawn failed: {reason}")]
    SpawnFailed { reason: String },

    #[error("Encoder produced no output within {seconds}s of startup")]
    StartupTimeout { seconds: u64 },

    #[error("Encoder exited with {}: {stderr_tail}", format_exit(.code))]
    ExitFailure {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Failed writing encoder output: {reason}")]
    OutputIo { reason: String },
}

fn format_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

/// Why an encode run ended in `Killed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Explicit stop: seek, eviction, reap, or shutdown
    Requested,
    /// An active segment write breached the disk quota
    QuotaExceeded,
}

/// Encoder supervision state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    /// Process spawned, no output byte seen yet
    Starting,
    /// Output flowing into the segment store
    Running,
    /// Process encoded to end-of-source and exited cleanly
    Completed,
    /// Process failed; the owning session decides whether to restart
    Crashed { cause: CrashCause },
    /// Teardown path ran to completion
    Killed { kind: StopKind },
}

impl SupervisorState {
    /// Check whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorState::Completed
                | SupervisorState::Crashed { .. }
                | SupervisorState::Killed { .. }
        )
    }
}

/// Handle to one supervised encode run.
///
/// `stop` is safe from any task and blocks its caller no longer than the
/// configured grace period plus a reaping margin; the underlying kill
/// always runs to completion even if the caller stops waiting.
pub struct EncoderSupervisor {
    state_rx: watch::Receiver<SupervisorState>,
    stop_tx: watch::Sender<bool>,
    grace: Duration,
}

impl EncoderSupervisor {
    /// Spawn the encoder and the supervising task for one encode run.
    ///
    /// Segments appear in `store` under its current generation, starting
    /// at its current next index (zero for a fresh run, higher when
    /// resuming after a crash).
    pub fn start(
        backend: Arc<dyn EncoderBackend>,
        invocation: EncoderInvocation,
        store: Arc<SegmentStore>,
        config: &EncoderConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SupervisorState::Starting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = config.clone();
        let grace = config.stop_grace;

        tokio::spawn(async move {
            let terminal = run(backend, invocation, store, config, &state_tx, stop_rx).await;
            state_tx.send_replace(terminal);
        });

        Self {
            state_rx,
            stop_tx,
            grace,
        }
    }

    /// Current supervision state.
    pub fn state(&self) -> SupervisorState {
        self.state_rx.borrow().clone()
    }

    /// Wait until the run reaches a terminal state and return it.
    pub async fn wait_terminal(&self) -> SupervisorState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                // Supervising task is gone; its last word stands.
                return self.state_rx.borrow().clone();
            }
        }
    }

    /// Request teardown and wait for it, bounded by the grace period.
    ///
    /// The exclusive stop path: called on seek, quota eviction, idle reap,
    /// and registry shutdown. Idempotent; a completed or crashed run
    /// returns immediately.
    pub async fn stop(&self) {
        if self.state().is_terminal() {
            return;
        }

        self.stop_tx.send_replace(true);

        // The kill itself runs to completion in the supervising task; this
        // bound only limits how long the caller blocks on it.
        let bound = self.grace + Duration::from_secs(1);
        if tokio::time::timeout(bound, self.wait_terminal()).await.is_err() {
            error!("Supervisor did not reach terminal state within {:?}", bound);
        }
    }
}

/// Open segment being written by the drain loop.
struct OpenSegment {
    index: u32,
    file: tokio::fs::File,
    /// Encoded time at which this segment starts, relative to process start
    start_encoded: Duration,
    written: u64,
}

/// Cuts the encoder's output stream into store segments.
struct SegmentWriter {
    store: Arc<SegmentStore>,
    /// Absolute source offset the process started encoding from
    base_offset: Duration,
    segment_duration: Duration,
    current: Option<OpenSegment>,
    /// Encoded time already closed into segments, relative to process start
    closed_encoded: Duration,
    last_progress: Duration,
}

enum WriteFailure {
    Io(std::io::Error),
    Quota(QuotaError),
    StoreClosed,
}

impl SegmentWriter {
    fn new(store: Arc<SegmentStore>, base_offset: Duration, segment_duration: Duration) -> Self {
        Self {
            store,
            base_offset,
            segment_duration,
            current: None,
            closed_encoded: Duration::ZERO,
            last_progress: Duration::ZERO,
        }
    }

    /// Append output bytes, opening the next segment if none is active.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), WriteFailure> {
        if self.current.is_none() {
            let index = self.store.next_index();
            let start_abs = self.base_offset + self.closed_encoded;
            let path = self
                .store
                .open_segment(index, start_abs)
                .map_err(|e| match e {
                    SegmentError::Io { source, .. } => WriteFailure::Io(source),
                    _ => WriteFailure::StoreClosed,
                })?;
            let file = tokio::fs::File::create(&path)
                .await
                .map_err(WriteFailure::Io)?;
            self.current = Some(OpenSegment {
                index,
                file,
                start_encoded: self.closed_encoded,
                written: 0,
            });
        }

        let segment = self.current.as_mut().expect("opened above");
        segment.file.write_all(bytes).await.map_err(WriteFailure::Io)?;
        segment.written += bytes.len() as u64;
        Ok(())
    }

    /// Note encoder progress; close the active segment when its boundary
    /// in encoded time has been crossed.
    async fn advance(&mut self, encoded: Duration) -> Result<(), WriteFailure> {
        self.last_progress = self.last_progress.max(encoded);

        let boundary_crossed = self
            .current
            .as_ref()
            .is_some_and(|s| self.last_progress >= s.start_encoded + self.segment_duration);
        if boundary_crossed {
            self.close_current(self.segment_duration).await?;
        }
        Ok(())
    }

    /// Close the active segment with the given duration.
    async fn close_current(&mut self, duration: Duration) -> Result<(), WriteFailure> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };

        segment.file.flush().await.map_err(WriteFailure::Io)?;
        segment.file.sync_all().await.map_err(WriteFailure::Io)?;
        drop(segment.file);

        self.closed_encoded = segment.start_encoded + duration;
        self.store
            .close_segment(segment.index, duration, segment.written)
            .map_err(WriteFailure::Quota)
    }

    /// Close out the final partial segment after a clean exit.
    async fn finish(&mut self) -> Result<(), WriteFailure> {
        let Some(segment) = self.current.as_ref() else {
            return Ok(());
        };

        if segment.written == 0 {
            let index = segment.index;
            self.current = None;
            self.store.abandon_segment(index);
            return Ok(());
        }

        let elapsed = self
            .last_progress
            .saturating_sub(segment.start_encoded)
            .max(Duration::from_millis(1));
        let duration = elapsed.min(self.segment_duration);
        self.close_current(duration).await
    }

    /// Drop the partial segment on crash or kill.
    fn abandon(&mut self) {
        if let Some(segment) = self.current.take() {
            self.store.abandon_segment(segment.index);
        }
    }
}

/// The supervising task body; returns the terminal state.
async fn run(
    backend: Arc<dyn EncoderBackend>,
    invocation: EncoderInvocation,
    store: Arc<SegmentStore>,
    config: EncoderConfig,
    state_tx: &watch::Sender<SupervisorState>,
    mut stop_rx: watch::Receiver<bool>,
) -> SupervisorState {
    let mut child = match backend.spawn(&invocation).await {
        Ok(child) => child,
        Err(e) => {
            warn!("Encoder spawn failed: {}", e);
            return SupervisorState::Crashed {
                cause: CrashCause::SpawnFailed {
                    reason: e.to_string(),
                },
            };
        }
    };

    let mut writer = SegmentWriter::new(
        Arc::clone(&store),
        invocation.start_offset,
        invocation.profile.segment_duration,
    );
    let mut stderr_tail: Vec<String> = Vec::new();
    let mut running = false;
    let startup_deadline = Instant::now() + config.startup_timeout;

    debug!(
        "Supervising encoder run from offset {:?} ({:?} to encode)",
        invocation.start_offset, invocation.encode_duration
    );

    loop {
        // Throttle gate: stop draining while enough ready segments sit
        // unserved, so disk use tracks playback instead of encode speed.
        if running && store.unserved_ready() >= config.throttle_window {
            let mut store_rx = store.subscribe();
            loop {
                if store.unserved_ready() < config.throttle_window {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => {
                        child.stop(config.stop_grace).await;
                        writer.abandon();
                        return SupervisorState::Killed {
                            kind: StopKind::Requested,
                        };
                    }
                    changed = store_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = stop_rx.changed() => {
                child.stop(config.stop_grace).await;
                writer.abandon();
                return SupervisorState::Killed {
                    kind: StopKind::Requested,
                };
            }
            _ = tokio::time::sleep_until(startup_deadline), if !running => {
                warn!(
                    "Encoder produced no output within {:?}, giving up on startup",
                    config.startup_timeout
                );
                child.stop(config.stop_grace).await;
                writer.abandon();
                return SupervisorState::Crashed {
                    cause: CrashCause::StartupTimeout {
                        seconds: config.startup_timeout.as_secs(),
                    },
                };
            }
            event = child.next_event() => {
                match event {
                    Some(EncoderEvent::Output(bytes)) => {
                        if !running {
                            running = true;
                            state_tx.send_replace(SupervisorState::Running);
                        }
                        if let Err(failure) = writer.write(&bytes).await {
                            return fail_run(&mut child, &mut writer, &config, failure).await;
                        }
                    }
                    Some(EncoderEvent::Progress(encoded)) => {
                        if let Err(failure) = writer.advance(encoded).await {
                            return fail_run(&mut child, &mut writer, &config, failure).await;
                        }
                    }
                    Some(EncoderEvent::Log(line)) => {
                        debug!("encoder: {}", line);
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.remove(0);
                        }
                        stderr_tail.push(line);
                    }
                    Some(EncoderEvent::Exited { code: Some(0) }) => {
                        if let Err(failure) = writer.finish().await {
                            return fail_run(&mut child, &mut writer, &config, failure).await;
                        }
                        store.finish_run();
                        info!("Encoder run completed cleanly");
                        return SupervisorState::Completed;
                    }
                    Some(EncoderEvent::Exited { code }) => {
                        writer.abandon();
                        warn!(
                            "Encoder exited unexpectedly ({})",
                            format_exit(&code)
                        );
                        return SupervisorState::Crashed {
                            cause: CrashCause::ExitFailure {
                                code,
                                stderr_tail: stderr_tail.join("\n"),
                            },
                        };
                    }
                    None => {
                        // Event stream ended without an exit notification.
                        writer.abandon();
                        return SupervisorState::Crashed {
                            cause: CrashCause::ExitFailure {
                                code: None,
                                stderr_tail: stderr_tail.join("\n"),
                            },
                        };
                    }
                }
            }
        }
    }
}

/// Tear down after a write failure and map it to a terminal state.
async fn fail_run(
    child: &mut Box<dyn EncoderChild>,
    writer: &mut SegmentWriter,
    config: &EncoderConfig,
    failure: WriteFailure,
) -> SupervisorState {
    child.stop(config.stop_grace).await;
    writer.abandon();

    match failure {
        WriteFailure::Quota(e) => {
            warn!("Encode run stopped by disk quota: {}", e);
            SupervisorState::Killed {
                kind: StopKind::QuotaExceeded,
            }
        }
        WriteFailure::Io(e) => SupervisorState::Crashed {
            cause: CrashCause::OutputIo {
                reason: e.to_string(),
            },
        },
        WriteFailure::StoreClosed => SupervisorState::Killed {
            kind: StopKind::Requested,
        },
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::QuotaConfig;
    use crate::encoder::backend::SimulationBackend;
    use crate::media::{ContainerFormat, MediaSource, SourceId};
    use crate::profile::{ClientCapabilities, resolve_profile};
    use crate::quota::DiskQuotaManager;
    use crate::session::SessionId;

    struct Fixture {
        store: Arc<SegmentStore>,
        config: EncoderConfig,
        source: MediaSource,
        _dir: tempfile::TempDir,
    }

    fn fixture(duration_secs: u64, quota_bytes: u64) -> Fixture {
        let dir = tempdir().unwrap();
        let quota = Arc::new(DiskQuotaManager::new(&QuotaConfig {
            capacity_bytes: quota_bytes,
            run_reservation_bytes: 0,
        }));
        let store = Arc::new(SegmentStore::new(
            SessionId::new(),
            dir.path(),
            "ts",
            quota,
        ));
        let source = MediaSource {
            id: SourceId::new(),
            path: std::path::PathBuf::from("/media/test.mkv"),
            duration: Duration::from_secs(duration_secs),
            container: ContainerFormat::Mkv,
            video: None,
            audio: None,
        };
        let config = EncoderConfig {
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(50),
            segment_duration: Duration::from_secs(6),
            throttle_window: 1000,
            ..Default::default()
        };
        Fixture {
            store,
            config,
            source,
            _dir: dir,
        }
    }

    fn invocation(fixture: &Fixture, offset: Duration) -> EncoderInvocation {
        let profile = resolve_profile(
            &fixture.source,
            &ClientCapabilities::default(),
            fixture.config.segment_duration,
        );
        EncoderInvocation::to_end_of_source(&fixture.source, profile, offset)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_and_produces_ordered_segments() {
        let fixture = fixture(30, 1 << 30);
        let generation = fixture.store.begin_run(Duration::ZERO, None).unwrap();

        let supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new()),
            invocation(&fixture, Duration::ZERO),
            Arc::clone(&fixture.store),
            &fixture.config,
        );

        assert_eq!(supervisor.wait_terminal().await, SupervisorState::Completed);

        // 30 seconds at 6-second boundaries: five segments, in order.
        let snapshot = fixture.store.snapshot(Some(generation)).unwrap();
        assert_eq!(snapshot.entries.len(), 5);
        assert!(snapshot.ended);
        for (i, entry) in snapshot.entries.iter().enumerate() {
            assert_eq!(entry.index, i as u32);
            assert!(entry.ready);
            assert_eq!(entry.start, Duration::from_secs(6 * i as u64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_segment_ready_within_wait_bound() {
        let fixture = fixture(3600, 1 << 30);
        let generation = fixture.store.begin_run(Duration::ZERO, None).unwrap();

        let _supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new()),
            invocation(&fixture, Duration::ZERO),
            Arc::clone(&fixture.store),
            &fixture.config,
        );

        let segment = fixture
            .store
            .await_segment(generation, 0, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(segment.start, Duration::ZERO);
        assert!(segment.duration <= Duration::from_secs(6));
        assert!(segment.byte_len > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_carry_absolute_start_times_after_offset() {
        let fixture = fixture(3600, 1 << 30);
        let offset = Duration::from_secs_f64(997.4);
        let generation = fixture.store.begin_run(offset, None).unwrap();

        let _supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new()),
            invocation(&fixture, offset),
            Arc::clone(&fixture.store),
            &fixture.config,
        );

        let segment = fixture
            .store
            .await_segment(generation, 0, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(segment.start, offset);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_surfaces_exit_code() {
        let fixture = fixture(3600, 1 << 30);
        fixture.store.begin_run(Duration::ZERO, None).unwrap();

        let supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new().crashing_at(Duration::from_secs(9), 137)),
            invocation(&fixture, Duration::ZERO),
            Arc::clone(&fixture.store),
            &fixture.config,
        );

        match supervisor.wait_terminal().await {
            SupervisorState::Crashed {
                cause: CrashCause::ExitFailure { code, .. },
            } => assert_eq!(code, Some(137)),
            other => panic!("expected crash, got {other:?}"),
        }

        // The completed first segment survives; the partial tail does not.
        assert_eq!(fixture.store.next_index(), 1);
        assert_eq!(fixture.store.resume_offset(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_crashes() {
        let fixture = fixture(3600, 1 << 30);
        fixture.store.begin_run(Duration::ZERO, None).unwrap();

        let mut config = fixture.config.clone();
        config.startup_timeout = Duration::from_millis(100);

        let supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new().with_startup_delay(Duration::from_secs(60))),
            invocation(&fixture, Duration::ZERO),
            Arc::clone(&fixture.store),
            &config,
        );

        match supervisor.wait_terminal().await {
            SupervisorState::Crashed {
                cause: CrashCause::StartupTimeout { .. },
            } => {}
            other => panic!("expected startup timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_kills_and_is_idempotent() {
        let fixture = fixture(3600, 1 << 30);
        fixture.store.begin_run(Duration::ZERO, None).unwrap();

        let supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new()),
            invocation(&fixture, Duration::ZERO),
            Arc::clone(&fixture.store),
            &fixture.config,
        );

        supervisor.stop().await;
        assert_eq!(
            supervisor.state(),
            SupervisorState::Killed {
                kind: StopKind::Requested
            }
        );

        // Stopping again is a no-op.
        supervisor.stop().await;
        assert_eq!(
            supervisor.state(),
            SupervisorState::Killed {
                kind: StopKind::Requested
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_breach_stops_run() {
        // Tiny quota: the first segment close breaches it.
        let fixture = fixture(3600, 1000);
        fixture.store.begin_run(Duration::ZERO, None).unwrap();

        let supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new()),
            invocation(&fixture, Duration::ZERO),
            Arc::clone(&fixture.store),
            &fixture.config,
        );

        assert_eq!(
            supervisor.wait_terminal().await,
            SupervisorState::Killed {
                kind: StopKind::QuotaExceeded
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_pauses_until_segments_are_served() {
        let fixture = fixture(3600, 1 << 30);
        let generation = fixture.store.begin_run(Duration::ZERO, None).unwrap();

        let mut config = fixture.config.clone();
        config.throttle_window = 2;

        let _supervisor = EncoderSupervisor::start(
            Arc::new(SimulationBackend::new()),
            invocation(&fixture, Duration::ZERO),
            Arc::clone(&fixture.store),
            &config,
        );

        // Wait for the window to fill, then give the drain loop time to
        // run further if it (incorrectly) wanted to. At 60x simulation
        // speed an unthrottled encoder would produce dozens of segments
        // in this span.
        fixture
            .store
            .await_segment(generation, 1, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let produced = fixture.store.next_index();
        assert!(
            produced <= 6,
            "throttle window 2 but {produced} segments were produced"
        );

        // Serving segments one by one reopens the window each time.
        for index in 2..=5 {
            fixture
                .store
                .await_segment(generation, index, Duration::from_secs(10))
                .await
                .unwrap();
        }
    }
}
