//! Encoder process abstraction for both production and simulation modes.
//!
//! The external encoder is opaque: the pipeline only ever sees a spawned
//! child that yields output bytes, encoded-time progress reports, and an
//! exit status. `FfmpegBackend` drives a real binary; `SimulationBackend`
//! emits synthetic segment boundaries on a controlled clock so nothing in
//! the test suite depends on an encoding binary being installed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use super::invocation::EncoderInvocation;
use crate::config::EncoderConfig;

/// Errors from spawning an encoder process.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EncoderError {
    #[error("Encoder binary not found: {name}")]
    BinaryNotFound { name: String },

    #[error("Encoder spawn failed: {reason}")]
    SpawnFailed { reason: String },
}

/// One observation from a running encoder child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    /// Media bytes from the encoder's output stream
    Output(Bytes),
    /// Elapsed encoded time reported by the encoder
    Progress(Duration),
    /// Diagnostic line from the encoder; retained for crash reports
    Log(String),
    /// Process ended; `None` means it died to a signal
    Exited { code: Option<i32> },
}

/// Capability for launching encoder processes.
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    /// Spawn a child for the invocation.
    ///
    /// # Errors
    /// - `EncoderError::SpawnFailed` - Process could not be started
    async fn spawn(
        &self,
        invocation: &EncoderInvocation,
    ) -> Result<Box<dyn EncoderChild>, EncoderError>;
}

/// A spawned encoder process owned by exactly one supervisor.
#[async_trait]
pub trait EncoderChild: Send {
    /// Next observation, or `None` once `Exited` has been delivered.
    async fn next_event(&mut self) -> Option<EncoderEvent>;

    /// Ask the child to terminate: graceful first, forced after `grace`.
    ///
    /// Always runs to completion; the process is gone when this returns.
    async fn stop(&mut self, grace: Duration);
}

/// Production backend driving the external `ffmpeg` binary.
pub struct FfmpegBackend {
    binary_path: PathBuf,
}

impl FfmpegBackend {
    /// Create new backend, resolving the binary from config or PATH.
    ///
    /// # Errors
    /// - `EncoderError::BinaryNotFound` - No usable encoder binary
    pub fn new(config: &EncoderConfig) -> Result<Self, EncoderError> {
        let binary_path = match &config.binary_path {
            Some(path) => path.clone(),
            None => which::which("ffmpeg").map_err(|_| EncoderError::BinaryNotFound {
                name: "ffmpeg".to_string(),
            })?,
        };
        Ok(Self { binary_path })
    }
}

#[async_trait]
impl EncoderBackend for FfmpegBackend {
    async fn spawn(
        &self,
        invocation: &EncoderInvocation,
    ) -> Result<Box<dyn EncoderChild>, EncoderError> {
        let mut cmd = tokio::process::Command::new(&self.binary_path);
        cmd.args(invocation.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning encoder: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| EncoderError::SpawnFailed {
            reason: format!("failed to spawn {}: {e}", self.binary_path.display()),
        })?;

        let (stdout, stderr, stdin) = match (
            child.stdout.take(),
            child.stderr.take(),
            child.stdin.take(),
        ) {
            (Some(stdout), Some(stderr), Some(stdin)) => (stdout, stderr, stdin),
            _ => {
                return Err(EncoderError::SpawnFailed {
                    reason: "encoder process pipes unavailable".to_string(),
                });
            }
        };

        Ok(Box::new(FfmpegChild {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(BufReader::new(stderr).lines()),
            exit_delivered: false,
        }))
    }
}

/// Running ffmpeg process with its output and progress pipes.
struct FfmpegChild {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    exit_delivered: bool,
}

/// Read one output chunk; pends forever once the stream is gone.
async fn read_output_chunk(stdout: &mut Option<ChildStdout>) -> std::io::Result<Bytes> {
    match stdout {
        Some(stream) => {
            let mut buf = BytesMut::with_capacity(16 * 1024);
            stream.read_buf(&mut buf).await?;
            Ok(buf.freeze())
        }
        None => std::future::pending().await,
    }
}

/// Read one stderr line; pends forever once the stream is gone.
async fn read_stderr_line(
    stderr: &mut Option<Lines<BufReader<ChildStderr>>>,
) -> std::io::Result<Option<String>> {
    match stderr {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Parse one `-progress` report line into elapsed encoded time.
///
/// The report is `key=value` per line; `out_time_us` carries microseconds
/// and `out_time` the clock form, depending on encoder version.
fn parse_progress_line(line: &str) -> Option<Duration> {
    let (key, value) = line.split_once('=')?;
    match key.trim() {
        "out_time_us" => {
            let micros: i64 = value.trim().parse().ok()?;
            (micros >= 0).then(|| Duration::from_micros(micros as u64))
        }
        "out_time" => parse_clock_time(value.trim()),
        _ => None,
    }
}

/// Parse encoder clock time format (HH:MM:SS.micros).
fn parse_clock_time(time_str: &str) -> Option<Duration> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    if seconds < 0.0 {
        return None;
    }

    let whole = hours * 3600 + minutes * 60;
    Some(Duration::from_secs(whole) + Duration::from_secs_f64(seconds))
}

#[async_trait]
impl EncoderChild for FfmpegChild {
    async fn next_event(&mut self) -> Option<EncoderEvent> {
        loop {
            if self.exit_delivered {
                return None;
            }

            // Both pipes drained: all that remains is the exit status.
            if self.stdout.is_none() && self.stderr.is_none() {
                let code = match self.child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!("Failed to reap encoder process: {}", e);
                        None
                    }
                };
                self.exit_delivered = true;
                return Some(EncoderEvent::Exited { code });
            }

            tokio::select! {
                chunk = read_output_chunk(&mut self.stdout) => match chunk {
                    Ok(bytes) if bytes.is_empty() => {
                        self.stdout = None;
                    }
                    Ok(bytes) => return Some(EncoderEvent::Output(bytes)),
                    Err(e) => {
                        warn!("Encoder stdout read failed: {}", e);
                        self.stdout = None;
                    }
                },
                line = read_stderr_line(&mut self.stderr) => match line {
                    Ok(Some(line)) => {
                        if let Some(encoded) = parse_progress_line(&line) {
                            return Some(EncoderEvent::Progress(encoded));
                        }
                        if !line.trim().is_empty() && !line.contains('=') {
                            return Some(EncoderEvent::Log(line));
                        }
                    }
                    Ok(None) | Err(_) => {
                        self.stderr = None;
                    }
                },
            }
        }
    }

    async fn stop(&mut self, grace: Duration) {
        // Graceful quit request on the command pipe first.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Encoder exited after graceful stop: {}", status);
            }
            Ok(Err(e)) => {
                warn!("Failed to await encoder after graceful stop: {}", e);
            }
            Err(_) => {
                warn!("Encoder ignored graceful stop for {:?}, killing", grace);
                if let Err(e) = self.child.start_kill() {
                    warn!("Failed to kill encoder process: {}", e);
                }
                let _ = self.child.wait().await;
            }
        }
        self.exit_delivered = true;
    }
}

/// Scripted crash behavior for the simulation backend.
#[derive(Debug, Clone, Copy)]
struct CrashScript {
    /// Encoded time at which scripted children exit
    at: Duration,
    code: i32,
}

/// Simulation backend emitting synthetic encoder behavior.
///
/// Progress advances on a controlled clock at a configurable multiple of
/// real time, producing deterministic segment boundaries without any
/// external process. Crashes and spawn failures are scriptable.
pub struct SimulationBackend {
    /// Encoded seconds advanced per wall-clock second
    speed: f64,
    /// Wall-clock interval between emitted events
    tick: Duration,
    /// Output bytes produced per encoded second
    bytes_per_encoded_second: u64,
    startup_delay: Duration,
    crash: Option<CrashScript>,
    crashes_remaining: Arc<AtomicU32>,
    fail_spawn: bool,
}

impl SimulationBackend {
    /// Create new backend running at 60x real time.
    pub fn new() -> Self {
        Self {
            speed: 60.0,
            tick: Duration::from_millis(5),
            bytes_per_encoded_second: 64 * 1024,
            startup_delay: Duration::ZERO,
            crash: None,
            crashes_remaining: Arc::new(AtomicU32::new(0)),
            fail_spawn: false,
        }
    }

    /// Configure encoded-seconds-per-wall-second speed.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Delay the first output byte, for startup timeout testing.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Crash every spawned child at `at` encoded time with `code`.
    pub fn crashing_at(mut self, at: Duration, code: i32) -> Self {
        self.crash = Some(CrashScript { at, code });
        self.crashes_remaining = Arc::new(AtomicU32::new(u32::MAX));
        self
    }

    /// Crash only the first `runs` children, then spawn clean ones.
    pub fn crashing_first_runs(mut self, runs: u32, at: Duration, code: i32) -> Self {
        self.crash = Some(CrashScript { at, code });
        self.crashes_remaining = Arc::new(AtomicU32::new(runs));
        self
    }

    /// Make every spawn attempt fail.
    pub fn failing_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }
}

impl Default for SimulationBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncoderBackend for SimulationBackend {
    async fn spawn(
        &self,
        invocation: &EncoderInvocation,
    ) -> Result<Box<dyn EncoderChild>, EncoderError> {
        if self.fail_spawn {
            return Err(EncoderError::SpawnFailed {
                reason: "simulated spawn failure".to_string(),
            });
        }

        let crash = self.crash.filter(|_| {
            self.crashes_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        });

        Ok(Box::new(SimulationChild {
            encode_duration: invocation.encode_duration,
            step: Duration::from_secs_f64(self.tick.as_secs_f64() * self.speed),
            tick: self.tick,
            bytes_per_encoded_second: self.bytes_per_encoded_second,
            startup_delay: Some(self.startup_delay),
            crash_at: crash.map(|c| (c.at, c.code)),
            encoded: Duration::ZERO,
            pending: VecDeque::new(),
            exited: false,
            killed: false,
        }))
    }
}

/// Synthetic encoder child advancing encoded time on the tokio clock.
struct SimulationChild {
    encode_duration: Duration,
    step: Duration,
    tick: Duration,
    bytes_per_encoded_second: u64,
    startup_delay: Option<Duration>,
    crash_at: Option<(Duration, i32)>,
    encoded: Duration,
    pending: VecDeque<EncoderEvent>,
    exited: bool,
    killed: bool,
}

impl SimulationChild {
    fn output_chunk(&self, encoded_step: Duration) -> Bytes {
        let len = (self.bytes_per_encoded_second as f64 * encoded_step.as_secs_f64()) as usize;
        Bytes::from(vec![0x47u8; len.max(188)])
    }
}

#[async_trait]
impl EncoderChild for SimulationChild {
    async fn next_event(&mut self) -> Option<EncoderEvent> {
        if self.exited {
            return None;
        }

        if let Some(event) = self.pending.pop_front() {
            if matches!(event, EncoderEvent::Exited { .. }) {
                self.exited = true;
            }
            return Some(event);
        }

        if self.killed {
            self.exited = true;
            return Some(EncoderEvent::Exited { code: None });
        }

        if let Some(delay) = self.startup_delay.take() {
            tokio::time::sleep(delay).await;
        }
        tokio::time::sleep(self.tick).await;

        if let Some((crash_at, code)) = self.crash_at {
            if self.encoded >= crash_at {
                self.exited = true;
                return Some(EncoderEvent::Exited { code: Some(code) });
            }
        }

        if self.encoded >= self.encode_duration {
            self.exited = true;
            return Some(EncoderEvent::Exited { code: Some(0) });
        }

        let step = self.step.min(self.encode_duration - self.encoded);
        self.encoded += step;
        self.pending
            .push_back(EncoderEvent::Progress(self.encoded));
        Some(EncoderEvent::Output(self.output_chunk(step)))
    }

    async fn stop(&mut self, _grace: Duration) {
        self.killed = true;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ContainerFormat, MediaSource, SourceId};
    use crate::profile::{ClientCapabilities, resolve_profile};

    fn invocation(duration_secs: u64, offset_secs: u64) -> EncoderInvocation {
        let source = MediaSource {
            id: SourceId::new(),
            path: PathBuf::from("/media/test.mkv"),
            duration: Duration::from_secs(duration_secs),
            container: ContainerFormat::Mkv,
            video: None,
            audio: None,
        };
        let profile = resolve_profile(
            &source,
            &ClientCapabilities::default(),
            Duration::from_secs(6),
        );
        EncoderInvocation::to_end_of_source(&source, profile, Duration::from_secs(offset_secs))
    }

    #[test]
    fn test_parse_progress_line_microseconds() {
        assert_eq!(
            parse_progress_line("out_time_us=5120000"),
            Some(Duration::from_micros(5_120_000))
        );
        assert_eq!(parse_progress_line("out_time_us=-9223372036854775808"), None);
        assert_eq!(parse_progress_line("frame=123"), None);
        assert_eq!(parse_progress_line("not a progress line"), None);
    }

    #[test]
    fn test_parse_clock_time() {
        assert_eq!(
            parse_clock_time("00:01:30.500000"),
            Some(Duration::from_millis(90_500))
        );
        assert_eq!(parse_clock_time("invalid"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_child_runs_to_completion() {
        let backend = SimulationBackend::new().with_speed(60.0);
        let mut child = backend.spawn(&invocation(30, 0)).await.unwrap();

        let mut last_progress = Duration::ZERO;
        let mut saw_output = false;
        loop {
            match child.next_event().await.expect("stream ended early") {
                EncoderEvent::Output(bytes) => {
                    saw_output = true;
                    assert!(!bytes.is_empty());
                }
                EncoderEvent::Progress(t) => {
                    assert!(t >= last_progress);
                    last_progress = t;
                }
                EncoderEvent::Log(_) => {}
                EncoderEvent::Exited { code } => {
                    assert_eq!(code, Some(0));
                    break;
                }
            }
        }

        assert!(saw_output);
        assert_eq!(last_progress, Duration::from_secs(30));
        assert!(child.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_child_scripted_crash() {
        let backend = SimulationBackend::new().crashing_at(Duration::from_secs(10), 137);
        let mut child = backend.spawn(&invocation(3600, 0)).await.unwrap();

        loop {
            match child.next_event().await.expect("stream ended early") {
                EncoderEvent::Exited { code } => {
                    assert_eq!(code, Some(137));
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_crash_budget_is_per_spawn() {
        let backend = SimulationBackend::new().crashing_first_runs(1, Duration::from_secs(5), 1);

        let mut first = backend.spawn(&invocation(20, 0)).await.unwrap();
        let code = loop {
            if let EncoderEvent::Exited { code } = first.next_event().await.unwrap() {
                break code;
            }
        };
        assert_eq!(code, Some(1));

        let mut second = backend.spawn(&invocation(20, 0)).await.unwrap();
        let code = loop {
            if let EncoderEvent::Exited { code } = second.next_event().await.unwrap() {
                break code;
            }
        };
        assert_eq!(code, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_stop_reports_signal_death() {
        let backend = SimulationBackend::new();
        let mut child = backend.spawn(&invocation(3600, 0)).await.unwrap();

        child.next_event().await.unwrap();
        child.stop(Duration::from_millis(100)).await;

        assert_eq!(
            child.next_event().await,
            Some(EncoderEvent::Exited { code: None })
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let backend = SimulationBackend::new().failing_spawn();
        let result = backend.spawn(&invocation(10, 0)).await;
        assert!(matches!(
            result,
            Err(EncoderError::SpawnFailed { .. })
        ));
    }
}
