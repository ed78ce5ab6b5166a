//! Segment bookkeeping and wait-for-readiness signaling.
//!
//! Each session owns one `SegmentStore`. The encoder supervisor is the only
//! writer; HTTP tasks are readers that may block briefly on segments still
//! being produced. Readiness is signaled through a version channel rather
//! than polling. Segment indices restart at 0 for every encode run, and a
//! run is identified by its generation: waiters on a superseded generation
//! are released with `SegmentUnavailable` instead of hanging.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::quota::{DiskQuotaManager, QuotaError};
use crate::session::SessionId;

/// Segment-index epoch produced by one continuous encode run.
pub type Generation = u64;

/// Errors surfaced to segment readers.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    /// The current run will never produce this segment: run ended short,
    /// generation superseded, or session torn down.
    #[error("Segment {index} unavailable: {reason}")]
    SegmentUnavailable { index: u32, reason: String },

    /// Bounded wait elapsed while the segment was still in production.
    /// Retryable: the caller may poll again.
    #[error("Timed out waiting for segment {index} after {waited:?}")]
    Timeout { index: u32, waited: Duration },

    /// Request addressed an encode run that a seek has superseded.
    #[error("Stale generation: requested {requested}, active {active}")]
    StaleGeneration {
        requested: Generation,
        active: Generation,
    },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle of one segment within its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Slot allocated, no bytes yet
    Pending,
    /// Encoder output is being appended
    Writing,
    /// Complete and immutable; servable
    Ready,
    /// Reclaimed by the quota manager
    Discarded,
}

/// Immutable snapshot of a ready segment, as handed to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub generation: Generation,
    /// Presentation time of the segment's first frame
    pub start: Duration,
    pub duration: Duration,
    pub byte_len: u64,
    pub path: PathBuf,
}

/// One entry in a manifest rendering of the active run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub index: u32,
    pub start: Duration,
    pub duration: Duration,
    pub ready: bool,
}

/// Snapshot of the active run for manifest rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub generation: Generation,
    pub start_offset: Duration,
    pub entries: Vec<ManifestEntry>,
    /// True once the run has produced its final segment
    pub ended: bool,
}

#[derive(Debug)]
struct Slot {
    state: SegmentState,
    start: Duration,
    duration: Duration,
    byte_len: u64,
    path: PathBuf,
}

#[derive(Debug)]
struct StoreState {
    generation: Generation,
    start_offset: Duration,
    /// Upper bound on indices this run can produce, when known
    expected_segments: Option<u32>,
    slots: Vec<Slot>,
    /// No further segments will be opened in this run
    finished: bool,
    /// Set when the store is torn down for good
    closed_reason: Option<String>,
    /// Highest index handed to a reader this run
    last_served: Option<u32>,
    /// Bytes committed to quota for this run's segments
    run_used_bytes: u64,
}

/// Per-session segment tracking with blocking-wait semantics.
///
/// All locking is a plain mutex taken per operation; waiting happens on the
/// version channel outside the lock, so a blocked reader never stalls the
/// supervisor or other readers.
pub struct SegmentStore {
    session_id: SessionId,
    root: PathBuf,
    extension: &'static str,
    quota: Arc<DiskQuotaManager>,
    state: Mutex<StoreState>,
    version: watch::Sender<u64>,
}

impl SegmentStore {
    /// Create new store rooted at `<workdir>/<session-id>`.
    pub fn new(
        session_id: SessionId,
        workdir: &std::path::Path,
        extension: &'static str,
        quota: Arc<DiskQuotaManager>,
    ) -> Self {
        let root = workdir.join(session_id.to_string());
        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!("Failed to create session working area {}: {}", root.display(), e);
        }

        let (version, _) = watch::channel(0);
        Self {
            session_id,
            root,
            extension,
            quota,
            state: Mutex::new(StoreState {
                generation: 0,
                start_offset: Duration::ZERO,
                expected_segments: None,
                slots: Vec::new(),
                finished: true,
                closed_reason: None,
                last_served: None,
                run_used_bytes: 0,
            }),
            version,
        }
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn run_dir(&self, generation: Generation) -> PathBuf {
        self.root.join(format!("gen-{generation}"))
    }

    /// Begin a fresh encode run, superseding the previous generation.
    ///
    /// Prior segments are logically invalidated immediately; their files
    /// and quota bytes are reclaimed here. Waiters on the old generation
    /// wake and observe the supersession.
    pub fn begin_run(
        &self,
        start_offset: Duration,
        expected_segments: Option<u32>,
    ) -> Result<Generation, SegmentError> {
        let generation = {
            let mut state = self.state.lock();

            if let Some(reason) = &state.closed_reason {
                return Err(SegmentError::SegmentUnavailable {
                    index: 0,
                    reason: reason.clone(),
                });
            }

            if state.run_used_bytes > 0 {
                self.quota.release(self.session_id, state.run_used_bytes);
            }
            let old_dir = self.run_dir(state.generation);
            if state.generation > 0 {
                if let Err(e) = std::fs::remove_dir_all(&old_dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "Failed to reclaim old run dir {}: {}",
                            old_dir.display(),
                            e
                        );
                    }
                }
            }

            state.generation += 1;
            state.start_offset = start_offset;
            state.expected_segments = expected_segments;
            state.slots.clear();
            state.finished = false;
            state.last_served = None;
            state.run_used_bytes = 0;
            state.generation
        };

        std::fs::create_dir_all(self.run_dir(generation)).map_err(|e| SegmentError::Io {
            operation: "create run directory".to_string(),
            source: e,
        })?;

        debug!(
            "Session {} began run generation {} at offset {:?}",
            self.session_id, generation, start_offset
        );
        self.bump_version();
        Ok(generation)
    }

    /// Resume the current run after a crash restart.
    ///
    /// Keeps the generation and all closed segments; only the partially
    /// written tail (if any) has been abandoned. Returns the offset the
    /// restarted encoder must start from.
    pub fn resume_offset(&self) -> Duration {
        let state = self.state.lock();
        let encoded: Duration = state
            .slots
            .iter()
            .filter(|s| s.state == SegmentState::Ready || s.state == SegmentState::Discarded)
            .map(|s| s.duration)
            .sum();
        state.start_offset + encoded
    }

    /// Index the next opened segment will take.
    pub fn next_index(&self) -> u32 {
        self.state.lock().slots.len() as u32
    }

    /// Allocate the next segment slot and return the path to write it to.
    ///
    /// Indices are contiguous from 0 within the run; `index` must be the
    /// next unallocated one.
    pub fn open_segment(&self, index: u32, start: Duration) -> Result<PathBuf, SegmentError> {
        let mut state = self.state.lock();

        if state.finished {
            return Err(SegmentError::SegmentUnavailable {
                index,
                reason: "encode run is not active".to_string(),
            });
        }
        debug_assert_eq!(index as usize, state.slots.len());

        let path = self
            .run_dir(state.generation)
            .join(format!("seg-{index:05}.{}", self.extension));
        state.slots.push(Slot {
            state: SegmentState::Writing,
            start,
            duration: Duration::ZERO,
            byte_len: 0,
            path: path.clone(),
        });
        Ok(path)
    }

    /// Close the writing segment as ready and account its bytes.
    ///
    /// Readiness is strictly in index order because the single supervisor
    /// task opens and closes segments sequentially.
    ///
    /// # Errors
    /// - `QuotaError::QuotaExceeded` - The bytes breach the disk cap; the
    ///   caller must stop the run
    pub fn close_segment(
        &self,
        index: u32,
        duration: Duration,
        byte_len: u64,
    ) -> Result<(), QuotaError> {
        self.quota.commit(self.session_id, byte_len)?;

        {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(index as usize) else {
                return Ok(());
            };
            slot.state = SegmentState::Ready;
            slot.duration = duration;
            slot.byte_len = byte_len;
            state.run_used_bytes += byte_len;
        }

        debug!(
            "Session {} segment {} ready ({} bytes, {:?})",
            self.session_id, index, byte_len, duration
        );
        self.bump_version();
        Ok(())
    }

    /// Drop a partially written segment after a crash.
    ///
    /// The slot is removed so the restarted encoder re-produces the same
    /// index; no quota was committed for it.
    pub fn abandon_segment(&self, index: u32) {
        let mut state = self.state.lock();
        if state.slots.len() == (index as usize) + 1
            && state.slots[index as usize].state == SegmentState::Writing
        {
            let slot = state.slots.pop().expect("checked length above");
            if let Err(e) = std::fs::remove_file(&slot.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove abandoned segment {}: {}", slot.path.display(), e);
                }
            }
        }
    }

    /// Mark the run complete: every segment it will ever produce is ready.
    pub fn finish_run(&self) {
        {
            let mut state = self.state.lock();
            state.finished = true;
            let produced = state.slots.len() as u32;
            state.expected_segments = Some(produced);
        }
        self.quota.cancel_reservation(self.session_id);
        self.bump_version();
    }

    /// Tear the store down for good, releasing every waiter.
    ///
    /// Subsequent and in-flight awaits fail with `SegmentUnavailable`
    /// carrying `reason`. Quota bytes are dropped by the registry when the
    /// session is removed.
    pub fn shutdown(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            state.finished = true;
            state.closed_reason = Some(reason.to_string());
        }
        self.bump_version();
    }

    /// Remove the session working area from disk. Called after shutdown.
    pub fn remove_working_area(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove session working area {}: {}",
                    self.root.display(),
                    e
                );
            }
        }
    }

    /// Wait for a segment to become ready, bounded by `timeout`.
    ///
    /// Returns immediately for ready segments. Never blocks other readers
    /// or the supervisor while waiting.
    ///
    /// # Errors
    /// - `SegmentError::StaleGeneration` - `generation` has been superseded
    /// - `SegmentError::SegmentUnavailable` - The run will never produce
    ///   this index, or the store was shut down
    /// - `SegmentError::Timeout` - Still pending after `timeout`; retryable
    pub async fn await_segment(
        &self,
        generation: Generation,
        index: u32,
        timeout: Duration,
    ) -> Result<Segment, SegmentError> {
        let deadline = Instant::now() + timeout;
        let mut version_rx = self.version.subscribe();

        loop {
            if let Some(result) = self.check_segment(generation, index) {
                return result;
            }

            match tokio::time::timeout_at(deadline, version_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(SegmentError::SegmentUnavailable {
                        index,
                        reason: "segment store dropped".to_string(),
                    });
                }
                Err(_) => {
                    return Err(SegmentError::Timeout {
                        index,
                        waited: timeout,
                    });
                }
            }
        }
    }

    /// Non-blocking readiness check; `None` means keep waiting.
    fn check_segment(
        &self,
        generation: Generation,
        index: u32,
    ) -> Option<Result<Segment, SegmentError>> {
        let mut state = self.state.lock();

        if let Some(reason) = &state.closed_reason {
            return Some(Err(SegmentError::SegmentUnavailable {
                index,
                reason: reason.clone(),
            }));
        }

        if generation != state.generation {
            // Requests made before the seek wake here too; both cases are a
            // superseded run from the reader's point of view.
            return Some(Err(if generation < state.generation {
                SegmentError::SegmentUnavailable {
                    index,
                    reason: format!(
                        "generation {generation} superseded by {}",
                        state.generation
                    ),
                }
            } else {
                SegmentError::StaleGeneration {
                    requested: generation,
                    active: state.generation,
                }
            }));
        }

        if let Some(expected) = state.expected_segments {
            if index >= expected {
                return Some(Err(SegmentError::SegmentUnavailable {
                    index,
                    reason: format!("run produces only {expected} segments"),
                }));
            }
        }

        match state.slots.get(index as usize) {
            Some(slot) if slot.state == SegmentState::Ready => {
                let segment = Segment {
                    index,
                    generation: state.generation,
                    start: slot.start,
                    duration: slot.duration,
                    byte_len: slot.byte_len,
                    path: slot.path.clone(),
                };
                state.last_served = Some(state.last_served.map_or(index, |s| s.max(index)));
                Some(Ok(segment))
            }
            Some(slot) if slot.state == SegmentState::Discarded => {
                Some(Err(SegmentError::SegmentUnavailable {
                    index,
                    reason: "segment was discarded".to_string(),
                }))
            }
            _ if state.finished => Some(Err(SegmentError::SegmentUnavailable {
                index,
                reason: "encode run ended before producing this segment".to_string(),
            })),
            _ => None,
        }
    }

    /// Discard a completed segment and return its bytes to the quota pool.
    ///
    /// Idempotent; pending and writing segments are never discarded.
    pub fn discard(&self, index: u32) {
        let freed = {
            let mut state = self.state.lock();
            match state.slots.get_mut(index as usize) {
                Some(slot) if slot.state == SegmentState::Ready => {
                    slot.state = SegmentState::Discarded;
                    if let Err(e) = std::fs::remove_file(&slot.path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(
                                "Failed to remove discarded segment {}: {}",
                                slot.path.display(),
                                e
                            );
                        }
                    }
                    let freed = slot.byte_len;
                    state.run_used_bytes = state.run_used_bytes.saturating_sub(freed);
                    freed
                }
                _ => 0,
            }
        };

        if freed > 0 {
            self.quota.release(self.session_id, freed);
            self.bump_version();
        }
    }

    /// Snapshot of the active run for manifest rendering.
    ///
    /// # Errors
    /// - `SegmentError::StaleGeneration` - `generation` is not the active one
    /// - `SegmentError::SegmentUnavailable` - Store has been shut down
    pub fn snapshot(&self, generation: Option<Generation>) -> Result<RunSnapshot, SegmentError> {
        let state = self.state.lock();

        if let Some(reason) = &state.closed_reason {
            return Err(SegmentError::SegmentUnavailable {
                index: 0,
                reason: reason.clone(),
            });
        }

        if let Some(requested) = generation {
            if requested != state.generation {
                return Err(SegmentError::StaleGeneration {
                    requested,
                    active: state.generation,
                });
            }
        }

        Ok(RunSnapshot {
            generation: state.generation,
            start_offset: state.start_offset,
            entries: state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.state != SegmentState::Discarded)
                .map(|(index, slot)| ManifestEntry {
                    index: index as u32,
                    start: slot.start,
                    duration: slot.duration,
                    ready: slot.state == SegmentState::Ready,
                })
                .collect(),
            ended: state.finished,
        })
    }

    /// Active generation number.
    pub fn generation(&self) -> Generation {
        self.state.lock().generation
    }

    /// Subscribe to store mutations. Fires on segment readiness, run
    /// changes, discards, and shutdown.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Ready segments not yet handed to any reader.
    ///
    /// The supervisor pauses draining when this exceeds the throttle
    /// window, bounding disk growth relative to playback consumption.
    pub fn unserved_ready(&self) -> u32 {
        let state = self.state.lock();
        let ready = state
            .slots
            .iter()
            .filter(|s| s.state == SegmentState::Ready)
            .count() as u32;
        match state.last_served {
            Some(served) => ready.saturating_sub(served + 1),
            None => ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::QuotaConfig;

    fn store_with_quota(capacity: u64) -> (SegmentStore, Arc<DiskQuotaManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let quota = Arc::new(DiskQuotaManager::new(&QuotaConfig {
            capacity_bytes: capacity,
            run_reservation_bytes: 0,
        }));
        let store = SegmentStore::new(SessionId::new(), dir.path(), "ts", Arc::clone(&quota));
        (store, quota, dir)
    }

    fn produce_segment(store: &SegmentStore, index: u32, bytes: u64) {
        let start = Duration::from_secs(u64::from(index) * 6);
        let path = store.open_segment(index, start).unwrap();
        std::fs::write(&path, vec![0u8; bytes as usize]).unwrap();
        store
            .close_segment(index, Duration::from_secs(6), bytes)
            .unwrap();
    }

    #[tokio::test]
    async fn test_ready_segment_returns_immediately() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();
        produce_segment(&store, 0, 1024);

        let segment = store
            .await_segment(generation, 0, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(segment.index, 0);
        assert_eq!(segment.start, Duration::ZERO);
        assert_eq!(segment.byte_len, 1024);
    }

    #[tokio::test]
    async fn test_waiter_wakes_when_segment_closes() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let store = Arc::new(store);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .await_segment(generation, 0, Duration::from_secs(5))
                    .await
            })
        };

        tokio::task::yield_now().await;
        produce_segment(&store, 0, 512);

        let segment = waiter.await.unwrap().unwrap();
        assert_eq!(segment.index, 0);
    }

    #[tokio::test]
    async fn test_pending_segment_times_out() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();

        let result = store
            .await_segment(generation, 0, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(SegmentError::Timeout { index: 0, .. })));
    }

    #[tokio::test]
    async fn test_new_run_releases_old_generation_waiters() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let store = Arc::new(store);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .await_segment(generation, 3, Duration::from_secs(5))
                    .await
            })
        };

        tokio::task::yield_now().await;
        store.begin_run(Duration::from_secs(60), None).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(
            result,
            Err(SegmentError::SegmentUnavailable { index: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_future_generation_is_stale_error() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();

        let result = store
            .await_segment(generation + 1, 0, Duration::from_millis(20))
            .await;
        assert!(matches!(
            result,
            Err(SegmentError::StaleGeneration { .. })
        ));
    }

    #[tokio::test]
    async fn test_index_beyond_run_end_is_unavailable() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let generation = store.begin_run(Duration::ZERO, Some(2)).unwrap();

        let result = store
            .await_segment(generation, 7, Duration::from_secs(5))
            .await;
        assert!(matches!(
            result,
            Err(SegmentError::SegmentUnavailable { index: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_finished_run_rejects_unproduced_indices() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();
        produce_segment(&store, 0, 256);
        store.finish_run();

        assert!(store
            .await_segment(generation, 0, Duration::from_secs(1))
            .await
            .is_ok());
        let result = store
            .await_segment(generation, 1, Duration::from_secs(1))
            .await;
        assert!(matches!(
            result,
            Err(SegmentError::SegmentUnavailable { index: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_quota_accounting_tracks_segment_bytes() {
        let (store, quota, _dir) = store_with_quota(1 << 20);
        store.begin_run(Duration::ZERO, None).unwrap();
        produce_segment(&store, 0, 1000);
        produce_segment(&store, 1, 500);

        assert_eq!(quota.usage().used_bytes, 1500);

        store.discard(0);
        assert_eq!(quota.usage().used_bytes, 500);
        // Discard is idempotent.
        store.discard(0);
        assert_eq!(quota.usage().used_bytes, 500);
    }

    #[tokio::test]
    async fn test_close_segment_over_quota_fails() {
        let (store, _quota, _dir) = store_with_quota(1000);
        store.begin_run(Duration::ZERO, None).unwrap();

        let path = store.open_segment(0, Duration::ZERO).unwrap();
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let result = store.close_segment(0, Duration::from_secs(6), 4096);
        assert!(matches!(result, Err(QuotaError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn test_new_run_reclaims_previous_bytes() {
        let (store, quota, _dir) = store_with_quota(1 << 20);
        store.begin_run(Duration::ZERO, None).unwrap();
        produce_segment(&store, 0, 2048);
        assert_eq!(quota.usage().used_bytes, 2048);

        store.begin_run(Duration::from_secs(100), None).unwrap();
        assert_eq!(quota.usage().used_bytes, 0);
        assert_eq!(store.next_index(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters_with_reason() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let store = Arc::new(store);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .await_segment(generation, 0, Duration::from_secs(5))
                    .await
            })
        };

        tokio::task::yield_now().await;
        store.shutdown("session stopped");

        match waiter.await.unwrap() {
            Err(SegmentError::SegmentUnavailable { reason, .. }) => {
                assert!(reason.contains("session stopped"));
            }
            other => panic!("expected SegmentUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_offset_after_partial_segment() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        store.begin_run(Duration::from_secs(30), None).unwrap();
        produce_segment(&store, 0, 100);
        produce_segment(&store, 1, 100);

        // Crash mid-segment 2: the partial tail is abandoned.
        store.open_segment(2, Duration::from_secs(42)).unwrap();
        store.abandon_segment(2);

        assert_eq!(store.resume_offset(), Duration::from_secs(42));
        assert_eq!(store.next_index(), 2);
    }

    #[tokio::test]
    async fn test_unserved_ready_counts_backlog() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let generation = store.begin_run(Duration::ZERO, None).unwrap();
        for i in 0..4 {
            produce_segment(&store, i, 64);
        }
        assert_eq!(store.unserved_ready(), 4);

        store
            .await_segment(generation, 1, Duration::from_millis(10))
            .await
            .unwrap();
        // Segments 0 and 1 count as consumed once index 1 was served.
        assert_eq!(store.unserved_ready(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_active_generation_only() {
        let (store, _quota, _dir) = store_with_quota(1 << 20);
        let first = store.begin_run(Duration::ZERO, None).unwrap();
        produce_segment(&store, 0, 64);

        let second = store.begin_run(Duration::from_secs(60), None).unwrap();
        store.open_segment(0, Duration::from_secs(60)).unwrap();

        let snapshot = store.snapshot(None).unwrap();
        assert_eq!(snapshot.generation, second);
        assert_eq!(snapshot.entries.len(), 1);
        assert!(!snapshot.entries[0].ready);
        assert_eq!(snapshot.start_offset, Duration::from_secs(60));

        assert!(matches!(
            store.snapshot(Some(first)),
            Err(SegmentError::StaleGeneration { .. })
        ));
    }
}
