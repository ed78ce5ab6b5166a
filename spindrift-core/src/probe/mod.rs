//! Keyframe probing for segment boundary alignment.
//!
//! A seek must restart the encoder on an independently decodable frame, so
//! the first output segment plays without earlier context. This module
//! builds a per-source index of keyframe timestamps through an external
//! probing capability and caches built indices. Probing is best effort: a
//! failed probe disables alignment, it never blocks playback.

pub mod ffprobe;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use ffprobe::FfprobeProber;

use crate::media::{MediaSource, SourceId};

/// Errors that can occur while scanning a source for keyframes.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Source unreadable: {path}: {reason}")]
    SourceUnreadable { path: String, reason: String },

    #[error("No keyframes detected in source")]
    NoKeyframes,

    #[error("Probe process failed: {reason}")]
    ProbeFailed { reason: String },

    #[error("Probe timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Probe binary not found: {name}")]
    BinaryNotFound { name: String },
}

/// Capability for scanning a media source's keyframe timestamps.
///
/// Implemented by the external prober in production and by a synthetic
/// prober in tests, so the pipeline never depends on a real binary there.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Scan the source once and return keyframe timestamps in stream order.
    ///
    /// The returned list may contain duplicates or be unsorted; the index
    /// normalizes it.
    ///
    /// # Errors
    /// - `ProbeError::SourceUnreadable` - Source cannot be opened
    /// - `ProbeError::ProbeFailed` - Prober exited unsuccessfully
    /// - `ProbeError::Timeout` - Scan exceeded the configured bound
    async fn keyframe_timestamps(&self, source: &MediaSource)
    -> Result<Vec<Duration>, ProbeError>;
}

/// Ordered keyframe timestamps for one media source.
///
/// Timestamps are ascending and strictly increasing after normalization.
/// Used only to compute exact restart offsets for seeks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyframeIndex {
    timestamps: Vec<Duration>,
}

impl KeyframeIndex {
    /// Scan the source and build a sorted, deduplicated index.
    ///
    /// # Errors
    /// - `ProbeError::NoKeyframes` - Scan succeeded but found nothing usable
    /// - Any error from the underlying `MediaProber`
    pub async fn build(
        prober: &dyn MediaProber,
        source: &MediaSource,
    ) -> Result<Self, ProbeError> {
        let mut timestamps = prober.keyframe_timestamps(source).await?;
        timestamps.sort_unstable();
        timestamps.dedup();

        if timestamps.is_empty() {
            return Err(ProbeError::NoKeyframes);
        }

        debug!(
            "Built keyframe index for {}: {} entries, first={:?}, last={:?}",
            source.id,
            timestamps.len(),
            timestamps.first(),
            timestamps.last()
        );

        Ok(Self { timestamps })
    }

    /// Build an index from already-known timestamps.
    ///
    /// Used by tests and by callers that carry probe metadata of their own.
    pub fn from_timestamps(mut timestamps: Vec<Duration>) -> Self {
        timestamps.sort_unstable();
        timestamps.dedup();
        Self { timestamps }
    }

    /// Greatest indexed timestamp at or before `t`, or the source start.
    ///
    /// This is the offset a seek uses to restart encoding so the first
    /// output segment begins on a decodable boundary.
    pub fn nearest_at_or_before(&self, t: Duration) -> Duration {
        match self.timestamps.partition_point(|&ts| ts <= t) {
            0 => Duration::ZERO,
            n => self.timestamps[n - 1],
        }
    }

    /// Number of indexed keyframes.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Check whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// All indexed timestamps in ascending order.
    pub fn timestamps(&self) -> &[Duration] {
        &self.timestamps
    }
}

/// LRU cache of built keyframe indices, keyed by source id.
///
/// Indices are immutable once built, so entries are shared as `Arc`s.
/// Builds serialize behind the cache lock; concurrent requests for the
/// same source get the first build's result instead of probing twice.
pub struct KeyframeCache {
    entries: Mutex<LruCache<SourceId, Arc<KeyframeIndex>>>,
}

impl KeyframeCache {
    /// Create new cache holding up to `capacity` built indices.
    pub fn new(capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(capacity).unwrap_or_else(|| NonZeroUsize::new(64).unwrap());
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Return the cached index for the source, building it on first use.
    ///
    /// # Errors
    /// Propagates `ProbeError` from the build; failed builds are not cached,
    /// so a transient probe failure retries on the next request.
    pub async fn get_or_build(
        &self,
        prober: &dyn MediaProber,
        source: &MediaSource,
    ) -> Result<Arc<KeyframeIndex>, ProbeError> {
        let mut entries = self.entries.lock().await;

        if let Some(index) = entries.get(&source.id) {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(KeyframeIndex::build(prober, source).await?);
        entries.put(source.id, Arc::clone(&index));
        Ok(index)
    }

    /// Drop a cached index, forcing a re-probe on next use.
    pub async fn invalidate(&self, source_id: SourceId) {
        let mut entries = self.entries.lock().await;
        if entries.pop(&source_id).is_some() {
            debug!("Invalidated keyframe index for {}", source_id);
        }
    }
}

/// Synthetic prober for tests and development mode.
///
/// Emits evenly spaced keyframes across the source duration, or an exact
/// timestamp list when one is supplied. Can be configured to fail so
/// callers' alignment fallback paths are testable.
pub struct SimulationProber {
    interval: Duration,
    fixed_timestamps: Option<Vec<Duration>>,
    fail_with: Option<ProbeError>,
}

impl SimulationProber {
    /// Create new prober emitting a keyframe every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            fixed_timestamps: None,
            fail_with: None,
        }
    }

    /// Use an exact timestamp list instead of the interval grid.
    pub fn with_timestamps(timestamps: Vec<Duration>) -> Self {
        Self {
            interval: Duration::from_secs(2),
            fixed_timestamps: Some(timestamps),
            fail_with: None,
        }
    }

    /// Make every scan fail with the given error.
    pub fn failing(error: ProbeError) -> Self {
        Self {
            interval: Duration::from_secs(2),
            fixed_timestamps: None,
            fail_with: Some(error),
        }
    }
}

#[async_trait]
impl MediaProber for SimulationProber {
    async fn keyframe_timestamps(
        &self,
        source: &MediaSource,
    ) -> Result<Vec<Duration>, ProbeError> {
        if let Some(error) = &self.fail_with {
            warn!("Simulated probe failure for {}: {}", source.id, error);
            return Err(error.clone());
        }

        if let Some(fixed) = &self.fixed_timestamps {
            return Ok(fixed.clone());
        }

        let mut timestamps = Vec::new();
        let mut t = Duration::ZERO;
        while t < source.duration {
            timestamps.push(t);
            t += self.interval;
        }
        Ok(timestamps)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proptest::prelude::*;

    use super::*;
    use crate::media::ContainerFormat;

    fn test_source(duration_secs: u64) -> MediaSource {
        MediaSource {
            id: SourceId::new(),
            path: PathBuf::from("/media/test.mkv"),
            duration: Duration::from_secs(duration_secs),
            container: ContainerFormat::Mkv,
            video: None,
            audio: None,
        }
    }

    #[tokio::test]
    async fn test_build_sorts_and_dedups() {
        let prober = SimulationProber::with_timestamps(vec![
            Duration::from_secs(4),
            Duration::from_secs(0),
            Duration::from_secs(4),
            Duration::from_secs(2),
        ]);
        let index = KeyframeIndex::build(&prober, &test_source(10)).await.unwrap();

        assert_eq!(
            index.timestamps(),
            &[
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn test_build_fails_without_keyframes() {
        let prober = SimulationProber::with_timestamps(vec![]);
        let result = KeyframeIndex::build(&prober, &test_source(10)).await;
        assert_eq!(result.unwrap_err(), ProbeError::NoKeyframes);
    }

    #[test]
    fn test_nearest_at_or_before() {
        let index = KeyframeIndex::from_timestamps(vec![
            Duration::from_secs_f64(0.0),
            Duration::from_secs_f64(997.4),
            Duration::from_secs_f64(1003.0),
        ]);

        // Seek to 1000s lands on the 997.4s keyframe, not 1000s.
        assert_eq!(
            index.nearest_at_or_before(Duration::from_secs(1000)),
            Duration::from_secs_f64(997.4)
        );
        // Exact hits return themselves.
        assert_eq!(
            index.nearest_at_or_before(Duration::from_secs_f64(997.4)),
            Duration::from_secs_f64(997.4)
        );
    }

    #[test]
    fn test_nearest_before_first_entry_is_source_start() {
        let index = KeyframeIndex::from_timestamps(vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
        ]);
        assert_eq!(
            index.nearest_at_or_before(Duration::from_secs(3)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_cache_builds_once() {
        let cache = KeyframeCache::new(8);
        let prober = SimulationProber::new(Duration::from_secs(2));
        let source = test_source(10);

        let first = cache.get_or_build(&prober, &source).await.unwrap();
        let second = cache.get_or_build(&prober, &source).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_cache_does_not_retain_failures() {
        let cache = KeyframeCache::new(8);
        let source = test_source(10);

        let failing = SimulationProber::failing(ProbeError::ProbeFailed {
            reason: "boom".to_string(),
        });
        assert!(cache.get_or_build(&failing, &source).await.is_err());

        // A later probe with a working prober succeeds.
        let working = SimulationProber::new(Duration::from_secs(2));
        assert!(cache.get_or_build(&working, &source).await.is_ok());
    }

    proptest! {
        #[test]
        fn prop_nearest_result_is_at_or_before_query(
            mut raw in proptest::collection::vec(0u64..7200, 1..64),
            query in 0u64..7200,
        ) {
            raw.sort_unstable();
            let index = KeyframeIndex::from_timestamps(
                raw.iter().map(|&s| Duration::from_secs(s)).collect(),
            );
            let query = Duration::from_secs(query);
            let nearest = index.nearest_at_or_before(query);

            prop_assert!(nearest <= query);
            // Every indexed timestamp in (nearest, query] would contradict
            // the "greatest at or before" contract.
            for &ts in index.timestamps() {
                prop_assert!(!(ts > nearest && ts <= query));
            }
        }
    }
}
