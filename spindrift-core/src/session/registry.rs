//! Process-wide session registry and lifecycle management.
//!
//! The registry is the one piece of intentionally process-wide state:
//! created on server start, drained on shutdown. It enforces the session
//! concurrency cap with least-recently-accessed eviction, owns the quota
//! ledger and keyframe cache, and sweeps idle sessions in the background
//! through the same stop path explicit termination uses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{SessionError, SessionId, SessionState, TranscodeSession};
use crate::config::SpindriftConfig;
use crate::encoder::EncoderBackend;
use crate::media::MediaSource;
use crate::probe::{KeyframeCache, MediaProber};
use crate::profile::{ClientCapabilities, resolve_profile};
use crate::quota::{DiskQuotaManager, QuotaError, QuotaUsage};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session registry at capacity ({capacity}) with no evictable session")]
    RegistryFull { capacity: usize },

    #[error("Session not found: {id}")]
    SessionNotFound { id: SessionId },

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Registry statistics for health and status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub capacity: usize,
    pub quota: QuotaUsage,
}

/// Process-wide bookkeeping of all active transcode sessions.
pub struct SessionRegistry {
    config: SpindriftConfig,
    quota: Arc<DiskQuotaManager>,
    backend: Arc<dyn EncoderBackend>,
    prober: Arc<dyn MediaProber>,
    keyframes: KeyframeCache,
    sessions: RwLock<HashMap<SessionId, Arc<TranscodeSession>>>,
    reaper: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Create new registry and start its background idle sweep.
    pub fn new(
        config: SpindriftConfig,
        backend: Arc<dyn EncoderBackend>,
        prober: Arc<dyn MediaProber>,
    ) -> Arc<Self> {
        if let Err(e) = std::fs::create_dir_all(&config.session.workdir) {
            warn!(
                "Failed to create working area root {}: {}",
                config.session.workdir.display(),
                e
            );
        }

        let registry = Arc::new(Self {
            quota: Arc::new(DiskQuotaManager::new(&config.quota)),
            keyframes: KeyframeCache::new(config.probe.cache_entries),
            config,
            backend,
            prober,
            sessions: RwLock::new(HashMap::new()),
            reaper: parking_lot::Mutex::new(None),
        });

        let handle = {
            let weak = Arc::downgrade(&registry);
            let interval = registry.config.session.reap_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(registry) = weak.upgrade() else {
                        break;
                    };
                    registry.reap_idle().await;
                }
            })
        };
        *registry.reaper.lock() = Some(handle);

        registry
    }

    /// Shared quota ledger.
    pub fn quota(&self) -> &Arc<DiskQuotaManager> {
        &self.quota
    }

    /// Create a session for the source and start encoding at `start_offset`.
    ///
    /// Order matters: the quota reservation is checked before any process
    /// is spawned or any registry entry created, and the concurrency cap is
    /// enforced by evicting the least-recently-accessed `Idle`/`Streaming`
    /// session when at capacity.
    ///
    /// # Errors
    /// - `RegistryError::Quota` - No disk headroom for a new encode run
    /// - `RegistryError::RegistryFull` - At capacity with every session
    ///   mid-seek
    pub async fn create_session(
        self: &Arc<Self>,
        source: MediaSource,
        caps: &ClientCapabilities,
        start_offset: Duration,
    ) -> Result<Arc<TranscodeSession>, RegistryError> {
        let profile = resolve_profile(&source, caps, self.config.encoder.segment_duration);
        let id = SessionId::new();

        // Fail-fast quota check before anything else exists.
        let remaining = source.duration.saturating_sub(start_offset);
        let reservation = profile
            .estimated_bytes(remaining, &source)
            .min(self.config.quota.run_reservation_bytes);
        self.quota.reserve(id, reservation)?;

        // Keyframe alignment is best effort: a failed probe only disables
        // seek alignment for this session.
        let keyframes = match self.keyframes.get_or_build(self.prober.as_ref(), &source).await {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(
                    "Keyframe probe failed for {}, falling back to exact offsets: {}",
                    source.id, e
                );
                None
            }
        };

        let session = Arc::new(TranscodeSession::new(
            id,
            source,
            profile,
            keyframes,
            Arc::clone(&self.backend),
            Arc::clone(&self.quota),
            self.config.session.clone(),
            self.config.encoder.clone(),
            self.config.quota.run_reservation_bytes,
        ));

        if let Err(e) = self.admit(id, Arc::clone(&session)).await {
            self.quota.drop_session(id);
            return Err(e);
        }

        if let Err(e) = session.start(start_offset).await {
            self.remove_session(id, "failed to start encoding").await;
            return Err(e.into());
        }

        info!(
            "Created session {} for {} ({} mode, offset {:?})",
            id,
            session.source().id,
            session.profile().mode.label(),
            start_offset
        );
        Ok(session)
    }

    /// Insert under the cap, evicting the LRU session if needed.
    async fn admit(
        self: &Arc<Self>,
        id: SessionId,
        session: Arc<TranscodeSession>,
    ) -> Result<(), RegistryError> {
        let capacity = self.config.session.max_sessions;

        loop {
            let victim = {
                let mut sessions = self.sessions.write().await;
                if sessions.len() < capacity {
                    sessions.insert(id, Arc::clone(&session));
                    return Ok(());
                }

                // Sessions mid-seek are never evicted mid-transition.
                let victim_id = sessions
                    .values()
                    .filter(|s| {
                        matches!(
                            s.state(),
                            SessionState::Idle | SessionState::Streaming
                        )
                    })
                    .max_by_key(|s| s.idle_for())
                    .map(|s| s.id());

                match victim_id.and_then(|vid| sessions.remove(&vid)) {
                    Some(victim) => victim,
                    None => return Err(RegistryError::RegistryFull { capacity }),
                }
            };

            info!(
                "Evicting least-recently-accessed session {} for new admission",
                victim.id()
            );
            victim.stop("evicted: registry at capacity").await;
            self.quota.drop_session(victim.id());
            victim.remove_working_area();
        }
    }

    /// Look up a session by id.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` - Unknown or already removed id
    pub async fn session(&self, id: SessionId) -> Result<Arc<TranscodeSession>, RegistryError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&id)
            .cloned()
            .ok_or(RegistryError::SessionNotFound { id })
    }

    /// Stop and remove a session, reclaiming its disk footprint.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` - Unknown or already removed id
    pub async fn stop_session(&self, id: SessionId, reason: &str) -> Result<(), RegistryError> {
        match self.remove_session(id, reason).await {
            true => Ok(()),
            false => Err(RegistryError::SessionNotFound { id }),
        }
    }

    /// Shared removal path for explicit stop, reap, and failed starts.
    async fn remove_session(&self, id: SessionId, reason: &str) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&id)
        };

        match session {
            Some(session) => {
                session.stop(reason).await;
                self.quota.drop_session(id);
                session.remove_working_area();
                debug!("Removed session {}: {}", id, reason);
                true
            }
            None => false,
        }
    }

    /// Sweep sessions idle past the configured threshold.
    ///
    /// Uses the same stop path as explicit termination. Sessions mid-seek
    /// are skipped and picked up on a later sweep.
    pub async fn reap_idle(&self) {
        let idle_timeout = self.config.session.idle_timeout;
        let stale: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.idle_for() > idle_timeout)
                .filter(|s| !matches!(s.state(), SessionState::Seeking))
                .map(|s| s.id())
                .collect()
        };

        for id in stale {
            info!("Reaping idle session {}", id);
            self.remove_session(id, "idle timeout").await;
        }
    }

    /// Drain every session and stop the background sweep.
    ///
    /// The registry contract: create on server start, call this once on
    /// server shutdown.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }

        let ids: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions.keys().copied().collect()
        };
        for id in ids {
            self.remove_session(id, "server shutting down").await;
        }
        info!("Session registry drained");
    }

    /// Current registry statistics.
    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read().await;
        RegistryStats {
            active_sessions: sessions.len(),
            capacity: self.config.session.max_sessions,
            quota: self.quota.usage(),
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}
